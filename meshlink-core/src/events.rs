//! Subscribe/unsubscribe event fan-out
//!
//! Every subsystem that notifies listeners (connection state, delivered
//! messages, signaling link status) publishes through an [`EventBus`].
//! Subscribers get their own unbounded receiver and are removed either
//! explicitly with [`EventBus::unsubscribe`] or lazily once their receiver
//! has been dropped, so handlers never accumulate across reconnects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Fan-out of cloned events to any number of subscribers
pub struct EventBus<E> {
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<E>>>,
    next_id: AtomicU64,
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        EventBus {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, tx);
        (SubscriptionId(id), rx)
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().remove(&id.0).is_some()
    }

    /// Deliver an event to every live subscriber
    pub fn publish(&self, event: E) {
        let mut subscribers = self.lock();
        subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, mpsc::UnboundedSender<E>>> {
        // Publishing never panics while holding the lock, poisoning is recoverable
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}
