/*
    SyncEngine - causal delivery over vector clocks

    Owns the local clock, the bounded message history and the pending buffer.

    Receiving a message:
    1. duplicate if its id is known, or its author's counter is not ahead of
       what has already been delivered from that author
    2. deliverable when
       - every dependency is in history (or was pruned from it)
       - the author's entry is exactly one past the known counter
       - no other entry is ahead of the local clock
    3. delivered messages merge into the clock, enter history and are
       checked for conflicts; the pending buffer is then re-scanned until
       nothing more becomes deliverable
    4. anything else waits in the pending buffer until delivered or expired

    Conflicts: same room, timestamps within the window, neither depends on
    the other, concurrent clocks. Display order of concurrent messages is
    by id; room_timeline gives a causal order with the same tie-break.
*/

use super::message::{MessageId, MessageKind, SyncMessage};
use super::vector_clock::VectorClock;
use crate::config::SyncConfig;
use crate::events::{EventBus, SubscriptionId};
use crate::metrics;
use crate::types::{PeerId, RoomId, Timestamp};
use hashlink::LruCache;
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

const MIN_RETIRED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Delivered(SyncMessage),
    /// Concurrent messages in resolved (id) order
    Conflict {
        room: RoomId,
        messages: Vec<MessageId>,
    },
    /// Pending message dropped at the retention horizon
    Undeliverable(SyncMessage),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveOutcome {
    Duplicate,
    Buffered,
    /// The received message followed by any pending messages it unblocked
    Delivered(Vec<SyncMessage>),
    Rejected(String),
}

/// One page of a sync response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncBatch {
    pub messages: Vec<SyncMessage>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub pruned_history: usize,
    pub dropped_pending: usize,
}

/// Buffered message with its local arrival time; expiry never trusts the
/// author's timestamp
struct Pending {
    arrived: Timestamp,
    message: SyncMessage,
}

pub struct SyncEngine {
    local: PeerId,
    config: SyncConfig,
    clock: VectorClock,
    history: HashMap<MessageId, SyncMessage>,
    /// History ids in local delivery order
    order: VecDeque<MessageId>,
    pending: HashMap<MessageId, Pending>,
    /// Ids pruned from history, still satisfying dependencies
    retired: LruCache<MessageId, ()>,
    events: EventBus<SyncEvent>,
}

impl SyncEngine {
    pub fn new(local: PeerId, config: SyncConfig) -> Self {
        let retired_capacity = (config.max_history * 4).max(MIN_RETIRED_CAPACITY);
        SyncEngine {
            local,
            config,
            clock: VectorClock::new(),
            history: HashMap::new(),
            order: VecDeque::new(),
            pending: HashMap::new(),
            retired: LruCache::new(retired_capacity),
            events: EventBus::new(),
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<SyncEvent>) {
        self.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn create_message(
        &mut self,
        content: impl Into<String>,
        room: RoomId,
        kind: MessageKind,
    ) -> SyncMessage {
        self.create_message_at(content, room, kind, None, Timestamp::now())
    }

    /// Author a message with an explicit recipient and timestamp
    pub fn create_message_at(
        &mut self,
        content: impl Into<String>,
        room: RoomId,
        kind: MessageKind,
        to: Option<PeerId>,
        timestamp: Timestamp,
    ) -> SyncMessage {
        let counter = self.clock.increment(&self.local);

        let skip = self.order.len().saturating_sub(self.config.dependency_count);
        let causality: Vec<MessageId> = self.order.iter().skip(skip).cloned().collect();

        let message = SyncMessage {
            id: MessageId::derive(&self.local, counter, timestamp),
            from: self.local.clone(),
            room,
            to,
            content: content.into(),
            timestamp,
            vector_clock: self.clock.clone(),
            causality,
            kind,
        };

        debug!(id = %message.id, counter, room = %message.room, "Message created");
        metrics::message_created();
        self.insert_history(message.clone());
        self.enforce_max_history();
        message
    }

    pub fn receive_message(&mut self, message: SyncMessage) -> ReceiveOutcome {
        self.receive_message_at(message, Timestamp::now())
    }

    /// Receive with an explicit local arrival time
    pub fn receive_message_at(&mut self, message: SyncMessage, arrived: Timestamp) -> ReceiveOutcome {
        if self.history.contains_key(&message.id) || self.pending.contains_key(&message.id) {
            metrics::message_received("duplicate");
            return ReceiveOutcome::Duplicate;
        }

        let counter = message.sender_counter();
        if counter == 0 || !message.has_valid_id() {
            debug!(id = %message.id, from = %message.from, "Rejecting message with inconsistent id");
            metrics::message_received("rejected");
            return ReceiveOutcome::Rejected(format!(
                "id {} does not match author {} counter {}",
                message.id, message.from, counter
            ));
        }
        if counter <= self.clock.get(&message.from) {
            metrics::message_received("duplicate");
            return ReceiveOutcome::Duplicate;
        }

        if !is_deliverable(&self.clock, &self.history, &mut self.retired, &message) {
            trace!(id = %message.id, from = %message.from, counter, "Buffering message");
            self.pending
                .insert(message.id.clone(), Pending { arrived, message });
            metrics::message_received("buffered");
            metrics::pending_messages(self.pending.len());
            return ReceiveOutcome::Buffered;
        }

        let mut delivered = vec![self.deliver(message)];
        delivered.extend(self.drain_pending());
        metrics::message_received("delivered");
        ReceiveOutcome::Delivered(delivered)
    }

    pub fn create_sync_request(&self) -> VectorClock {
        self.clock.clone()
    }

    /// History entries the requester has not seen, in delivery order
    pub fn handle_sync_request(&self, peer_clock: &VectorClock) -> SyncBatch {
        let mut missing = self
            .order
            .iter()
            .filter_map(|id| self.history.get(id))
            .filter(|m| m.sender_counter() > peer_clock.get(&m.from));

        let messages: Vec<SyncMessage> = missing
            .by_ref()
            .take(self.config.sync_batch_limit)
            .cloned()
            .collect();
        let has_more = missing.next().is_some();

        SyncBatch { messages, has_more }
    }

    /// The `count` most recently delivered messages, oldest first
    pub fn get_gossip_messages(&self, count: usize) -> Vec<SyncMessage> {
        let skip = self.order.len().saturating_sub(count);
        self.order
            .iter()
            .skip(skip)
            .filter_map(|id| self.history.get(id))
            .cloned()
            .collect()
    }

    /// Causal order of a room's history, ties broken by id.
    ///
    /// If `a` happened before `b` every clock entry of `b` is at least that
    /// of `a` and one is larger, so ordering by clock total respects
    /// causality even through messages in other rooms.
    pub fn room_timeline(&self, room: &RoomId) -> Vec<SyncMessage> {
        let mut ranked: Vec<(u64, &SyncMessage)> = self
            .history
            .values()
            .filter(|m| &m.room == room)
            .map(|m| (m.vector_clock.total(), m))
            .collect();
        ranked.sort_by(|(ra, a), (rb, b)| ra.cmp(rb).then_with(|| a.id.cmp(&b.id)));
        ranked.into_iter().map(|(_, m)| m.clone()).collect()
    }

    /// Retention sweep: prune history by age and count, drop expired pending
    pub fn maintenance(&mut self, now: Timestamp) -> MaintenanceReport {
        let horizon = now.saturating_sub_millis(self.config.retention.as_millis() as u64);

        let expired: Vec<MessageId> = self
            .history
            .values()
            .filter(|m| m.timestamp < horizon)
            .map(|m| m.id.clone())
            .collect();
        for id in &expired {
            self.retire(id);
        }
        let pruned_history = expired.len() + self.enforce_max_history();

        let stale: Vec<MessageId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.arrived < horizon)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            if let Some(Pending { message, .. }) = self.pending.remove(id) {
                warn!(
                    id = %message.id,
                    from = %message.from,
                    "Dropping message that never became deliverable"
                );
                self.events.publish(SyncEvent::Undeliverable(message));
            }
        }

        if !stale.is_empty() {
            metrics::messages_undeliverable(stale.len());
        }
        metrics::pending_messages(self.pending.len());

        let report = MaintenanceReport {
            pruned_history,
            dropped_pending: stale.len(),
        };
        if report != MaintenanceReport::default() {
            debug!(
                pruned = report.pruned_history,
                dropped = report.dropped_pending,
                "Maintenance sweep"
            );
        }
        report
    }

    pub fn message(&self, id: &MessageId) -> Option<&SyncMessage> {
        self.history.get(id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.history.contains_key(id)
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn deliver(&mut self, message: SyncMessage) -> SyncMessage {
        self.clock.merge(&message.vector_clock);
        self.detect_conflicts(&message);
        self.insert_history(message.clone());
        self.events.publish(SyncEvent::Delivered(message.clone()));
        self.enforce_max_history();
        trace!(id = %message.id, from = %message.from, "Message delivered");
        message
    }

    /// Deliver pending messages until none is deliverable
    fn drain_pending(&mut self) -> Vec<SyncMessage> {
        let mut delivered = Vec::new();
        loop {
            let mut ids: Vec<MessageId> = self.pending.keys().cloned().collect();
            ids.sort();

            let next = ids.into_iter().find(|id| {
                self.pending
                    .get(id)
                    .map(|p| is_deliverable(&self.clock, &self.history, &mut self.retired, &p.message))
                    .unwrap_or(false)
            });

            match next.and_then(|id| self.pending.remove(&id)).map(|p| p.message) {
                Some(message) => delivered.push(self.deliver(message)),
                None => break,
            }
        }
        metrics::pending_messages(self.pending.len());
        delivered
    }

    fn detect_conflicts(&self, message: &SyncMessage) {
        let window = self.config.conflict_window.as_millis() as u64;
        let mut concurrent: Vec<MessageId> = self
            .history
            .values()
            .filter(|other| {
                other.room == message.room
                    && other.timestamp.abs_diff(message.timestamp) < window
                    && !message.depends_on(&other.id)
                    && !other.depends_on(&message.id)
                    && message.vector_clock.is_concurrent(&other.vector_clock)
            })
            .map(|other| other.id.clone())
            .collect();

        if concurrent.is_empty() {
            return;
        }
        concurrent.push(message.id.clone());
        concurrent.sort();

        debug!(room = %message.room, count = concurrent.len(), "Concurrent messages detected");
        metrics::conflicts_detected(1);
        self.events.publish(SyncEvent::Conflict {
            room: message.room.clone(),
            messages: concurrent,
        });
    }

    fn insert_history(&mut self, message: SyncMessage) {
        self.order.push_back(message.id.clone());
        self.history.insert(message.id.clone(), message);
    }

    fn retire(&mut self, id: &MessageId) {
        if self.history.remove(id).is_some() {
            self.order.retain(|existing| existing != id);
            self.retired.insert(id.clone(), ());
        }
    }

    /// Evict oldest-by-timestamp entries over `max_history`
    fn enforce_max_history(&mut self) -> usize {
        let excess = self.history.len().saturating_sub(self.config.max_history);
        if excess == 0 {
            return 0;
        }

        let mut by_age: Vec<(Timestamp, MessageId)> = self
            .history
            .values()
            .map(|m| (m.timestamp, m.id.clone()))
            .collect();
        by_age.sort();
        for (_, id) in by_age.into_iter().take(excess) {
            self.retire(&id);
        }
        excess
    }
}

fn is_deliverable(
    clock: &VectorClock,
    history: &HashMap<MessageId, SyncMessage>,
    retired: &mut LruCache<MessageId, ()>,
    message: &SyncMessage,
) -> bool {
    if message.sender_counter() != clock.get(&message.from) + 1 {
        return false;
    }
    let ahead = message
        .vector_clock
        .iter()
        .any(|(peer, counter)| peer != &message.from && counter > clock.get(peer));
    if ahead {
        return false;
    }
    message
        .causality
        .iter()
        .all(|dep| history.contains_key(dep) || retired.contains_key(dep))
}
