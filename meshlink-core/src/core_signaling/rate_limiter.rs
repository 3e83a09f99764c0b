/*
    Rate Limiter - fixed window per signaling connection

    Each connection may send `max_messages` frames per `window`. The window
    restarts on the first frame after it elapses. Owned by the signaling
    actor, so no locking.
*/

use crate::types::ConnId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_messages: u32,
    windows: HashMap<ConnId, Window>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_messages: u32) -> Self {
        RateLimiter {
            window,
            max_messages,
            windows: HashMap::new(),
        }
    }

    /// Count one frame. Returns false when the connection is over its limit.
    pub fn check(&mut self, conn_id: ConnId, now: Instant) -> bool {
        let window = self.windows.entry(conn_id).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(window.started) >= self.window {
            window.started = now;
            window.count = 0;
        }

        if window.count >= self.max_messages {
            trace!(conn_id, count = window.count, "Rate limit hit");
            return false;
        }
        window.count += 1;
        true
    }

    /// Drop state for a closed connection
    pub fn forget(&mut self, conn_id: ConnId) {
        self.windows.remove(&conn_id);
    }

    pub fn tracked_connections(&self) -> usize {
        self.windows.len()
    }
}
