//! Metrics for signaling, connections, synchronization and storage
//!
//! Recorded through the `metrics` facade. Nothing is exported unless the
//! binary installs a recorder (the CLI installs the Prometheus exporter when
//! metrics are enabled), so recording from library code is always cheap.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Instant;

/// Initialize metric descriptions (call once at startup)
pub fn init_metrics() {
    // Signaling
    describe_counter!("meshlink_peers_registered_total", "Total peer registrations accepted");
    describe_counter!(
        "meshlink_peers_removed_total",
        format!(
            "Total peers removed, labeled by reason ({})",
            RemovalReason::ALL.map(|r| r.as_str()).join(", ")
        )
    );
    describe_counter!(
        "meshlink_signals_total",
        "Relayed signals, labeled by result (relayed, dropped)"
    );
    describe_counter!(
        "meshlink_signaling_rate_limited_total",
        "Signaling messages dropped by the per-connection rate limit"
    );
    describe_gauge!("meshlink_registered_peers", "Currently registered peers");
    describe_gauge!("meshlink_rooms", "Currently known rooms");

    // Connections
    describe_counter!(
        "meshlink_connection_transitions_total",
        "Direct transport state transitions, labeled by target state"
    );
    describe_histogram!("meshlink_connection_rtt_ms", "Sampled round-trip time in milliseconds");
    describe_counter!(
        "meshlink_link_reconnects_total",
        "Signaling link reconnect attempts"
    );

    // Synchronization
    describe_counter!("meshlink_messages_created_total", "Messages authored locally");
    describe_counter!(
        "meshlink_messages_received_total",
        "Messages received, labeled by outcome (delivered, buffered, duplicate, rejected)"
    );
    describe_counter!("meshlink_conflicts_total", "Concurrent message pairs detected");
    describe_counter!(
        "meshlink_messages_undeliverable_total",
        "Pending messages dropped at the retention horizon"
    );
    describe_gauge!("meshlink_pending_messages", "Messages waiting for causal dependencies");

    // Store
    describe_counter!("meshlink_store_flushes_total", "Store batch flushes, labeled by result");
    describe_histogram!("meshlink_store_flush_duration_ms", "Store flush duration in milliseconds");
    describe_gauge!("meshlink_store_queue_depth", "Writes waiting for the next flush");
}

pub fn peer_registered() {
    counter!("meshlink_peers_registered_total").increment(1);
}

/// Why a registration ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Re-registration on the same connection
    Replaced,
    Disconnect,
    LivenessTimeout,
}

impl RemovalReason {
    pub const ALL: [RemovalReason; 3] = [
        RemovalReason::Replaced,
        RemovalReason::Disconnect,
        RemovalReason::LivenessTimeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RemovalReason::Replaced => "replaced",
            RemovalReason::Disconnect => "disconnect",
            RemovalReason::LivenessTimeout => "liveness_timeout",
        }
    }
}

pub fn peer_removed(reason: RemovalReason) {
    counter!("meshlink_peers_removed_total", "reason" => reason.as_str()).increment(1);
}

pub fn signal_relayed() {
    counter!("meshlink_signals_total", "result" => "relayed").increment(1);
}

pub fn signal_dropped() {
    counter!("meshlink_signals_total", "result" => "dropped").increment(1);
}

pub fn signaling_rate_limited() {
    counter!("meshlink_signaling_rate_limited_total").increment(1);
}

pub fn registry_size(peers: usize, rooms: usize) {
    gauge!("meshlink_registered_peers").set(peers as f64);
    gauge!("meshlink_rooms").set(rooms as f64);
}

pub fn connection_transition(state: &'static str) {
    counter!("meshlink_connection_transitions_total", "state" => state).increment(1);
}

pub fn connection_rtt(millis: f64) {
    histogram!("meshlink_connection_rtt_ms").record(millis);
}

pub fn link_reconnect() {
    counter!("meshlink_link_reconnects_total").increment(1);
}

pub fn message_created() {
    counter!("meshlink_messages_created_total").increment(1);
}

pub fn message_received(outcome: &'static str) {
    counter!("meshlink_messages_received_total", "outcome" => outcome).increment(1);
}

pub fn conflicts_detected(count: usize) {
    counter!("meshlink_conflicts_total").increment(count as u64);
}

pub fn messages_undeliverable(count: usize) {
    counter!("meshlink_messages_undeliverable_total").increment(count as u64);
}

pub fn pending_messages(count: usize) {
    gauge!("meshlink_pending_messages").set(count as f64);
}

pub fn store_flush(ok: bool) {
    let result = if ok { "ok" } else { "failed" };
    counter!("meshlink_store_flushes_total", "result" => result).increment(1);
}

pub fn store_queue_depth(depth: usize) {
    gauge!("meshlink_store_queue_depth").set(depth as f64);
}

/// Timer for measuring operation duration
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    /// Create a new timer
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Stop the timer and record the duration in milliseconds
    pub fn stop(self) {
        let duration = self.start.elapsed();
        histogram!(self.name).record(duration.as_secs_f64() * 1000.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init() {
        // Without an installed recorder every call is a no-op
        init_metrics();
        peer_registered();
        message_received("buffered");
        store_flush(false);
    }

    #[test]
    fn test_removal_reason_labels() {
        let labels: Vec<_> = RemovalReason::ALL.iter().map(|r| r.as_str()).collect();
        assert_eq!(labels, vec!["replaced", "disconnect", "liveness_timeout"]);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::new("meshlink_store_flush_duration_ms");
        std::thread::sleep(std::time::Duration::from_millis(1));
        timer.stop();
    }
}
