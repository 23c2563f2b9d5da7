//! Endpoint counters
//!
//! Counters only ever grow. Take a [`MetricsSnapshot`] to read them
//! consistently or to serialize them.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by one endpoint and all of its connections
#[derive(Debug, Default)]
pub struct EndpointMetrics {
    /// Connections that reached `Open`
    connections_opened: AtomicU64,

    /// Open connections that closed afterwards
    connections_closed: AtomicU64,

    messages_sent: AtomicU64,

    messages_received: AtomicU64,

    /// Messages rejected by a connection (too large, retries exhausted, closed)
    send_failures: AtomicU64,

    /// Sockets dropped by the duplicate tie-break
    duplicate_sockets: AtomicU64,

    /// Inbound handshakes refused for missing parameters
    handshake_rejections: AtomicU64,

    /// Answers and candidates discarded for a stale connection id
    stale_signals: AtomicU64,

    /// Connections replaced by a new negotiation round
    replacements: AtomicU64,
}

impl EndpointMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate_socket(&self) {
        self.duplicate_sockets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handshake_rejection(&self) {
        self.handshake_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_signal(&self) {
        self.stale_signals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replacement(&self) {
        self.replacements.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            duplicate_sockets: self.duplicate_sockets.load(Ordering::Relaxed),
            handshake_rejections: self.handshake_rejections.load(Ordering::Relaxed),
            stale_signals: self.stale_signals.load(Ordering::Relaxed),
            replacements: self.replacements.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EndpointMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub send_failures: u64,
    pub duplicate_sockets: u64,
    pub handshake_rejections: u64,
    pub stale_signals: u64,
    pub replacements: u64,
}

impl MetricsSnapshot {
    /// Connections currently open according to the counters
    pub fn open_connections(&self) -> u64 {
        self.connections_opened
            .saturating_sub(self.connections_closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = EndpointMetrics::new();
        metrics.record_opened();
        metrics.record_opened();
        metrics.record_closed();
        metrics.record_sent();
        metrics.record_stale_signal();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_opened, 2);
        assert_eq!(snapshot.open_connections(), 1);
        assert_eq!(snapshot.messages_sent, 1);
        assert_eq!(snapshot.stale_signals, 1);
        assert_eq!(snapshot.replacements, 0);
    }

    #[test]
    fn test_snapshot_serializes_to_json() {
        let metrics = EndpointMetrics::new();
        metrics.record_duplicate_socket();

        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["duplicate_sockets"], 1);
        assert_eq!(json["messages_received"], 0);
    }
}
