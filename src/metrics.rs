//! Process-wide relay counters.
//!
//! One `RelayMetrics` instance is shared by every listener, forwarder, and
//! the health endpoint. Counters are monotonic except
//! `active_connections`, which is incremented on accept and decremented
//! when the connection handler exits.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared relay counters, incremented from the ingest and forward paths.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    pub records_received: AtomicU64,
    pub records_stored: AtomicU64,
    pub records_forwarded: AtomicU64,
    pub forward_retries: AtomicU64,
    pub forward_failures: AtomicU64,
    pub dlq_writes: AtomicU64,
    pub invalid_json: AtomicU64,
    pub oversize: AtomicU64,
    pub acl_denied: AtomicU64,
    pub active_connections: AtomicU64,
}

/// Point-in-time copy of the counters, serialised by the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub records_received: u64,
    pub records_stored: u64,
    pub records_forwarded: u64,
    pub forward_retries: u64,
    pub forward_failures: u64,
    pub dlq_writes: u64,
    pub invalid_json: u64,
    pub oversize: u64,
    pub acl_denied: u64,
    pub active_connections: u64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_received: self.records_received.load(Ordering::Relaxed),
            records_stored: self.records_stored.load(Ordering::Relaxed),
            records_forwarded: self.records_forwarded.load(Ordering::Relaxed),
            forward_retries: self.forward_retries.load(Ordering::Relaxed),
            forward_failures: self.forward_failures.load(Ordering::Relaxed),
            dlq_writes: self.dlq_writes.load(Ordering::Relaxed),
            invalid_json: self.invalid_json.load(Ordering::Relaxed),
            oversize: self.oversize.load(Ordering::Relaxed),
            acl_denied: self.acl_denied.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }
}

/// Bump a counter by one.
pub(crate) fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Decrement a counter by one (used for the active-connection gauge).
pub(crate) fn dec(counter: &AtomicU64) {
    counter.fetch_sub(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let m = RelayMetrics::new();
        inc(&m.records_received);
        inc(&m.records_received);
        inc(&m.dlq_writes);
        let snap = m.snapshot();
        assert_eq!(snap.records_received, 2);
        assert_eq!(snap.dlq_writes, 1);
        assert_eq!(snap.records_stored, 0);
    }

    #[test]
    fn active_connections_gauge_goes_up_and_down() {
        let m = RelayMetrics::new();
        inc(&m.active_connections);
        inc(&m.active_connections);
        dec(&m.active_connections);
        assert_eq!(m.snapshot().active_connections, 1);
    }
}
