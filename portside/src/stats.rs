//! Per-server statistics.
//!
//! One `ServerStats` per `Server`, shared by reference with every
//! connection driver. All increments are relaxed atomics; reads are
//! eventually-consistent snapshots. The process-wide metriken metrics in
//! [`crate::metrics`] are incremented at the same call sites.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::metrics;

/// Shared counter block for one server.
#[derive(Default)]
pub struct ServerStats {
    bytes_read: AtomicU64,
    bytes_sent: AtomicU64,
    completed_requests: AtomicU64,
    active_requests: AtomicI64,
    invalid_http_requests: AtomicU64,
    rejected_due_to_overload: AtomicU64,
    failed_to_connect: AtomicU64,
    active_connections: AtomicI64,
}

/// Point-in-time copy of a server's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_read: u64,
    pub bytes_sent: u64,
    pub completed_requests: u64,
    pub active_requests: i64,
    pub invalid_http_requests: u64,
    pub rejected_due_to_overload: u64,
    pub failed_to_connect: u64,
    pub active_connections: i64,
}

impl ServerStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            completed_requests: self.completed_requests.load(Ordering::Relaxed),
            active_requests: self.active_requests.load(Ordering::Relaxed),
            invalid_http_requests: self.invalid_http_requests.load(Ordering::Relaxed),
            rejected_due_to_overload: self.rejected_due_to_overload.load(Ordering::Relaxed),
            failed_to_connect: self.failed_to_connect.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }

    pub fn on_bytes_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
        metrics::BYTES_READ.add(n);
    }

    pub fn on_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
        metrics::BYTES_SENT.add(n);
    }

    pub fn on_request_started(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
        metrics::ACTIVE_REQUESTS.increment();
    }

    pub fn on_request_ended(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
        self.completed_requests.fetch_add(1, Ordering::Relaxed);
        metrics::ACTIVE_REQUESTS.decrement();
        metrics::REQUESTS_COMPLETED.increment();
    }

    pub fn on_invalid_request(&self) {
        self.invalid_http_requests.fetch_add(1, Ordering::Relaxed);
        metrics::INVALID_REQUESTS.increment();
    }

    pub fn on_rejected_overload(&self) {
        self.rejected_due_to_overload.fetch_add(1, Ordering::Relaxed);
        metrics::REJECTED_OVERLOAD.increment();
    }

    pub fn on_timed_out(&self) {
        metrics::REQUESTS_TIMED_OUT.increment();
    }

    pub fn on_failed_to_connect(&self) {
        self.failed_to_connect.fetch_add(1, Ordering::Relaxed);
        metrics::FAILED_TO_CONNECT.increment();
    }

    pub fn on_connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        metrics::ACTIVE_CONNECTIONS.increment();
        metrics::CONNECTIONS_ACCEPTED.increment();
    }

    pub fn on_connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        metrics::ACTIVE_CONNECTIONS.decrement();
        metrics::CONNECTIONS_CLOSED.increment();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let stats = ServerStats::new();
        stats.on_connection_opened();
        stats.on_request_started();
        stats.on_bytes_read(100);
        stats.on_bytes_sent(50);
        stats.on_request_ended();
        stats.on_invalid_request();
        stats.on_rejected_overload();
        stats.on_failed_to_connect();

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_read, 100);
        assert_eq!(snap.bytes_sent, 50);
        assert_eq!(snap.completed_requests, 1);
        assert_eq!(snap.active_requests, 0);
        assert_eq!(snap.invalid_http_requests, 1);
        assert_eq!(snap.rejected_due_to_overload, 1);
        assert_eq!(snap.failed_to_connect, 1);
        assert_eq!(snap.active_connections, 1);

        stats.on_connection_closed();
        assert_eq!(stats.snapshot().active_connections, 0);
    }
}
