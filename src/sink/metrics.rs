//! Metrics counter contract.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counter sink fed by every data-plane component.
///
/// All operations are lock-free on the provided implementations; the data
/// path calls these inline.
pub trait MetricsSink: Send + Sync {
    /// A connection became active.
    fn inc_active_connections(&self);

    /// A connection ended.
    fn dec_active_connections(&self);

    /// A connection was ever established.
    fn inc_total_connections(&self);

    /// A connection was rejected or failed to establish.
    fn inc_connection_errors(&self);

    /// A payload failed to transfer (write failure, buffer overflow).
    fn inc_transfer_errors(&self);

    /// Payload bytes moved through the relay.
    fn add_bytes_transferred(&self, bytes: u64);

    /// A forwarding rule was activated.
    fn inc_forwarding_rules(&self);

    /// A forwarding rule was deactivated.
    fn dec_forwarding_rules(&self);
}

/// Point-in-time view of the atomic metrics sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Currently active connections.
    pub active_connections: i64,

    /// Connections ever established.
    pub total_connections: u64,

    /// Rejected or failed connection attempts.
    pub connection_errors: u64,

    /// Failed payload transfers.
    pub transfer_errors: u64,

    /// Total payload bytes moved.
    pub bytes_transferred: u64,

    /// Currently active forwarding rules.
    pub forwarding_rules: i64,
}

/// Lock-free metrics sink for embedding and tests.
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    active_connections: AtomicI64,
    total_connections: AtomicU64,
    connection_errors: AtomicU64,
    transfer_errors: AtomicU64,
    bytes_transferred: AtomicU64,
    forwarding_rules: AtomicI64,
}

impl AtomicMetrics {
    /// Create a zeroed sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every counter at once.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            transfer_errors: self.transfer_errors.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            forwarding_rules: self.forwarding_rules.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for AtomicMetrics {
    fn inc_active_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn dec_active_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    fn inc_total_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_connection_errors(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_transfer_errors(&self) {
        self.transfer_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn add_bytes_transferred(&self, bytes: u64) {
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    fn inc_forwarding_rules(&self) {
        self.forwarding_rules.fetch_add(1, Ordering::Relaxed);
    }

    fn dec_forwarding_rules(&self) {
        self.forwarding_rules.fetch_sub(1, Ordering::Relaxed);
    }
}
