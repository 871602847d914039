//! Persisted connection records.

use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::rule::Protocol;

/// Lifecycle state of a tracked connection.
///
/// Transitions are one-way: `Connecting` -> `Connected` -> one of
/// `Disconnected`, `Error`, `Timeout`. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Dial or registration in progress.
    Connecting,
    /// Live and transferring.
    Connected,
    /// Closed normally.
    Disconnected,
    /// Closed by a transport error.
    Error,
    /// Closed by idle timeout.
    Timeout,
}

impl ConnectionStatus {
    /// Whether the state admits no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionStatus::Disconnected | ConnectionStatus::Error | ConnectionStatus::Timeout
        )
    }

    /// Whether moving to `next` respects the one-way lifecycle.
    #[must_use]
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        match self {
            ConnectionStatus::Connecting => next != ConnectionStatus::Connecting,
            ConnectionStatus::Connected => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Connecting => write!(f, "CONNECTING"),
            ConnectionStatus::Connected => write!(f, "CONNECTED"),
            ConnectionStatus::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionStatus::Error => write!(f, "ERROR"),
            ConnectionStatus::Timeout => write!(f, "TIMEOUT"),
        }
    }
}

/// A connection record as handed to the persistence sink.
///
/// Identity is the stable `connection_id`. Byte and packet counters are
/// monotonically non-decreasing; the sink applies `update_traffic` deltas
/// additively.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionRecord {
    /// Stable identity for the connection.
    pub connection_id: Uuid,

    /// Forwarding rule this connection belongs to.
    pub rule_id: i64,

    /// Transport of this connection.
    pub protocol: Protocol,

    /// Listener-side port.
    pub local_port: u16,

    /// Remote peer address.
    pub remote_addr: IpAddr,

    /// Remote peer port.
    pub remote_port: u16,

    /// Current lifecycle state.
    pub status: ConnectionStatus,

    /// When the connection was established.
    pub connected_at: DateTime<Utc>,

    /// When the connection reached a terminal state.
    pub disconnected_at: Option<DateTime<Utc>>,

    /// Bytes received from the remote peer.
    pub bytes_rx: u64,

    /// Bytes sent to the remote peer.
    pub bytes_tx: u64,

    /// Packets received from the remote peer.
    pub packets_rx: u64,

    /// Packets sent to the remote peer.
    pub packets_tx: u64,

    /// Last observed activity.
    pub last_active_at: DateTime<Utc>,

    /// Cause message for `Error` records.
    pub error_message: Option<String>,
}

impl ConnectionRecord {
    /// Create a record in the `Connecting` state with a fresh UUID.
    #[must_use]
    pub fn new(rule_id: i64, protocol: Protocol, local_port: u16, remote: SocketAddr) -> Self {
        let now = Utc::now();
        Self {
            connection_id: Uuid::new_v4(),
            rule_id,
            protocol,
            local_port,
            remote_addr: remote.ip(),
            remote_port: remote.port(),
            status: ConnectionStatus::Connecting,
            connected_at: now,
            disconnected_at: None,
            bytes_rx: 0,
            bytes_tx: 0,
            packets_rx: 0,
            packets_tx: 0,
            last_active_at: now,
            error_message: None,
        }
    }

    /// Move to `status` if the one-way lifecycle permits it.
    ///
    /// Terminal states stamp `disconnected_at`. Returns `false` (leaving the
    /// record untouched) for an illegal transition.
    pub fn transition(&mut self, status: ConnectionStatus) -> bool {
        if !self.status.can_transition_to(status) {
            return false;
        }
        self.status = status;
        if status.is_terminal() {
            self.disconnected_at = Some(Utc::now());
        }
        true
    }

    /// Mark the record `Error` with a cause message.
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        let moved = self.transition(ConnectionStatus::Error);
        if moved {
            self.error_message = Some(message.into());
        }
        moved
    }

    /// Refresh the activity timestamp.
    pub fn touch(&mut self) {
        self.last_active_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn record() -> ConnectionRecord {
        ConnectionRecord::new(
            1,
            Protocol::Tcp,
            9000,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 50000),
        )
    }

    #[test]
    fn test_lifecycle_one_way() {
        let mut rec = record();
        assert_eq!(rec.status, ConnectionStatus::Connecting);

        assert!(rec.transition(ConnectionStatus::Connected));
        assert!(rec.transition(ConnectionStatus::Disconnected));
        assert!(rec.disconnected_at.is_some());

        // Terminal states never move again.
        assert!(!rec.transition(ConnectionStatus::Connected));
        assert!(!rec.transition(ConnectionStatus::Error));
        assert_eq!(rec.status, ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_connected_cannot_regress() {
        let mut rec = record();
        rec.transition(ConnectionStatus::Connected);
        assert!(!rec.transition(ConnectionStatus::Connecting));
        assert!(rec.transition(ConnectionStatus::Timeout));
    }

    #[test]
    fn test_fail_records_message() {
        let mut rec = record();
        rec.transition(ConnectionStatus::Connected);
        assert!(rec.fail("connection reset by peer"));
        assert_eq!(rec.status, ConnectionStatus::Error);
        assert_eq!(rec.error_message.as_deref(), Some("connection reset by peer"));
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(record().connection_id, record().connection_id);
    }
}
