//! Listener status contract.
//!
//! The only way external observers learn about listener health: the engine
//! announces listener creation, the TCP/broadcast paths report client
//! arrivals and departures, and deactivation stops the listener.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::rule::Protocol;

/// Externally visible listener state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Listening, no clients connected.
    WaitingClient,
    /// At least one client connected.
    Active,
    /// Torn down.
    Stopped,
}

impl std::fmt::Display for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerState::WaitingClient => write!(f, "WAITING_CLIENT"),
            ListenerState::Active => write!(f, "ACTIVE"),
            ListenerState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Status of one `(rule, protocol)` listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerStatus {
    /// Forwarding rule the listener serves.
    pub rule_id: i64,

    /// Bound port.
    pub port: u16,

    /// TCP or UDP half of the rule.
    pub protocol: Protocol,

    /// Connected client count; never negative.
    pub current_clients: u32,

    /// Derived state: `Active` while clients > 0, else `WaitingClient`,
    /// `Stopped` after teardown.
    pub state: ListenerState,
}

/// Listener status sink.
pub trait ListenerStatusSink: Send + Sync {
    /// Announce a newly bound listener.
    fn create_listener(&self, rule_id: i64, port: u16, protocol: Protocol);

    /// Mark the listener as waiting for its first client.
    fn set_waiting(&self, rule_id: i64, protocol: Protocol);

    /// A client connected to the listener.
    fn on_client_connected(&self, rule_id: i64, protocol: Protocol);

    /// A client disconnected from the listener.
    fn on_client_disconnected(&self, rule_id: i64, protocol: Protocol);

    /// Tear down every listener of the rule.
    fn stop_listener(&self, rule_id: i64);
}

/// In-memory listener status tracker for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryListenerStatus {
    listeners: RwLock<HashMap<(i64, Protocol), ListenerStatus>>,
}

impl MemoryListenerStatus {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status of one listener.
    #[must_use]
    pub fn get(&self, rule_id: i64, protocol: Protocol) -> Option<ListenerStatus> {
        self.listeners
            .read()
            .expect("listeners lock poisoned")
            .get(&(rule_id, protocol))
            .cloned()
    }

    /// Snapshot of every tracked listener.
    #[must_use]
    pub fn all(&self) -> Vec<ListenerStatus> {
        self.listeners
            .read()
            .expect("listeners lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

impl ListenerStatusSink for MemoryListenerStatus {
    fn create_listener(&self, rule_id: i64, port: u16, protocol: Protocol) {
        self.listeners
            .write()
            .expect("listeners lock poisoned")
            .insert(
                (rule_id, protocol),
                ListenerStatus {
                    rule_id,
                    port,
                    protocol,
                    current_clients: 0,
                    state: ListenerState::WaitingClient,
                },
            );
    }

    fn set_waiting(&self, rule_id: i64, protocol: Protocol) {
        let mut listeners = self.listeners.write().expect("listeners lock poisoned");
        if let Some(status) = listeners.get_mut(&(rule_id, protocol)) {
            status.current_clients = 0;
            status.state = ListenerState::WaitingClient;
        }
    }

    fn on_client_connected(&self, rule_id: i64, protocol: Protocol) {
        let mut listeners = self.listeners.write().expect("listeners lock poisoned");
        if let Some(status) = listeners.get_mut(&(rule_id, protocol)) {
            status.current_clients += 1;
            status.state = ListenerState::Active;
        }
    }

    fn on_client_disconnected(&self, rule_id: i64, protocol: Protocol) {
        let mut listeners = self.listeners.write().expect("listeners lock poisoned");
        if let Some(status) = listeners.get_mut(&(rule_id, protocol)) {
            status.current_clients = status.current_clients.saturating_sub(1);
            if status.current_clients == 0 && status.state == ListenerState::Active {
                status.state = ListenerState::WaitingClient;
            }
        }
    }

    fn stop_listener(&self, rule_id: i64) {
        let mut listeners = self.listeners.write().expect("listeners lock poisoned");
        for status in listeners.values_mut() {
            if status.rule_id == rule_id {
                status.state = ListenerState::Stopped;
                status.current_clients = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_count_drives_state() {
        let sink = MemoryListenerStatus::new();
        sink.create_listener(1, 9000, Protocol::Tcp);
        sink.set_waiting(1, Protocol::Tcp);

        let status = sink.get(1, Protocol::Tcp).unwrap();
        assert_eq!(status.state, ListenerState::WaitingClient);
        assert_eq!(status.current_clients, 0);

        sink.on_client_connected(1, Protocol::Tcp);
        sink.on_client_connected(1, Protocol::Tcp);
        let status = sink.get(1, Protocol::Tcp).unwrap();
        assert_eq!(status.state, ListenerState::Active);
        assert_eq!(status.current_clients, 2);

        sink.on_client_disconnected(1, Protocol::Tcp);
        assert_eq!(sink.get(1, Protocol::Tcp).unwrap().state, ListenerState::Active);

        sink.on_client_disconnected(1, Protocol::Tcp);
        let status = sink.get(1, Protocol::Tcp).unwrap();
        assert_eq!(status.state, ListenerState::WaitingClient);
        assert_eq!(status.current_clients, 0);
    }

    #[test]
    fn test_count_never_goes_negative() {
        let sink = MemoryListenerStatus::new();
        sink.create_listener(1, 9000, Protocol::Tcp);
        sink.on_client_disconnected(1, Protocol::Tcp);
        assert_eq!(sink.get(1, Protocol::Tcp).unwrap().current_clients, 0);
    }

    #[test]
    fn test_stop_covers_both_protocols() {
        let sink = MemoryListenerStatus::new();
        sink.create_listener(1, 9000, Protocol::Tcp);
        sink.create_listener(1, 9000, Protocol::Udp);
        sink.on_client_connected(1, Protocol::Tcp);

        sink.stop_listener(1);
        assert_eq!(sink.get(1, Protocol::Tcp).unwrap().state, ListenerState::Stopped);
        assert_eq!(sink.get(1, Protocol::Udp).unwrap().state, ListenerState::Stopped);
    }
}
