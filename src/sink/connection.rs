//! Connection-record persistence contract.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use uuid::Uuid;

use super::record::{ConnectionRecord, ConnectionStatus};

/// Persistence sink for connection records.
///
/// Every call is fire-and-forget: implementations must not block the caller
/// on I/O (queue internally if the backing store is slow).
pub trait ConnectionSink: Send + Sync {
    /// Persist a new record.
    fn save(&self, record: &ConnectionRecord);

    /// Replace a stored record with this snapshot.
    fn update(&self, record: &ConnectionRecord);

    /// Add traffic deltas to a stored record.
    fn update_traffic(
        &self,
        connection_id: Uuid,
        rx_bytes: u64,
        tx_bytes: u64,
        rx_packets: u64,
        tx_packets: u64,
    );

    /// Drop a record entirely.
    fn delete(&self, connection_id: Uuid);
}

/// In-memory record store for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryConnectionSink {
    records: RwLock<HashMap<Uuid, ConnectionRecord>>,
}

impl MemoryConnectionSink {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a copy of one record.
    #[must_use]
    pub fn get(&self, connection_id: Uuid) -> Option<ConnectionRecord> {
        self.records
            .read()
            .expect("records lock poisoned")
            .get(&connection_id)
            .cloned()
    }

    /// Snapshot of every stored record.
    #[must_use]
    pub fn records(&self) -> Vec<ConnectionRecord> {
        self.records
            .read()
            .expect("records lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().expect("records lock poisoned").len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of records currently in the `Connected` state.
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.records
            .read()
            .expect("records lock poisoned")
            .values()
            .filter(|r| r.status == ConnectionStatus::Connected)
            .count()
    }
}

impl ConnectionSink for MemoryConnectionSink {
    fn save(&self, record: &ConnectionRecord) {
        self.records
            .write()
            .expect("records lock poisoned")
            .insert(record.connection_id, record.clone());
    }

    fn update(&self, record: &ConnectionRecord) {
        self.save(record);
    }

    fn update_traffic(
        &self,
        connection_id: Uuid,
        rx_bytes: u64,
        tx_bytes: u64,
        rx_packets: u64,
        tx_packets: u64,
    ) {
        let mut records = self.records.write().expect("records lock poisoned");
        if let Some(record) = records.get_mut(&connection_id) {
            record.bytes_rx += rx_bytes;
            record.bytes_tx += tx_bytes;
            record.packets_rx += rx_packets;
            record.packets_tx += tx_packets;
            record.last_active_at = Utc::now();
        }
    }

    fn delete(&self, connection_id: Uuid) {
        self.records
            .write()
            .expect("records lock poisoned")
            .remove(&connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::Protocol;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn record() -> ConnectionRecord {
        ConnectionRecord::new(
            1,
            Protocol::Tcp,
            9000,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 50000),
        )
    }

    #[test]
    fn test_save_get_delete() {
        let sink = MemoryConnectionSink::new();
        let rec = record();
        let id = rec.connection_id;

        sink.save(&rec);
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.get(id).unwrap().rule_id, 1);

        sink.delete(id);
        assert!(sink.is_empty());
        assert!(sink.get(id).is_none());
    }

    #[test]
    fn test_traffic_updates_are_additive() {
        let sink = MemoryConnectionSink::new();
        let rec = record();
        let id = rec.connection_id;
        sink.save(&rec);

        sink.update_traffic(id, 100, 50, 2, 1);
        sink.update_traffic(id, 10, 5, 1, 1);

        let stored = sink.get(id).unwrap();
        assert_eq!(stored.bytes_rx, 110);
        assert_eq!(stored.bytes_tx, 55);
        assert_eq!(stored.packets_rx, 3);
        assert_eq!(stored.packets_tx, 2);
    }

    #[test]
    fn test_traffic_update_for_unknown_id_is_ignored() {
        let sink = MemoryConnectionSink::new();
        sink.update_traffic(Uuid::new_v4(), 100, 0, 1, 0);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_connected_count() {
        let sink = MemoryConnectionSink::new();
        let mut a = record();
        a.transition(ConnectionStatus::Connected);
        let mut b = record();
        b.transition(ConnectionStatus::Connected);
        b.transition(ConnectionStatus::Disconnected);

        sink.save(&a);
        sink.save(&b);
        assert_eq!(sink.connected_count(), 1);
    }
}
