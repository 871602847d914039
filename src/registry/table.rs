//! The registry proper: rule -> clients, upstream -> clients routing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::pool::UpstreamPool;

use super::entry::{ClientEntry, ClientStats};

/// What happened to a payload handed to [`ClientRegistry::forward_to_upstream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Written to a live upstream connection.
    Forwarded,

    /// No healthy upstream; queued in the client's outage buffer.
    Buffered,

    /// Dropped: the client is unknown, or its buffer is full (tail-drop).
    Dropped,
}

/// Registry of live downstream clients.
///
/// Shared maps only; no lock is held across socket I/O except the per-client
/// writer mutex that serialises writes to one socket.
pub struct ClientRegistry {
    /// rule id -> connection id -> client.
    clients: RwLock<HashMap<i64, HashMap<Uuid, Arc<ClientEntry>>>>,

    /// upstream connection id -> clients that wrote through it.
    ///
    /// Best-effort reply affinity: populated on the first client write
    /// through an upstream connection, cleared when that connection closes.
    /// With `poolSize > 1` and concurrent clients this does not guarantee
    /// per-client response routing; absent or stale mappings fall back to
    /// rule-wide fan-out.
    upstream_clients: RwLock<HashMap<u64, HashMap<Uuid, Arc<ClientEntry>>>>,

    /// Per-client pending-payload cap.
    buffer_cap: usize,

    /// Payloads tail-dropped because a buffer was full.
    overflow_drops: AtomicU64,
}

impl ClientRegistry {
    /// Create a registry with the given per-client buffer cap.
    #[must_use]
    pub fn new(buffer_cap: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            upstream_clients: RwLock::new(HashMap::new()),
            buffer_cap,
            overflow_drops: AtomicU64::new(0),
        }
    }

    /// Record a new downstream client and take ownership of its write half.
    pub async fn register(
        &self,
        rule_id: i64,
        connection_id: Uuid,
        writer: OwnedWriteHalf,
    ) -> Arc<ClientEntry> {
        let entry = Arc::new(ClientEntry::new(
            rule_id,
            connection_id,
            writer,
            self.buffer_cap,
        ));

        let mut clients = self.clients.write().await;
        clients
            .entry(rule_id)
            .or_default()
            .insert(connection_id, Arc::clone(&entry));

        debug!(
            rule = rule_id,
            connection = %connection_id,
            clients = clients.get(&rule_id).map_or(0, HashMap::len),
            "registered client"
        );
        entry
    }

    /// Release a client and drop its buffer.
    pub async fn unregister(&self, rule_id: i64, connection_id: Uuid) {
        let removed = {
            let mut clients = self.clients.write().await;
            let removed = clients
                .get_mut(&rule_id)
                .and_then(|m| m.remove(&connection_id));
            if clients.get(&rule_id).is_some_and(HashMap::is_empty) {
                clients.remove(&rule_id);
            }
            removed
        };

        if let Some(entry) = removed {
            entry.close();
            entry.clear_buffer();

            // Drop any stale reply-affinity references to this client.
            let mut upstream = self.upstream_clients.write().await;
            for mapped in upstream.values_mut() {
                mapped.remove(&connection_id);
            }
            debug!(rule = rule_id, connection = %connection_id, "unregistered client");
        }
    }

    /// Live client count for a rule.
    pub async fn client_count(&self, rule_id: i64) -> usize {
        self.clients
            .read()
            .await
            .get(&rule_id)
            .map_or(0, HashMap::len)
    }

    /// Forward a client payload to the rule's upstream, or buffer it while
    /// the upstream is down.
    pub async fn forward_to_upstream(
        &self,
        rule_id: i64,
        connection_id: Uuid,
        payload: Bytes,
        pool: &UpstreamPool,
    ) -> ForwardOutcome {
        let Some(entry) = self.get_entry(rule_id, connection_id).await else {
            return ForwardOutcome::Dropped;
        };

        match pool.get().await {
            Some(conn) => {
                // Remember which clients wrote through this upstream
                // connection so replies can be biased back to them.
                self.map_upstream(conn.id(), &entry).await;

                match conn.send(&payload).await {
                    Ok(()) => {
                        entry.record_sent(payload.len());
                        ForwardOutcome::Forwarded
                    }
                    Err(e) => {
                        warn!(
                            rule = rule_id,
                            connection = %connection_id,
                            error = %e,
                            "upstream write failed, buffering payload"
                        );
                        self.buffer_for(&entry, payload)
                    }
                }
            }
            None => self.buffer_for(&entry, payload),
        }
    }

    fn buffer_for(&self, entry: &ClientEntry, payload: Bytes) -> ForwardOutcome {
        let size = payload.len();
        if entry.buffer_payload(payload) {
            debug!(
                connection = %entry.connection_id(),
                bytes = size,
                pending = entry.buffered_bytes(),
                "upstream unavailable, buffered payload"
            );
            ForwardOutcome::Buffered
        } else {
            self.overflow_drops.fetch_add(1, Ordering::Relaxed);
            warn!(
                connection = %entry.connection_id(),
                bytes = size,
                pending = entry.buffered_bytes(),
                "client buffer full, dropping payload"
            );
            ForwardOutcome::Dropped
        }
    }

    /// Direct reply path to one client. Kept for symmetry with
    /// [`forward_to_upstream`]; the main reply plan goes through
    /// [`route_from_upstream`].
    pub async fn forward_to_client(
        &self,
        rule_id: i64,
        connection_id: Uuid,
        payload: &[u8],
    ) -> bool {
        match self.get_entry(rule_id, connection_id).await {
            Some(entry) => entry.send_to_client(payload).await.is_ok(),
            None => false,
        }
    }

    /// Fan a payload out to every live client of a rule.
    ///
    /// Returns the number of clients written.
    pub async fn route_to_rule(&self, rule_id: i64, payload: &[u8]) -> usize {
        let entries = self.entries_for(rule_id).await;
        let mut delivered = 0;
        for entry in entries {
            match entry.send_to_client(payload).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(
                        connection = %entry.connection_id(),
                        error = %e,
                        "fan-out write to client failed"
                    );
                }
            }
        }
        delivered
    }

    /// Route an upstream payload: prefer the clients mapped to the upstream
    /// connection it arrived on, fall back to rule-wide fan-out.
    pub async fn route_from_upstream(
        &self,
        upstream_id: u64,
        rule_id: i64,
        payload: &[u8],
    ) -> usize {
        let mapped: Vec<Arc<ClientEntry>> = {
            let upstream = self.upstream_clients.read().await;
            upstream
                .get(&upstream_id)
                .map(|m| m.values().filter(|e| e.is_open()).cloned().collect())
                .unwrap_or_default()
        };

        if mapped.is_empty() {
            return self.route_to_rule(rule_id, payload).await;
        }

        let mut delivered = 0;
        for entry in mapped {
            match entry.send_to_client(payload).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(
                        connection = %entry.connection_id(),
                        error = %e,
                        "directed reply to client failed"
                    );
                }
            }
        }
        delivered
    }

    /// Record that `entry` wrote through upstream connection `upstream_id`.
    pub async fn map_upstream(&self, upstream_id: u64, entry: &Arc<ClientEntry>) {
        self.upstream_clients
            .write()
            .await
            .entry(upstream_id)
            .or_default()
            .insert(entry.connection_id(), Arc::clone(entry));
    }

    /// Forget the reply mapping of a closed upstream connection.
    pub async fn clear_upstream(&self, upstream_id: u64) {
        self.upstream_clients.write().await.remove(&upstream_id);
    }

    /// Drain every client's outage buffer into the now-healthy upstream, in
    /// insertion order. Stops early if the upstream goes away again.
    ///
    /// Returns the number of payload bytes flushed.
    pub async fn flush_buffered(&self, rule_id: i64, pool: &UpstreamPool) -> usize {
        let entries = self.entries_for(rule_id).await;
        let mut flushed = 0usize;

        for entry in entries {
            while let Some(payload) = entry.pop_buffered() {
                let Some(conn) = pool.get().await else {
                    entry.requeue_front(payload);
                    return flushed;
                };
                match conn.send(&payload).await {
                    Ok(()) => {
                        entry.record_sent(payload.len());
                        flushed += payload.len();
                    }
                    Err(e) => {
                        warn!(
                            connection = %entry.connection_id(),
                            error = %e,
                            "flush write failed, keeping remainder buffered"
                        );
                        entry.requeue_front(payload);
                        return flushed;
                    }
                }
            }
        }

        if flushed > 0 {
            debug!(rule = rule_id, bytes = flushed, "flushed buffered client data");
        }
        flushed
    }

    /// Drop every client of a rule (rule deactivation).
    pub async fn remove_rule(&self, rule_id: i64) -> usize {
        let removed = self.clients.write().await.remove(&rule_id);
        let count = removed.as_ref().map_or(0, HashMap::len);
        if let Some(entries) = removed {
            for entry in entries.values() {
                entry.close();
                entry.clear_buffer();
            }
        }
        count
    }

    /// Aggregate statistics for a rule's clients.
    pub async fn stats(&self, rule_id: i64) -> ClientStats {
        let mut stats = ClientStats::default();
        for entry in self.entries_for(rule_id).await {
            entry.accumulate(&mut stats);
        }
        stats
    }

    /// Payloads dropped because a client buffer was full.
    #[must_use]
    pub fn overflow_drops(&self) -> u64 {
        self.overflow_drops.load(Ordering::Relaxed)
    }

    async fn get_entry(&self, rule_id: i64, connection_id: Uuid) -> Option<Arc<ClientEntry>> {
        self.clients
            .read()
            .await
            .get(&rule_id)
            .and_then(|m| m.get(&connection_id))
            .cloned()
    }

    async fn entries_for(&self, rule_id: i64) -> Vec<Arc<ClientEntry>> {
        self.clients
            .read()
            .await
            .get(&rule_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }
}
