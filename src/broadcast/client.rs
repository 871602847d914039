//! Broadcast client tracking.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::sink::ConnectionRecord;

/// One registered broadcast peer: a downstream subscriber or an upstream
/// sender. A given remote address appears at most once per set.
pub struct BroadcastClient {
    addr: SocketAddr,
    subscribed_at: Instant,
    last_heartbeat_ms: AtomicU64,
    record: ConnectionRecord,
}

impl BroadcastClient {
    /// Register a peer with a fresh heartbeat.
    #[must_use]
    pub fn new(addr: SocketAddr, record: ConnectionRecord) -> Self {
        Self {
            addr,
            subscribed_at: Instant::now(),
            last_heartbeat_ms: AtomicU64::new(0),
            record,
        }
    }

    /// The peer's remote address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stable connection id of the backing record.
    #[must_use]
    pub fn connection_id(&self) -> Uuid {
        self.record.connection_id
    }

    /// Snapshot of the backing record.
    #[must_use]
    pub fn record(&self) -> &ConnectionRecord {
        &self.record
    }

    /// Refresh the heartbeat. Data payloads count as heartbeats too.
    pub fn heartbeat(&self) {
        self.last_heartbeat_ms.store(
            self.subscribed_at.elapsed().as_millis() as u64,
            Ordering::Relaxed,
        );
    }

    /// Whether the peer missed its heartbeat window as of `now`.
    #[must_use]
    pub fn expired_at(&self, now: Instant, timeout: Duration) -> bool {
        let last = self.subscribed_at
            + Duration::from_millis(self.last_heartbeat_ms.load(Ordering::Relaxed));
        now.saturating_duration_since(last) > timeout
    }
}

impl std::fmt::Debug for BroadcastClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastClient")
            .field("addr", &self.addr)
            .finish()
    }
}

/// Concurrent peer set keyed by remote address.
#[derive(Debug, Default)]
pub(crate) struct ClientTable {
    clients: RwLock<HashMap<SocketAddr, Arc<BroadcastClient>>>,
}

impl ClientTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Refresh an existing peer's heartbeat, or report that it is new.
    /// Registration of new peers happens via [`ClientTable::insert`] so the
    /// caller can build the connection record first.
    pub(crate) async fn refresh(&self, addr: SocketAddr) -> bool {
        let clients = self.clients.read().await;
        match clients.get(&addr) {
            Some(client) => {
                client.heartbeat();
                true
            }
            None => false,
        }
    }

    /// Insert a new peer; a concurrent earlier registration wins.
    pub(crate) async fn insert(&self, client: Arc<BroadcastClient>) -> Arc<BroadcastClient> {
        let mut clients = self.clients.write().await;
        match clients.get(&client.addr()) {
            Some(existing) => {
                existing.heartbeat();
                Arc::clone(existing)
            }
            None => {
                clients.insert(client.addr(), Arc::clone(&client));
                client
            }
        }
    }

    pub(crate) async fn get(&self, addr: SocketAddr) -> Option<Arc<BroadcastClient>> {
        self.clients.read().await.get(&addr).cloned()
    }

    pub(crate) async fn remove(&self, addr: SocketAddr) -> Option<Arc<BroadcastClient>> {
        self.clients.write().await.remove(&addr)
    }

    pub(crate) async fn snapshot(&self) -> Vec<Arc<BroadcastClient>> {
        self.clients.read().await.values().cloned().collect()
    }

    pub(crate) async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Remove and return every peer whose heartbeat lapsed.
    pub(crate) async fn sweep(&self, now: Instant, timeout: Duration) -> Vec<Arc<BroadcastClient>> {
        let mut clients = self.clients.write().await;
        let mut evicted = Vec::new();
        clients.retain(|_, client| {
            if client.expired_at(now, timeout) {
                evicted.push(Arc::clone(client));
                false
            } else {
                true
            }
        });
        evicted
    }

    /// Remove and return every peer.
    pub(crate) async fn drain(&self) -> Vec<Arc<BroadcastClient>> {
        let mut clients = self.clients.write().await;
        clients.drain().map(|(_, c)| c).collect()
    }
}

/// Read-only broadcast snapshot for the administrator surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Registered downstream subscribers.
    pub downstream_clients: usize,

    /// Registered upstream senders.
    pub upstream_clients: usize,

    /// Payload bytes received on either socket.
    pub bytes_rx: u64,

    /// Payload bytes fanned out (accrues size x fan-out count).
    pub bytes_tx: u64,

    /// Datagrams received on either socket.
    pub packets_rx: u64,

    /// Datagrams fanned out.
    pub packets_tx: u64,
}
