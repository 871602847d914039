//! UDP session tracking and eviction.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::sink::{ConnectionRecord, ConnectionSink, ConnectionStatus, MetricsSink};

/// Session identity: downstream address plus owning rule.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct SessionKey {
    /// Downstream client address.
    pub client: SocketAddr,

    /// Owning forwarding rule.
    pub rule_id: i64,
}

impl SessionKey {
    /// Create a session key.
    #[must_use]
    pub fn new(client: SocketAddr, rule_id: i64) -> Self {
        Self { client, rule_id }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}@{}", self.client.ip(), self.client.port(), self.rule_id)
    }
}

/// Session-table statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Sessions ever created.
    pub total: u64,

    /// Sessions currently considered active.
    pub active: u64,

    /// Sessions evicted by the sweeper.
    pub expired: u64,

    /// Entries currently in the table.
    pub current: usize,
}

/// One downstream address's flow, backed by a dedicated outbound socket.
pub struct UdpSession {
    key: SessionKey,
    outbound: Arc<UdpSocket>,
    record: ConnectionRecord,
    created: Instant,
    last_active_ms: AtomicU64,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl UdpSession {
    /// Create a session over a freshly bound outbound socket.
    #[must_use]
    pub fn new(key: SessionKey, outbound: Arc<UdpSocket>, record: ConnectionRecord) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            key,
            outbound,
            record,
            created: Instant::now(),
            last_active_ms: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Session identity.
    #[must_use]
    pub fn key(&self) -> SessionKey {
        self.key
    }

    /// The outbound socket used toward the upstream.
    #[must_use]
    pub fn outbound(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.outbound)
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

    /// Subscribe to the session's shutdown signal.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Refresh the activity timestamp. `last_active` never precedes the
    /// creation instant.
    pub fn touch(&self) {
        self.last_active_ms
            .store(self.created.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Time since the last datagram in either direction.
    #[must_use]
    pub fn idle_time(&self) -> Duration {
        let last = Duration::from_millis(self.last_active_ms.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }

    /// Whether the session can still carry datagrams.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Relaxed)
    }

    /// Stop the return-path reader and mark the session dead. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::Relaxed) {
            let _ = self.shutdown_tx.send(true);
        }
    }

    fn expired_at(&self, now: Instant, timeout: Duration) -> bool {
        let last = self.created + Duration::from_millis(self.last_active_ms.load(Ordering::Relaxed));
        now.saturating_duration_since(last) > timeout
    }
}

impl std::fmt::Debug for UdpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSession")
            .field("key", &self.key.to_string())
            .field("alive", &self.is_alive())
            .field("idle", &self.idle_time())
            .finish()
    }
}

struct TableInner {
    sessions: RwLock<HashMap<SessionKey, Arc<UdpSession>>>,
    timeout: Duration,
    sweep_interval: Duration,
    connections: Arc<dyn ConnectionSink>,
    metrics: Arc<dyn MetricsSink>,
    total: AtomicU64,
    active: AtomicU64,
    expired: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Table of live UDP sessions, shared by every point-to-point rule.
///
/// A cheap-to-clone handle over shared state. Insertion is
/// first-writer-wins so concurrent datagrams from one client cannot produce
/// two sessions; a single sweeper task evicts sessions idle past the
/// timeout or already closed.
pub struct UdpSessionTable {
    inner: Arc<TableInner>,
}

impl Clone for UdpSessionTable {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl UdpSessionTable {
    /// Create a table with the given eviction timings.
    #[must_use]
    pub fn new(
        timeout: Duration,
        sweep_interval: Duration,
        connections: Arc<dyn ConnectionSink>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(TableInner {
                sessions: RwLock::new(HashMap::new()),
                timeout,
                sweep_interval,
                connections,
                metrics,
                total: AtomicU64::new(0),
                active: AtomicU64::new(0),
                expired: AtomicU64::new(0),
                shutdown_tx,
                sweeper: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Start the periodic eviction sweeper. Idempotent.
    pub fn start_sweeper(&self) {
        let mut sweeper = self.inner.sweeper.lock().expect("sweeper lock poisoned");
        if sweeper.is_some() {
            return;
        }

        let table = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(table.inner.sweep_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of `interval` fires immediately; skip it so a
            // fresh table is not swept at startup.
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tick.tick() => {
                        let removed = table.cleanup().await;
                        if removed > 0 {
                            debug!(removed, "evicted expired UDP sessions");
                        }
                    }
                }
            }
        });
        *sweeper = Some(handle);

        info!(
            timeout_secs = self.inner.timeout.as_secs(),
            interval_secs = self.inner.sweep_interval.as_secs(),
            "UDP session sweeper started"
        );
    }

    /// Look up a live session, refreshing its activity timestamp.
    pub async fn get(&self, key: SessionKey) -> Option<Arc<UdpSession>> {
        let sessions = self.inner.sessions.read().await;
        let session = sessions.get(&key)?;
        if session.is_alive() {
            session.touch();
            Some(Arc::clone(session))
        } else {
            None
        }
    }

    /// Insert a session unless a live one already exists for the key.
    ///
    /// Returns the winning session; the losing one (if any) is closed.
    pub async fn insert(&self, session: Arc<UdpSession>) -> Arc<UdpSession> {
        let key = session.key();
        let mut sessions = self.inner.sessions.write().await;
        if let Some(existing) = sessions.get(&key) {
            if existing.is_alive() {
                existing.touch();
                session.close();
                return Arc::clone(existing);
            }
        }

        sessions.insert(key, Arc::clone(&session));
        self.inner.total.fetch_add(1, Ordering::Relaxed);
        self.inner.active.fetch_add(1, Ordering::Relaxed);
        debug!(session = %key, current = sessions.len(), "created UDP session");
        session
    }

    /// Remove one session, closing it and retiring its record.
    pub async fn remove(&self, key: SessionKey) {
        let removed = self.inner.sessions.write().await.remove(&key);
        if let Some(session) = removed {
            self.retire(&session);
        }
    }

    /// Evict sessions idle past the timeout or already closed.
    ///
    /// Returns the number of sessions removed.
    pub async fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut evicted = Vec::new();
        {
            let mut sessions = self.inner.sessions.write().await;
            sessions.retain(|_, session| {
                if session.expired_at(now, self.inner.timeout) || !session.is_alive() {
                    evicted.push(Arc::clone(session));
                    false
                } else {
                    true
                }
            });
        }

        for session in &evicted {
            self.inner.expired.fetch_add(1, Ordering::Relaxed);
            self.retire(session);
        }
        evicted.len()
    }

    /// Drop every session of one rule (rule deactivation).
    pub async fn remove_rule(&self, rule_id: i64) -> usize {
        let mut evicted = Vec::new();
        {
            let mut sessions = self.inner.sessions.write().await;
            sessions.retain(|key, session| {
                if key.rule_id == rule_id {
                    evicted.push(Arc::clone(session));
                    false
                } else {
                    true
                }
            });
        }
        for session in &evicted {
            self.retire(session);
        }
        evicted.len()
    }

    /// Stop the sweeper and close every session.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        if let Some(handle) = self
            .inner
            .sweeper
            .lock()
            .expect("sweeper lock poisoned")
            .take()
        {
            handle.abort();
        }

        let drained: Vec<Arc<UdpSession>> = {
            let mut sessions = self.inner.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in &drained {
            self.retire(session);
        }
        info!(closed = drained.len(), "UDP session table shut down");
    }

    /// Table statistics.
    pub async fn stats(&self) -> SessionStats {
        SessionStats {
            total: self.inner.total.load(Ordering::Relaxed),
            active: self.inner.active.load(Ordering::Relaxed),
            expired: self.inner.expired.load(Ordering::Relaxed),
            current: self.inner.sessions.read().await.len(),
        }
    }

    fn retire(&self, session: &UdpSession) {
        session.close();
        self.inner.active.fetch_sub(1, Ordering::Relaxed);

        let mut record = session.record().clone();
        if record.transition(ConnectionStatus::Disconnected) {
            self.inner.connections.update(&record);
        }
        self.inner.metrics.dec_active_connections();
        debug!(session = %session.key(), "retired UDP session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    use crate::rule::Protocol;
    use crate::sink::{AtomicMetrics, MemoryConnectionSink};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    async fn make_session(key: SessionKey, sink: &MemoryConnectionSink) -> Arc<UdpSession> {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let mut record = ConnectionRecord::new(key.rule_id, Protocol::Udp, 9001, key.client);
        record.transition(ConnectionStatus::Connected);
        sink.save(&record);
        Arc::new(UdpSession::new(key, socket, record))
    }

    fn table(timeout_ms: u64) -> (UdpSessionTable, Arc<MemoryConnectionSink>) {
        let sink = Arc::new(MemoryConnectionSink::new());
        let table = UdpSessionTable::new(
            Duration::from_millis(timeout_ms),
            Duration::from_millis(20),
            Arc::clone(&sink) as Arc<dyn ConnectionSink>,
            Arc::new(AtomicMetrics::new()),
        );
        (table, sink)
    }

    #[test]
    fn test_session_key_display() {
        let key = SessionKey::new(addr(50000), 3);
        assert_eq!(key.to_string(), "127.0.0.1:50000@3");
    }

    #[tokio::test]
    async fn test_last_active_never_precedes_creation() {
        let (_table, sink) = table(1000);
        let session = make_session(SessionKey::new(addr(50000), 1), &sink).await;
        assert!(session.idle_time() <= session.created.elapsed());
        session.touch();
        assert!(session.idle_time() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_first_writer_wins() {
        let (table, sink) = table(1000);
        let key = SessionKey::new(addr(50000), 1);

        let first = make_session(key, &sink).await;
        let second = make_session(key, &sink).await;

        let won = table.insert(Arc::clone(&first)).await;
        assert_eq!(won.connection_id(), first.connection_id());

        let racer = table.insert(Arc::clone(&second)).await;
        assert_eq!(racer.connection_id(), first.connection_id());
        assert!(!second.is_alive());

        let stats = table.stats().await;
        assert_eq!(stats.total, 1);
        assert_eq!(stats.current, 1);
    }

    #[tokio::test]
    async fn test_cleanup_evicts_idle_sessions() {
        let (table, sink) = table(30);
        let key = SessionKey::new(addr(50000), 1);
        let session = make_session(key, &sink).await;
        let id = session.connection_id();
        table.insert(session).await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        let removed = table.cleanup().await;
        assert_eq!(removed, 1);

        let stats = table.stats().await;
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.current, 0);
        assert_eq!(
            sink.get(id).unwrap().status,
            ConnectionStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn test_touched_session_survives_cleanup() {
        let (table, sink) = table(80);
        let key = SessionKey::new(addr(50000), 1);
        table.insert(make_session(key, &sink).await).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(table.get(key).await.is_some()); // get() touches
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(table.cleanup().await, 0);
        assert_eq!(table.stats().await.current, 1);
    }

    #[tokio::test]
    async fn test_remove_rule_only_touches_that_rule() {
        let (table, sink) = table(1000);
        table
            .insert(make_session(SessionKey::new(addr(50000), 1), &sink).await)
            .await;
        table
            .insert(make_session(SessionKey::new(addr(50001), 2), &sink).await)
            .await;

        assert_eq!(table.remove_rule(1).await, 1);
        let stats = table.stats().await;
        assert_eq!(stats.current, 1);
        assert!(table.get(SessionKey::new(addr(50001), 2)).await.is_some());
    }
}
