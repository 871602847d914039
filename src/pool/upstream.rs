//! The pool proper: slot array and reconnect state machine.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use socket2::SockRef;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::TcpSettings;
use crate::registry::ClientRegistry;
use crate::rule::ForwardRule;

use super::conn::UpstreamConn;
use super::error::{PoolError, PoolResult};

/// Upper bound on the reconnect backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Dial timeout for upstream connections.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-slot lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Never dialled, or released; eligible for on-demand dialling.
    Idle,
    /// A dial is in flight.
    Connecting,
    /// Holding a live connection.
    Connected,
    /// Waiting out the reconnect delay.
    Backoff,
    /// Exceeded the attempt cap; terminal for this slot.
    GaveUp,
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotState::Idle => write!(f, "idle"),
            SlotState::Connecting => write!(f, "connecting"),
            SlotState::Connected => write!(f, "connected"),
            SlotState::Backoff => write!(f, "backoff"),
            SlotState::GaveUp => write!(f, "gave_up"),
        }
    }
}

/// Pool-level health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// At least one slot holds a live connection.
    Connected,
    /// No live connections.
    Disconnected,
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolState::Connected => write!(f, "CONNECTED"),
            PoolState::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

/// Read-only pool snapshot for the administrator surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    /// Owning rule.
    pub rule_id: i64,

    /// Owning rule's name.
    pub rule_name: String,

    /// Upstream endpoint.
    pub target: SocketAddr,

    /// Slots holding a live connection.
    pub active: usize,

    /// Total slots.
    pub total: usize,

    /// Reconnect attempts summed over all slots since the last success.
    pub reconnect_attempts: u32,

    /// Derived health.
    pub state: PoolState,
}

struct Slot {
    conn: StdRwLock<Option<Arc<UpstreamConn>>>,
    state: StdMutex<SlotState>,
    attempts: AtomicU32,
}

impl Slot {
    fn new() -> Self {
        Self {
            conn: StdRwLock::new(None),
            state: StdMutex::new(SlotState::Idle),
            attempts: AtomicU32::new(0),
        }
    }
}

struct PoolInner {
    rule: ForwardRule,
    tcp: TcpSettings,
    registry: Arc<ClientRegistry>,
    slots: Vec<Slot>,
    rr: AtomicUsize,
    active: AtomicUsize,
    next_conn_id: AtomicU64,
    down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

/// Pool of outbound TCP connections for one forwarding rule.
///
/// A cheap-to-clone handle over shared state, exclusively owned by its rule
/// and destroyed on deactivation.
pub struct UpstreamPool {
    inner: Arc<PoolInner>,
}

impl Clone for UpstreamPool {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl UpstreamPool {
    /// Create a pool for a rule. Call [`UpstreamPool::start`] to seed the
    /// first slot.
    #[must_use]
    pub fn new(rule: ForwardRule, tcp: TcpSettings, registry: Arc<ClientRegistry>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let slots = (0..rule.pool_size.max(1)).map(|_| Slot::new()).collect();
        Self {
            inner: Arc::new(PoolInner {
                rule,
                tcp,
                registry,
                slots,
                rr: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                next_conn_id: AtomicU64::new(1),
                down: AtomicBool::new(false),
                shutdown_tx,
            }),
        }
    }

    /// Eagerly dial the first slot so the upstream can push unsolicited
    /// data before any client connects.
    pub fn start(&self) {
        info!(
            rule = %self.inner.rule.name,
            target = %self.inner.rule.target_addr(),
            pool_size = self.inner.slots.len(),
            "seeding upstream pool"
        );
        let pool = self.clone();
        tokio::spawn(async move {
            if pool.begin_dial(0, SlotState::Idle) {
                if let Err(e) = pool.dial(0).await {
                    warn!(rule = %pool.inner.rule.name, error = %e, "eager dial failed");
                    pool.schedule_reconnect(0);
                }
            }
        });
    }

    /// The rule this pool serves.
    #[must_use]
    pub fn rule(&self) -> &ForwardRule {
        &self.inner.rule
    }

    /// Slots currently holding a live connection.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::Relaxed)
    }

    /// Get a live upstream connection, round-robin over the slots.
    ///
    /// When no slot is live and capacity remains, one idle slot is dialled
    /// inline (bounded by the 10 s connect timeout). Slots waiting out a
    /// backoff or given up are not touched. Returns `None` when nothing is
    /// reachable.
    pub async fn get(&self) -> Option<Arc<UpstreamConn>> {
        if self.inner.down.load(Ordering::Relaxed) {
            return None;
        }

        let n = self.inner.slots.len();
        let start = self.inner.rr.fetch_add(1, Ordering::Relaxed);
        for i in 0..n {
            let idx = (start + i) % n;
            let conn = self.inner.slots[idx]
                .conn
                .read()
                .expect("slot lock poisoned")
                .clone();
            if let Some(conn) = conn {
                if conn.is_open() {
                    return Some(conn);
                }
            }
        }

        // On-demand expansion: one dial attempt against one idle slot.
        if self.inner.active.load(Ordering::Relaxed) < n {
            for idx in 0..n {
                if self.begin_dial(idx, SlotState::Idle) {
                    match self.dial(idx).await {
                        Ok(conn) => return Some(conn),
                        Err(e) => {
                            warn!(
                                rule = %self.inner.rule.name,
                                slot = idx,
                                error = %e,
                                "on-demand dial failed"
                            );
                            self.set_state(idx, SlotState::Idle);
                            return None;
                        }
                    }
                }
            }
        }

        None
    }

    /// Hand a connection back. A no-op: connections are persistent and
    /// shared between clients, never checked out. Kept so the contract
    /// reads symmetrically with [`UpstreamPool::get`].
    pub fn release(&self, _conn: Arc<UpstreamConn>) {}

    /// Shut the pool down: cancel reconnect timers, close every connection,
    /// stop reader tasks. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(true);

        for slot in &self.inner.slots {
            let conn = slot.conn.write().expect("slot lock poisoned").take();
            if let Some(conn) = conn {
                conn.mark_closed();
            }
            *slot.state.lock().expect("state lock poisoned") = SlotState::Idle;
            slot.attempts.store(0, Ordering::Relaxed);
        }
        self.inner.active.store(0, Ordering::Relaxed);

        info!(rule = %self.inner.rule.name, "upstream pool shut down");
    }

    /// Read-only snapshot for the administrator surface.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let active = self.inner.active.load(Ordering::Relaxed);
        PoolStatus {
            rule_id: self.inner.rule.id,
            rule_name: self.inner.rule.name.clone(),
            target: self.inner.rule.target_addr(),
            active,
            total: self.inner.slots.len(),
            reconnect_attempts: self
                .inner
                .slots
                .iter()
                .map(|s| s.attempts.load(Ordering::Relaxed))
                .sum(),
            state: if active > 0 {
                PoolState::Connected
            } else {
                PoolState::Disconnected
            },
        }
    }

    /// Per-slot states, index-aligned with the slot array.
    #[must_use]
    pub fn slot_states(&self) -> Vec<SlotState> {
        self.inner
            .slots
            .iter()
            .map(|s| *s.state.lock().expect("state lock poisoned"))
            .collect()
    }

    /// Atomically claim a slot for dialling if it is in `expected` state.
    fn begin_dial(&self, idx: usize, expected: SlotState) -> bool {
        let mut state = self.inner.slots[idx]
            .state
            .lock()
            .expect("state lock poisoned");
        if *state == expected {
            *state = SlotState::Connecting;
            true
        } else {
            false
        }
    }

    fn set_state(&self, idx: usize, state: SlotState) {
        *self.inner.slots[idx]
            .state
            .lock()
            .expect("state lock poisoned") = state;
    }

    /// Dial one slot. The slot must already be claimed (`Connecting`).
    ///
    /// Boxed to break the recursive `Send` cycle: `dial` spawns a task that
    /// can call back into [`UpstreamPool::get`], which itself awaits `dial`.
    fn dial(
        &self,
        idx: usize,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = PoolResult<Arc<UpstreamConn>>> + Send + '_>>
    {
        Box::pin(self.dial_inner(idx))
    }

    async fn dial_inner(&self, idx: usize) -> PoolResult<Arc<UpstreamConn>> {
        if self.inner.down.load(Ordering::Relaxed) {
            return Err(PoolError::Shutdown);
        }

        let target = self.inner.rule.target_addr();
        let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(target)).await {
            Err(_) => return Err(PoolError::DialTimeout { address: target }),
            Ok(Err(e)) => {
                return Err(PoolError::DialFailed {
                    address: target,
                    source: e,
                })
            }
            Ok(Ok(stream)) => stream,
        };

        if let Err(e) = self.configure_stream(&stream) {
            warn!(target = %target, error = %e, "failed to tune upstream socket");
        }

        let (mut read_half, write_half) = stream.into_split();
        let conn = Arc::new(UpstreamConn::new(
            self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed),
            idx,
            target,
            write_half,
        ));

        *self.inner.slots[idx]
            .conn
            .write()
            .expect("slot lock poisoned") = Some(Arc::clone(&conn));
        self.inner.slots[idx].attempts.store(0, Ordering::Relaxed);
        self.set_state(idx, SlotState::Connected);
        self.inner.active.fetch_add(1, Ordering::Relaxed);

        info!(
            rule = %self.inner.rule.name,
            slot = idx,
            target = %target,
            "upstream connected"
        );

        // Reader: forward upstream bytes to the rule's clients until the
        // connection closes, then drive the slot into reconnect.
        let pool = self.clone();
        let reader_conn = Arc::clone(&conn);
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let rule_id = pool.inner.rule.id;
            let mut buf = vec![0u8; pool.inner.tcp.read_buffer_size];
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    result = read_half.read(&mut buf) => match result {
                        Ok(0) => break,
                        Ok(n) => {
                            pool.inner
                                .registry
                                .route_from_upstream(reader_conn.id(), rule_id, &buf[..n])
                                .await;
                        }
                        Err(e) => {
                            debug!(rule = rule_id, error = %e, "upstream read failed");
                            break;
                        }
                    }
                }
            }
            pool.on_conn_closed(&reader_conn).await;
        });

        // A healthy upstream means buffered client data can drain.
        let pool = self.clone();
        tokio::spawn(async move {
            let registry = Arc::clone(&pool.inner.registry);
            registry.flush_buffered(pool.inner.rule.id, &pool).await;
        });

        Ok(conn)
    }

    fn configure_stream(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.inner.tcp.tcp_nodelay)?;
        if self.inner.tcp.so_keepalive {
            SockRef::from(stream).set_keepalive(true)?;
        }
        Ok(())
    }

    /// Release a closed connection's slot and decide what happens next.
    async fn on_conn_closed(&self, conn: &Arc<UpstreamConn>) {
        conn.mark_closed();
        let idx = conn.slot();

        let released = {
            let mut slot_conn = self.inner.slots[idx]
                .conn
                .write()
                .expect("slot lock poisoned");
            if slot_conn.as_ref().is_some_and(|c| c.id() == conn.id()) {
                *slot_conn = None;
                true
            } else {
                false
            }
        };
        if released {
            self.inner.active.fetch_sub(1, Ordering::Relaxed);
        }

        // Replies can no longer be directed through this connection.
        self.inner.registry.clear_upstream(conn.id()).await;

        if self.inner.down.load(Ordering::Relaxed) {
            return;
        }

        warn!(
            rule = %self.inner.rule.name,
            slot = idx,
            target = %conn.target(),
            "upstream connection closed"
        );

        if released {
            if self.inner.rule.auto_reconnect {
                self.schedule_reconnect(idx);
            } else {
                self.set_state(idx, SlotState::Idle);
            }
        }
    }

    /// Queue a reconnect attempt for a slot, or give the slot up when the
    /// attempt cap is exceeded. The pool stays usable through other slots.
    fn schedule_reconnect(&self, idx: usize) {
        if self.inner.down.load(Ordering::Relaxed) || !self.inner.rule.auto_reconnect {
            return;
        }

        let attempt = self.inner.slots[idx].attempts.fetch_add(1, Ordering::Relaxed) + 1;
        if attempt > self.inner.rule.max_reconnect_attempts {
            error!(
                rule = %self.inner.rule.name,
                slot = idx,
                attempts = attempt - 1,
                "reconnect attempts exhausted, giving slot up"
            );
            self.set_state(idx, SlotState::GaveUp);
            return;
        }

        let delay = backoff_delay(self.inner.rule.reconnect_interval(), attempt);
        self.set_state(idx, SlotState::Backoff);
        info!(
            rule = %self.inner.rule.name,
            slot = idx,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling upstream reconnect"
        );

        let pool = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                () = sleep(delay) => {
                    if !pool.begin_dial(idx, SlotState::Backoff) {
                        return;
                    }
                    match pool.dial(idx).await {
                        Ok(_) => {}
                        Err(e) => {
                            warn!(
                                rule = %pool.inner.rule.name,
                                slot = idx,
                                attempt,
                                error = %e,
                                "reconnect attempt failed"
                            );
                            pool.schedule_reconnect(idx);
                        }
                    }
                }
            }
        });
    }
}

/// Linear backoff capped at [`MAX_BACKOFF`].
fn backoff_delay(interval: Duration, attempt: u32) -> Duration {
    interval.saturating_mul(attempt).min(MAX_BACKOFF)
}
