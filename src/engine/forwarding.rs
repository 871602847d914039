//! The engine proper.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;

use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::access::{AccessDecider, AccessPolicy};
use crate::broadcast::{BroadcastRelay, BroadcastStats};
use crate::config::{RelayConfig, UdpMode};
use crate::pool::{PoolStatus, UpstreamPool};
use crate::registry::{ClientRegistry, ClientStats};
use crate::rule::{ForwardRule, Protocol};
use crate::sink::{ConnectionSink, ListenerStatusSink, MetricsSink};
use crate::tcp::{TcpRelayServer, TcpServerHandle};
use crate::udp::{SessionStats, UdpRelayServer, UdpServerHandle, UdpSessionTable};

use super::error::{EngineError, EngineResult};

/// Per-rule lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuleState {
    /// Not active.
    #[default]
    Inactive,
    /// Activation in progress.
    Starting,
    /// Serving traffic.
    Running,
    /// Deactivation in progress.
    Stopping,
    /// The last activation failed.
    Error,
}

impl std::fmt::Display for RuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleState::Inactive => write!(f, "INACTIVE"),
            RuleState::Starting => write!(f, "STARTING"),
            RuleState::Running => write!(f, "RUNNING"),
            RuleState::Stopping => write!(f, "STOPPING"),
            RuleState::Error => write!(f, "ERROR"),
        }
    }
}

/// Which server a map entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerKind {
    Tcp,
    Udp,
    UdpBroadcast,
}

impl ServerKind {
    fn suffix(self) -> &'static str {
        match self {
            ServerKind::Tcp => "TCP",
            ServerKind::Udp => "UDP",
            ServerKind::UdpBroadcast => "UDP_BROADCAST",
        }
    }
}

enum ServerHandle {
    Tcp(TcpServerHandle),
    Udp(UdpServerHandle),
    Broadcast(Arc<BroadcastRelay>),
}

struct ActiveServer {
    rule_id: i64,
    handle: ServerHandle,
}

/// The forwarding data plane's administrator surface.
///
/// All collaborators are wired at construction; the engine owns every piece
/// of per-rule runtime state and tears it down on deactivation.
pub struct ForwardingEngine {
    config: RelayConfig,
    registry: Arc<ClientRegistry>,
    sessions: UdpSessionTable,
    decider: Arc<AccessDecider>,
    connections: Arc<dyn ConnectionSink>,
    metrics: Arc<dyn MetricsSink>,
    listener_status: Arc<dyn ListenerStatusSink>,
    pools: RwLock<HashMap<i64, UpstreamPool>>,
    /// Active servers indexed by `{sourceIp}_{sourcePort}_{suffix}`; this
    /// key space is what enforces the listener-endpoint uniqueness
    /// invariant. The mutex is held across whole activations so competing
    /// control operations serialise.
    servers: Mutex<HashMap<String, ActiveServer>>,
    states: StdRwLock<HashMap<i64, RuleState>>,
    running: AtomicBool,
}

impl ForwardingEngine {
    /// Wire up an engine. Call [`ForwardingEngine::start`] before
    /// activating rules.
    #[must_use]
    pub fn new(
        config: RelayConfig,
        policy: Arc<dyn AccessPolicy>,
        connections: Arc<dyn ConnectionSink>,
        metrics: Arc<dyn MetricsSink>,
        listener_status: Arc<dyn ListenerStatusSink>,
    ) -> Self {
        let registry = Arc::new(ClientRegistry::new(config.buffer.client_buffer_cap));
        let sessions = UdpSessionTable::new(
            config.timing.udp_session_timeout(),
            config.timing.udp_sweep_interval(),
            Arc::clone(&connections),
            Arc::clone(&metrics),
        );
        Self {
            config,
            registry,
            sessions,
            decider: Arc::new(AccessDecider::new(policy)),
            connections,
            metrics,
            listener_status,
            pools: RwLock::new(HashMap::new()),
            servers: Mutex::new(HashMap::new()),
            states: StdRwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Mark the engine running and start the shared UDP session sweeper.
    /// Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sessions.start_sweeper();
        info!(
            udp_mode = ?self.config.udp.mode,
            "forwarding engine started"
        );
    }

    /// Whether the engine accepts activations.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Number of active server endpoints (a TCP_UDP rule counts twice).
    pub async fn active_server_count(&self) -> usize {
        self.servers.lock().await.len()
    }

    /// Lifecycle state of a rule.
    #[must_use]
    pub fn rule_state(&self, rule_id: i64) -> RuleState {
        self.states
            .read()
            .expect("states lock poisoned")
            .get(&rule_id)
            .copied()
            .unwrap_or_default()
    }

    /// Activate a rule: create its upstream pool (unless broadcast-only)
    /// and bind its listeners. Activating an already-running rule is a
    /// no-op success; any sub-start failure rolls everything back.
    pub async fn activate(&self, rule: &ForwardRule) -> bool {
        match self.try_activate(rule).await {
            Ok(()) => true,
            Err(EngineError::NotRunning) => {
                warn!(rule = %rule.name, "engine not running, cannot activate");
                false
            }
            Err(e) => {
                error!(rule = %rule.name, error = %e, "rule activation failed");
                self.set_state(rule.id, RuleState::Inactive);
                false
            }
        }
    }

    async fn try_activate(&self, rule: &ForwardRule) -> EngineResult<()> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        rule.validate()?;
        if !rule.enabled {
            return Err(EngineError::RuleDisabled(rule.name.clone()));
        }

        let mut servers = self.servers.lock().await;
        let kinds = self.kinds_for(rule);

        // Same rule already active: idempotent success. A different rule on
        // the same endpoint: refused.
        for kind in &kinds {
            let key = server_key(rule, *kind);
            if let Some(existing) = servers.get(&key) {
                if existing.rule_id == rule.id {
                    info!(rule = %rule.name, "rule already active");
                    return Ok(());
                }
                return Err(EngineError::EndpointBusy {
                    key,
                    holder: existing.rule_id,
                });
            }
        }

        self.set_state(rule.id, RuleState::Starting);

        // Broadcast rules have no upstream to pool toward.
        let needs_pool = rule.protocol.has_tcp()
            || (rule.protocol.has_udp() && self.config.udp.mode == UdpMode::PointToPoint);
        if needs_pool {
            // The global reconnect switch overrides per-rule settings.
            let mut pool_rule = rule.clone();
            if !self.config.reconnect.enabled {
                pool_rule.auto_reconnect = false;
            }
            let pool = UpstreamPool::new(
                pool_rule,
                self.config.tcp.clone(),
                Arc::clone(&self.registry),
            );
            pool.start();
            self.pools.write().await.insert(rule.id, pool);
        }

        let mut started: Vec<(String, ActiveServer)> = Vec::new();
        for kind in kinds {
            match self.start_server(rule, kind).await {
                Ok(handle) => {
                    started.push((
                        server_key(rule, kind),
                        ActiveServer {
                            rule_id: rule.id,
                            handle,
                        },
                    ));
                }
                Err(e) => {
                    // Partial activation: close what came up, drop the pool.
                    for (_, server) in started {
                        self.stop_server(server).await;
                    }
                    if let Some(pool) = self.pools.write().await.remove(&rule.id) {
                        pool.shutdown();
                    }
                    return Err(e);
                }
            }
        }

        for (key, server) in started {
            let kind_proto = match server.handle {
                ServerHandle::Tcp(_) => Protocol::Tcp,
                ServerHandle::Udp(_) | ServerHandle::Broadcast(_) => Protocol::Udp,
            };
            self.listener_status
                .create_listener(rule.id, rule.source_port, kind_proto);
            self.listener_status.set_waiting(rule.id, kind_proto);
            servers.insert(key, server);
        }

        self.metrics.inc_forwarding_rules();
        self.set_state(rule.id, RuleState::Running);
        info!(
            rule = %rule.name,
            listener = %rule.bind_addr(),
            target = %rule.target_addr(),
            protocol = %rule.protocol,
            "rule activated"
        );
        Ok(())
    }

    /// Deactivate a rule: close its listeners, shut its pool, drop its
    /// clients, sessions, and subscriptions. Deactivating an inactive rule
    /// is a no-op success.
    pub async fn deactivate(&self, rule: &ForwardRule) -> bool {
        let mut servers = self.servers.lock().await;
        self.set_state(rule.id, RuleState::Stopping);

        let mut found = false;
        for kind in [ServerKind::Tcp, ServerKind::Udp, ServerKind::UdpBroadcast] {
            let key = server_key(rule, kind);
            let owned = servers
                .get(&key)
                .is_some_and(|server| server.rule_id == rule.id);
            if owned {
                if let Some(server) = servers.remove(&key) {
                    self.stop_server(server).await;
                    found = true;
                }
            }
        }

        if let Some(pool) = self.pools.write().await.remove(&rule.id) {
            pool.shutdown();
        }
        let dropped_clients = self.registry.remove_rule(rule.id).await;
        let dropped_sessions = self.sessions.remove_rule(rule.id).await;
        self.listener_status.stop_listener(rule.id);

        if found {
            self.metrics.dec_forwarding_rules();
            info!(
                rule = %rule.name,
                dropped_clients,
                dropped_sessions,
                "rule deactivated"
            );
        }
        self.set_state(rule.id, RuleState::Inactive);
        true
    }

    /// Deactivate every active rule and stop the shared sweeper.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("forwarding engine shutting down");

        let drained: Vec<ActiveServer> = {
            let mut servers = self.servers.lock().await;
            servers.drain().map(|(_, s)| s).collect()
        };
        for server in drained {
            let rule_id = server.rule_id;
            self.stop_server(server).await;
            self.listener_status.stop_listener(rule_id);
            self.registry.remove_rule(rule_id).await;
            self.set_state(rule_id, RuleState::Inactive);
        }

        let pools: Vec<UpstreamPool> =
            self.pools.write().await.drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.shutdown();
        }

        self.sessions.shutdown().await;
        info!("forwarding engine stopped");
    }

    /// Pool snapshot for a rule, if it has one.
    pub async fn pool_status(&self, rule_id: i64) -> Option<PoolStatus> {
        self.pools.read().await.get(&rule_id).map(|p| p.status())
    }

    /// Client statistics for a rule.
    pub async fn client_stats(&self, rule_id: i64) -> ClientStats {
        self.registry.stats(rule_id).await
    }

    /// UDP point-to-point session statistics (table-wide).
    pub async fn session_stats(&self) -> SessionStats {
        self.sessions.stats().await
    }

    /// Broadcast statistics for a rule, if it runs in broadcast mode.
    pub async fn broadcast_stats(&self, rule_id: i64) -> Option<BroadcastStats> {
        let servers = self.servers.lock().await;
        for server in servers.values() {
            if server.rule_id == rule_id {
                if let ServerHandle::Broadcast(relay) = &server.handle {
                    return Some(relay.stats().await);
                }
            }
        }
        None
    }

    /// The access decider used on the accept path.
    #[must_use]
    pub fn decider(&self) -> &Arc<AccessDecider> {
        &self.decider
    }

    /// The client registry (read-only views for embedders).
    #[must_use]
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    fn kinds_for(&self, rule: &ForwardRule) -> Vec<ServerKind> {
        let mut kinds = Vec::new();
        if rule.protocol.has_tcp() {
            kinds.push(ServerKind::Tcp);
        }
        if rule.protocol.has_udp() {
            kinds.push(match self.config.udp.mode {
                UdpMode::PointToPoint => ServerKind::Udp,
                UdpMode::Broadcast => ServerKind::UdpBroadcast,
            });
        }
        kinds
    }

    async fn start_server(&self, rule: &ForwardRule, kind: ServerKind) -> EngineResult<ServerHandle> {
        match kind {
            ServerKind::Tcp => {
                let pool = self
                    .pools
                    .read()
                    .await
                    .get(&rule.id)
                    .cloned()
                    .expect("TCP rule activated without a pool");
                let server = TcpRelayServer::new(
                    rule.clone(),
                    self.config.tcp.clone(),
                    &self.config.timing,
                    Arc::clone(&self.registry),
                    pool,
                    Arc::clone(&self.decider),
                    Arc::clone(&self.connections),
                    Arc::clone(&self.metrics),
                    Arc::clone(&self.listener_status),
                );
                Ok(ServerHandle::Tcp(server.start().await?))
            }
            ServerKind::Udp => {
                let server = UdpRelayServer::new(
                    rule.clone(),
                    self.config.udp.clone(),
                    self.sessions.clone(),
                    Arc::clone(&self.connections),
                    Arc::clone(&self.metrics),
                );
                Ok(ServerHandle::Udp(server.start().await?))
            }
            ServerKind::UdpBroadcast => {
                let relay = BroadcastRelay::start(
                    rule.clone(),
                    self.config.udp.clone(),
                    &self.config.timing,
                    Arc::clone(&self.connections),
                    Arc::clone(&self.metrics),
                )
                .await?;
                Ok(ServerHandle::Broadcast(relay))
            }
        }
    }

    async fn stop_server(&self, server: ActiveServer) {
        let grace = self.config.timing.shutdown_grace();
        match server.handle {
            ServerHandle::Tcp(handle) => handle.stop(grace).await,
            ServerHandle::Udp(handle) => handle.stop(grace).await,
            ServerHandle::Broadcast(relay) => relay.stop(grace).await,
        }
    }

    fn set_state(&self, rule_id: i64, state: RuleState) {
        self.states
            .write()
            .expect("states lock poisoned")
            .insert(rule_id, state);
    }
}

fn server_key(rule: &ForwardRule, kind: ServerKind) -> String {
    format!("{}_{}", rule.rule_key(), kind.suffix())
}
