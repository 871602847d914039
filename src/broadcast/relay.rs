//! The broadcast relay: two sockets, subscription management, fan-out.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::SockRef;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{TimingSettings, UdpSettings};
use crate::rule::{ForwardRule, Protocol};
use crate::sink::{ConnectionRecord, ConnectionSink, ConnectionStatus, MetricsSink};

use super::client::{BroadcastClient, BroadcastStats, ClientTable};
use super::error::{BroadcastError, BroadcastResult};

const SUBSCRIBE: &str = "SUBSCRIBE";
const UNSUBSCRIBE: &str = "UNSUBSCRIBE";
const HEARTBEAT: &str = "HEARTBEAT";

const SUBSCRIBED: &[u8] = b"SUBSCRIBED";
const UNSUBSCRIBED: &[u8] = b"UNSUBSCRIBED";
const HEARTBEAT_ACK: &[u8] = b"HEARTBEAT_ACK";
const AUTO_SUBSCRIBED: &[u8] = b"AUTO_SUBSCRIBED";

/// Subscription-based UDP fan-out for one forwarding rule.
///
/// Created running via [`BroadcastRelay::start`]; owned by the engine and
/// stopped on rule deactivation.
pub struct BroadcastRelay {
    rule: ForwardRule,
    downstream: Arc<UdpSocket>,
    upstream: Arc<UdpSocket>,
    downstream_addr: SocketAddr,
    upstream_addr: SocketAddr,
    subscribers: ClientTable,
    senders: ClientTable,
    client_timeout: Duration,
    connections: Arc<dyn ConnectionSink>,
    metrics: Arc<dyn MetricsSink>,
    bytes_rx: AtomicU64,
    bytes_tx: AtomicU64,
    packets_rx: AtomicU64,
    packets_tx: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl BroadcastRelay {
    /// Bind both sockets and start the receive loops and the heartbeat
    /// sweeper.
    ///
    /// # Errors
    ///
    /// Returns an error if either socket cannot be bound; this is fatal for
    /// the rule activation.
    pub async fn start(
        rule: ForwardRule,
        udp: UdpSettings,
        timing: &TimingSettings,
        connections: Arc<dyn ConnectionSink>,
        metrics: Arc<dyn MetricsSink>,
    ) -> BroadcastResult<Arc<Self>> {
        let ip = rule.effective_source_ip();

        let downstream_bind = SocketAddr::new(ip, rule.source_port);
        let downstream = bind_socket(downstream_bind, &udp, true).await?;
        let downstream_addr = downstream
            .local_addr()
            .map_err(|e| BroadcastError::BindError { address: downstream_bind, source: e })?;

        let upstream_bind = SocketAddr::new(ip, rule.target_port);
        let upstream = bind_socket(upstream_bind, &udp, false).await?;
        let upstream_addr = upstream
            .local_addr()
            .map_err(|e| BroadcastError::BindError { address: upstream_bind, source: e })?;

        let (shutdown_tx, _) = watch::channel(false);
        let relay = Arc::new(Self {
            rule,
            downstream: Arc::new(downstream),
            upstream: Arc::new(upstream),
            downstream_addr,
            upstream_addr,
            subscribers: ClientTable::new(),
            senders: ClientTable::new(),
            client_timeout: timing.broadcast_client_timeout(),
            connections,
            metrics,
            bytes_rx: AtomicU64::new(0),
            bytes_tx: AtomicU64::new(0),
            packets_rx: AtomicU64::new(0),
            packets_tx: AtomicU64::new(0),
            shutdown_tx,
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        spawn_downstream_loop(&relay, udp.max_datagram_size);
        spawn_upstream_loop(&relay, udp.max_datagram_size);
        spawn_sweeper(&relay, timing.broadcast_sweep_interval());

        info!(
            rule = %relay.rule.name,
            downstream = %downstream_addr,
            upstream = %upstream_addr,
            "UDP broadcast relay started"
        );
        Ok(relay)
    }

    /// Address of the downstream (control + data) socket.
    #[must_use]
    pub fn downstream_addr(&self) -> SocketAddr {
        self.downstream_addr
    }

    /// Address of the upstream (fan-out source) socket.
    #[must_use]
    pub fn upstream_addr(&self) -> SocketAddr {
        self.upstream_addr
    }

    /// Read-only snapshot for the administrator surface.
    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            downstream_clients: self.subscribers.len().await,
            upstream_clients: self.senders.len().await,
            bytes_rx: self.bytes_rx.load(Ordering::Relaxed),
            bytes_tx: self.bytes_tx.load(Ordering::Relaxed),
            packets_rx: self.packets_rx.load(Ordering::Relaxed),
            packets_tx: self.packets_tx.load(Ordering::Relaxed),
        }
    }

    /// Stop the loops, the sweeper, and retire every registered peer.
    pub async fn stop(&self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("tasks lock poisoned"));
        for mut task in tasks {
            if timeout(grace, &mut task).await.is_err() {
                warn!(rule = %self.rule.name, "broadcast task did not stop in time, aborting");
                task.abort();
            }
        }

        for client in self.subscribers.drain().await {
            self.retire(&client);
        }
        for client in self.senders.drain().await {
            self.retire(&client);
        }

        info!(rule = %self.rule.name, "UDP broadcast relay stopped");
    }

    /// Control protocol plus downstream-originated data.
    async fn handle_downstream(&self, payload: &[u8], peer: SocketAddr) {
        self.bytes_rx.fetch_add(payload.len() as u64, Ordering::Relaxed);
        self.packets_rx.fetch_add(1, Ordering::Relaxed);

        // Commands are exact ASCII literals; surrounding whitespace is
        // tolerated, anything else is data.
        let command = std::str::from_utf8(payload).map(str::trim);
        match command {
            Ok(SUBSCRIBE) => {
                self.register_subscriber(peer).await;
                self.reply(SUBSCRIBED, peer).await;
            }
            Ok(UNSUBSCRIBE) => {
                if let Some(client) = self.subscribers.remove(peer).await {
                    self.retire(&client);
                    info!(rule = %self.rule.name, peer = %peer, "subscriber left");
                    self.reply(UNSUBSCRIBED, peer).await;
                }
            }
            Ok(HEARTBEAT) => {
                if self.subscribers.refresh(peer).await {
                    self.reply(HEARTBEAT_ACK, peer).await;
                }
            }
            _ => {
                // Data payload: auto-subscribe unknown clients, refresh
                // known ones, and forward to every upstream sender.
                if self.subscribers.refresh(peer).await {
                    debug!(rule = %self.rule.name, peer = %peer, "data from subscriber");
                } else {
                    self.register_subscriber(peer).await;
                    info!(rule = %self.rule.name, peer = %peer, "auto-subscribed client");
                    self.reply(AUTO_SUBSCRIBED, peer).await;
                }
                self.forward_to_senders(payload, peer).await;
            }
        }
    }

    /// Upstream data: auto-register the sender, fan out to subscribers.
    async fn handle_upstream(&self, payload: &[u8], peer: SocketAddr) {
        self.bytes_rx.fetch_add(payload.len() as u64, Ordering::Relaxed);
        self.packets_rx.fetch_add(1, Ordering::Relaxed);

        if !self.senders.refresh(peer).await {
            let connection_id = self
                .register_peer(&self.senders, peer, self.rule.target_port)
                .await;
            info!(
                rule = %self.rule.name,
                peer = %peer,
                connection = %connection_id,
                "registered upstream sender"
            );
        }

        let subscribers = self.subscribers.snapshot().await;
        if subscribers.is_empty() {
            debug!(rule = %self.rule.name, "no subscribers, dropping upstream datagram");
            return;
        }

        let size = payload.len();
        let mut delivered = 0u64;
        for subscriber in &subscribers {
            match self.downstream.send_to(payload, subscriber.addr()).await {
                Ok(_) => {
                    delivered += 1;
                    subscriber.heartbeat();
                    self.connections.update_traffic(
                        subscriber.connection_id(),
                        size as u64,
                        0,
                        1,
                        0,
                    );
                }
                Err(e) => {
                    // Transient per-subscriber failure; eviction is the
                    // heartbeat sweeper's job.
                    warn!(peer = %subscriber.addr(), error = %e, "fan-out send failed");
                    self.metrics.inc_transfer_errors();
                }
            }
        }

        self.bytes_tx
            .fetch_add(size as u64 * delivered, Ordering::Relaxed);
        self.packets_tx.fetch_add(delivered, Ordering::Relaxed);
        self.metrics.add_bytes_transferred(size as u64 * delivered);
        debug!(
            rule = %self.rule.name,
            from = %peer,
            subscribers = delivered,
            bytes = size,
            "fanned out upstream datagram"
        );
    }

    /// Forward a downstream payload to every registered upstream sender.
    async fn forward_to_senders(&self, payload: &[u8], from: SocketAddr) {
        let senders = self.senders.snapshot().await;
        if senders.is_empty() {
            debug!(rule = %self.rule.name, from = %from, "no upstream senders, dropping data");
            return;
        }

        let size = payload.len();
        let mut delivered = 0u64;
        for sender in &senders {
            match self.upstream.send_to(payload, sender.addr()).await {
                Ok(_) => delivered += 1,
                Err(e) => {
                    warn!(peer = %sender.addr(), error = %e, "forward to upstream sender failed");
                    self.metrics.inc_transfer_errors();
                }
            }
        }

        self.bytes_tx
            .fetch_add(size as u64 * delivered, Ordering::Relaxed);
        self.packets_tx.fetch_add(delivered, Ordering::Relaxed);
        self.metrics.add_bytes_transferred(size as u64 * delivered);
    }

    async fn register_subscriber(&self, peer: SocketAddr) {
        if self.subscribers.get(peer).await.is_some() {
            // Re-subscribing refreshes the heartbeat.
            self.subscribers.refresh(peer).await;
            return;
        }
        let connection_id = self
            .register_peer(&self.subscribers, peer, self.rule.source_port)
            .await;
        let subscriber_count = self.subscribers.len().await;
        info!(
            rule = %self.rule.name,
            peer = %peer,
            connection = %connection_id,
            subscribers = subscriber_count,
            "subscriber registered"
        );
    }

    /// Create a record for a new peer and insert it into the table.
    async fn register_peer(
        &self,
        table: &ClientTable,
        peer: SocketAddr,
        local_port: u16,
    ) -> uuid::Uuid {
        let mut record = ConnectionRecord::new(self.rule.id, Protocol::Udp, local_port, peer);
        record.transition(ConnectionStatus::Connected);
        self.connections.save(&record);

        let client = Arc::new(BroadcastClient::new(peer, record));
        let id = client.connection_id();
        let winner = table.insert(client).await;
        if winner.connection_id() != id {
            // Lost a registration race; drop the redundant record.
            self.connections.delete(id);
        } else {
            self.metrics.inc_active_connections();
            self.metrics.inc_total_connections();
        }
        winner.connection_id()
    }

    fn retire(&self, client: &BroadcastClient) {
        let mut record = client.record().clone();
        if record.transition(ConnectionStatus::Disconnected) {
            self.connections.update(&record);
        }
        self.metrics.dec_active_connections();
    }

    async fn reply(&self, response: &[u8], peer: SocketAddr) {
        if let Err(e) = self.downstream.send_to(response, peer).await {
            warn!(peer = %peer, error = %e, "control reply failed");
            self.metrics.inc_transfer_errors();
        }
    }
}

fn spawn_downstream_loop(relay: &Arc<BroadcastRelay>, max_datagram: usize) {
    let task_relay = Arc::clone(relay);
    let mut shutdown_rx = relay.shutdown_tx.subscribe();
    let handle = tokio::spawn(async move {
        let mut buf = vec![0u8; max_datagram];
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                received = task_relay.downstream.recv_from(&mut buf) => match received {
                    Ok((n, peer)) => task_relay.handle_downstream(&buf[..n], peer).await,
                    Err(e) => {
                        warn!(rule = %task_relay.rule.name, error = %e, "downstream receive failed");
                        task_relay.metrics.inc_transfer_errors();
                    }
                }
            }
        }
    });
    relay.tasks.lock().expect("tasks lock poisoned").push(handle);
}

fn spawn_upstream_loop(relay: &Arc<BroadcastRelay>, max_datagram: usize) {
    let task_relay = Arc::clone(relay);
    let mut shutdown_rx = relay.shutdown_tx.subscribe();
    let handle = tokio::spawn(async move {
        let mut buf = vec![0u8; max_datagram];
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                received = task_relay.upstream.recv_from(&mut buf) => match received {
                    Ok((n, peer)) => task_relay.handle_upstream(&buf[..n], peer).await,
                    Err(e) => {
                        warn!(rule = %task_relay.rule.name, error = %e, "upstream receive failed");
                        task_relay.metrics.inc_transfer_errors();
                    }
                }
            }
        }
    });
    relay.tasks.lock().expect("tasks lock poisoned").push(handle);
}

fn spawn_sweeper(relay: &Arc<BroadcastRelay>, interval: Duration) {
    let task_relay = Arc::clone(relay);
    let mut shutdown_rx = relay.shutdown_tx.subscribe();
    let handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tick.tick() => {
                    let now = Instant::now();
                    let window = task_relay.client_timeout;
                    let lapsed_subs = task_relay.subscribers.sweep(now, window).await;
                    let lapsed_senders = task_relay.senders.sweep(now, window).await;
                    for client in lapsed_subs.iter().chain(lapsed_senders.iter()) {
                        info!(
                            rule = %task_relay.rule.name,
                            peer = %client.addr(),
                            "broadcast peer timed out"
                        );
                        task_relay.retire(client);
                    }
                }
            }
        }
    });
    relay.tasks.lock().expect("tasks lock poisoned").push(handle);
}

/// Bind one relay socket with tuned buffers; the downstream socket also
/// sets `SO_BROADCAST` (fan-out itself stays unicast per subscriber).
async fn bind_socket(
    addr: SocketAddr,
    settings: &UdpSettings,
    broadcast: bool,
) -> BroadcastResult<UdpSocket> {
    let socket = UdpSocket::bind(addr)
        .await
        .map_err(|e| BroadcastError::BindError { address: addr, source: e })?;

    let sock = SockRef::from(&socket);
    if broadcast {
        if let Err(e) = sock.set_broadcast(true) {
            debug!(address = %addr, error = %e, "failed to set SO_BROADCAST");
        }
    }
    if let Err(e) = sock.set_recv_buffer_size(settings.recv_buffer_size) {
        debug!(address = %addr, error = %e, "failed to set SO_RCVBUF");
    }
    if let Err(e) = sock.set_send_buffer_size(settings.send_buffer_size) {
        debug!(address = %addr, error = %e, "failed to set SO_SNDBUF");
    }
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    use crate::sink::{AtomicMetrics, MemoryConnectionSink};

    async fn start_relay() -> (Arc<BroadcastRelay>, Arc<MemoryConnectionSink>) {
        let connections = Arc::new(MemoryConnectionSink::new());
        // Port 0 on both sockets: the kernel assigns ephemeral ports.
        let rule = ForwardRule {
            id: 1,
            name: "bcast-test".to_string(),
            source_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            source_port: 0,
            target_port: 0,
            ..ForwardRule::default()
        };
        let timing = TimingSettings {
            broadcast_client_timeout_secs: 300,
            broadcast_sweep_interval_secs: 60,
            ..TimingSettings::default()
        };
        let relay = BroadcastRelay::start(
            rule,
            UdpSettings::default(),
            &timing,
            Arc::clone(&connections) as Arc<dyn ConnectionSink>,
            Arc::new(AtomicMetrics::new()),
        )
        .await
        .unwrap();
        (relay, connections)
    }

    async fn recv_text(socket: &UdpSocket) -> String {
        let mut buf = [0u8; 256];
        let (n, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("timed out")
            .unwrap();
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    #[tokio::test]
    async fn test_subscribe_and_fan_out() {
        let (relay, _connections) = start_relay().await;

        let c1 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let c2 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for client in [&c1, &c2] {
            client
                .send_to(b"SUBSCRIBE", relay.downstream_addr())
                .await
                .unwrap();
            assert_eq!(recv_text(client).await, "SUBSCRIBED");
        }
        assert_eq!(relay.stats().await.downstream_clients, 2);

        let source = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        source
            .send_to(b"market-data", relay.upstream_addr())
            .await
            .unwrap();

        assert_eq!(recv_text(&c1).await, "market-data");
        assert_eq!(recv_text(&c2).await, "market-data");

        let stats = relay.stats().await;
        assert_eq!(stats.upstream_clients, 1);
        assert_eq!(stats.bytes_tx, 11 * 2);

        relay.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_unsubscribed_client_receives_nothing() {
        let (relay, _connections) = start_relay().await;

        let c1 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let c2 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for client in [&c1, &c2] {
            client
                .send_to(b"SUBSCRIBE", relay.downstream_addr())
                .await
                .unwrap();
            recv_text(client).await;
        }

        c1.send_to(b"UNSUBSCRIBE", relay.downstream_addr())
            .await
            .unwrap();
        assert_eq!(recv_text(&c1).await, "UNSUBSCRIBED");

        let source = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        source.send_to(b"tick", relay.upstream_addr()).await.unwrap();

        assert_eq!(recv_text(&c2).await, "tick");
        let mut buf = [0u8; 16];
        assert!(
            timeout(Duration::from_millis(300), c1.recv_from(&mut buf))
                .await
                .is_err(),
            "unsubscribed client still received fan-out"
        );

        relay.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_heartbeat_ack_only_for_subscribers() {
        let (relay, _connections) = start_relay().await;

        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        stranger
            .send_to(b"HEARTBEAT", relay.downstream_addr())
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        assert!(
            timeout(Duration::from_millis(300), stranger.recv_from(&mut buf))
                .await
                .is_err(),
            "unknown client got a heartbeat ack"
        );

        let member = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        member
            .send_to(b"SUBSCRIBE", relay.downstream_addr())
            .await
            .unwrap();
        recv_text(&member).await;
        member
            .send_to(b"HEARTBEAT", relay.downstream_addr())
            .await
            .unwrap();
        assert_eq!(recv_text(&member).await, "HEARTBEAT_ACK");

        relay.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_data_payload_auto_subscribes_and_reaches_senders() {
        let (relay, _connections) = start_relay().await;

        // Register an upstream sender by sending anything to the upstream
        // socket.
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"hello", relay.upstream_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(relay.stats().await.upstream_clients, 1);

        // A fresh client sends raw data to the downstream socket.
        let newcomer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        newcomer
            .send_to(b"query", relay.downstream_addr())
            .await
            .unwrap();
        assert_eq!(recv_text(&newcomer).await, "AUTO_SUBSCRIBED");

        // The payload reaches the registered upstream sender.
        assert_eq!(recv_text(&sender).await, "query");
        assert_eq!(relay.stats().await.downstream_clients, 1);

        relay.stop(Duration::from_secs(1)).await;
    }
}
