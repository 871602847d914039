//! Inbound UDP relay loop for one rule.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::SockRef;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::UdpSettings;
use crate::rule::{ForwardRule, Protocol};
use crate::sink::{ConnectionRecord, ConnectionSink, ConnectionStatus, MetricsSink};

use super::error::{UdpRelayError, UdpRelayResult};
use super::session::{SessionKey, UdpSession, UdpSessionTable};

/// Handle to a running UDP relay server.
pub struct UdpServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    recv_task: JoinHandle<()>,
}

impl UdpServerHandle {
    /// The address the inbound socket actually bound.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal the receive loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop the server, waiting up to `grace` before aborting the loop.
    pub async fn stop(mut self, grace: Duration) {
        self.shutdown();
        if timeout(grace, &mut self.recv_task).await.is_err() {
            warn!(address = %self.local_addr, "UDP receive loop did not stop in time, aborting");
            self.recv_task.abort();
        }
    }
}

/// Point-to-point UDP relay for one forwarding rule.
pub struct UdpRelayServer {
    rule: ForwardRule,
    udp: UdpSettings,
    table: UdpSessionTable,
    connections: Arc<dyn ConnectionSink>,
    metrics: Arc<dyn MetricsSink>,
}

impl UdpRelayServer {
    /// Wire up a server for a rule.
    #[must_use]
    pub fn new(
        rule: ForwardRule,
        udp: UdpSettings,
        table: UdpSessionTable,
        connections: Arc<dyn ConnectionSink>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            rule,
            udp,
            table,
            connections,
            metrics,
        }
    }

    /// Bind the inbound socket and start relaying datagrams.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound; this is fatal for
    /// the rule activation.
    pub async fn start(self) -> UdpRelayResult<UdpServerHandle> {
        let addr = self.rule.bind_addr();
        let inbound = UdpSocket::bind(addr)
            .await
            .map_err(|e| UdpRelayError::BindError { address: addr, source: e })?;
        let local_addr = inbound
            .local_addr()
            .map_err(|e| UdpRelayError::BindError { address: addr, source: e })?;
        tune_socket(&inbound, &self.udp);

        info!(
            rule = %self.rule.name,
            address = %local_addr,
            target = %self.rule.target_addr(),
            "UDP relay listening"
        );

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let inbound = Arc::new(inbound);
        let server = Arc::new(self);

        let loop_server = Arc::clone(&server);
        let loop_inbound = Arc::clone(&inbound);
        let recv_task = tokio::spawn(async move {
            let mut buf = vec![0u8; loop_server.udp.max_datagram_size];
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    received = loop_inbound.recv_from(&mut buf) => match received {
                        Ok((n, peer)) => {
                            loop_server
                                .relay_datagram(&loop_inbound, peer, &buf[..n])
                                .await;
                        }
                        Err(e) => {
                            warn!(rule = %loop_server.rule.name, error = %e, "UDP receive failed");
                        }
                    }
                }
            }
            info!(rule = %loop_server.rule.name, "UDP relay stopped");
        });

        Ok(UdpServerHandle {
            local_addr,
            shutdown_tx,
            recv_task,
        })
    }

    /// Forward one inbound datagram through the client's session.
    async fn relay_datagram(&self, inbound: &Arc<UdpSocket>, peer: SocketAddr, payload: &[u8]) {
        let key = SessionKey::new(peer, self.rule.id);

        let session = match self.table.get(key).await {
            Some(session) => session,
            None => match self.open_session(inbound, key).await {
                Some(session) => session,
                // Session setup failed; UDP semantics allow the drop.
                None => return,
            },
        };

        match session
            .outbound()
            .send_to(payload, self.rule.target_addr())
            .await
        {
            Ok(n) => {
                session.touch();
                self.connections
                    .update_traffic(session.connection_id(), 0, n as u64, 0, 1);
                self.metrics.add_bytes_transferred(n as u64);
                debug!(session = %key, bytes = n, "forwarded datagram to upstream");
            }
            Err(e) => {
                // Per-datagram errors never tear the session down.
                warn!(session = %key, error = %e, "datagram forward failed");
                self.metrics.inc_transfer_errors();
            }
        }
    }

    /// Bind an ephemeral outbound socket for a new downstream client and
    /// start its return-path reader.
    async fn open_session(
        &self,
        inbound: &Arc<UdpSocket>,
        key: SessionKey,
    ) -> Option<Arc<UdpSession>> {
        let outbound = match UdpSocket::bind((self.rule.effective_source_ip(), 0)).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                warn!(session = %key, error = %e, "failed to bind outbound socket");
                self.metrics.inc_connection_errors();
                return None;
            }
        };
        tune_socket(&outbound, &self.udp);

        let mut record =
            ConnectionRecord::new(self.rule.id, Protocol::Udp, self.rule.source_port, key.client);
        record.transition(ConnectionStatus::Connected);
        self.connections.save(&record);

        let session = Arc::new(UdpSession::new(key, Arc::clone(&outbound), record));
        let winner = self.table.insert(Arc::clone(&session)).await;
        if winner.connection_id() != session.connection_id() {
            // Lost the insertion race; the winner already has a reader.
            self.connections.delete(session.connection_id());
            return Some(winner);
        }

        self.metrics.inc_active_connections();
        self.metrics.inc_total_connections();
        info!(
            session = %key,
            target = %self.rule.target_addr(),
            "UDP session created"
        );

        // Return path: upstream datagrams go back to the originating client
        // through the rule's inbound socket.
        let reader_session = Arc::clone(&session);
        let reader_inbound = Arc::clone(inbound);
        let connections = Arc::clone(&self.connections);
        let metrics = Arc::clone(&self.metrics);
        let max_datagram = self.udp.max_datagram_size;
        let mut shutdown_rx = session.shutdown_signal();
        tokio::spawn(async move {
            let mut buf = vec![0u8; max_datagram];
            let client = reader_session.key().client;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    received = outbound.recv_from(&mut buf) => match received {
                        Ok((n, _from)) => {
                            match reader_inbound.send_to(&buf[..n], client).await {
                                Ok(sent) => {
                                    reader_session.touch();
                                    connections.update_traffic(
                                        reader_session.connection_id(),
                                        sent as u64,
                                        0,
                                        1,
                                        0,
                                    );
                                    metrics.add_bytes_transferred(sent as u64);
                                }
                                Err(e) => {
                                    debug!(client = %client, error = %e, "datagram return failed");
                                    metrics.inc_transfer_errors();
                                }
                            }
                        }
                        Err(e) => {
                            debug!(client = %client, error = %e, "outbound socket read failed");
                            metrics.inc_transfer_errors();
                        }
                    }
                }
            }
        });

        Some(session)
    }
}

/// Apply configured buffer sizes; failures are harmless.
fn tune_socket(socket: &UdpSocket, settings: &UdpSettings) {
    let sock = SockRef::from(socket);
    if let Err(e) = sock.set_recv_buffer_size(settings.recv_buffer_size) {
        debug!(error = %e, "failed to set SO_RCVBUF");
    }
    if let Err(e) = sock.set_send_buffer_size(settings.send_buffer_size) {
        debug!(error = %e, "failed to set SO_SNDBUF");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    use crate::sink::{AtomicMetrics, MemoryConnectionSink};

    async fn start_udp_echo() -> (SocketAddr, JoinHandle<()>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 65535];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], peer).await;
            }
        });
        (addr, handle)
    }

    struct Fixture {
        handle: UdpServerHandle,
        table: UdpSessionTable,
        connections: Arc<MemoryConnectionSink>,
    }

    async fn start_relay(upstream: SocketAddr, timeout_ms: u64) -> Fixture {
        let connections = Arc::new(MemoryConnectionSink::new());
        let metrics = Arc::new(AtomicMetrics::new());
        let table = UdpSessionTable::new(
            Duration::from_millis(timeout_ms),
            Duration::from_millis(25),
            Arc::clone(&connections) as Arc<dyn ConnectionSink>,
            Arc::clone(&metrics) as Arc<dyn MetricsSink>,
        );
        table.start_sweeper();

        // Probe an ephemeral port for the inbound socket.
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let rule = ForwardRule::new(1, "udp-test", port, upstream.ip(), upstream.port(), Protocol::Udp)
            .with_source_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));

        let server = UdpRelayServer::new(
            rule,
            UdpSettings::default(),
            table.clone(),
            Arc::clone(&connections) as Arc<dyn ConnectionSink>,
            metrics,
        );
        let handle = server.start().await.unwrap();

        Fixture {
            handle,
            table,
            connections,
        }
    }

    #[tokio::test]
    async fn test_datagram_round_trip() {
        let (upstream, _echo) = start_udp_echo().await;
        let fx = start_relay(upstream, 5_000).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"A", fx.handle.local_addr()).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"A");
        assert_eq!(from, fx.handle.local_addr());

        let stats = fx.table.stats().await;
        assert_eq!(stats.current, 1);
        assert_eq!(stats.total, 1);

        fx.handle.stop(Duration::from_secs(1)).await;
        fx.table.shutdown().await;
    }

    #[tokio::test]
    async fn test_one_session_per_client() {
        let (upstream, _echo) = start_udp_echo().await;
        let fx = start_relay(upstream, 5_000).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for _ in 0..3 {
            client.send_to(b"x", fx.handle.local_addr()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(fx.table.stats().await.total, 1);
        assert_eq!(fx.connections.len(), 1);

        fx.handle.stop(Duration::from_secs(1)).await;
        fx.table.shutdown().await;
    }

    #[tokio::test]
    async fn test_session_expires_after_silence() {
        let (upstream, _echo) = start_udp_echo().await;
        let fx = start_relay(upstream, 60).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"A", fx.handle.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.table.stats().await.current, 1);

        // Silence past the timeout; the sweeper runs every 25 ms.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let stats = fx.table.stats().await;
        assert_eq!(stats.current, 0);
        assert_eq!(stats.expired, 1);

        // UDP records are retained and marked disconnected.
        let records = fx.connections.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ConnectionStatus::Disconnected);

        fx.handle.stop(Duration::from_secs(1)).await;
        fx.table.shutdown().await;
    }
}
