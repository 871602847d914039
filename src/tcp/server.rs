//! TCP listener and per-client pipeline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use socket2::{Domain, Socket, Type};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::access::AccessDecider;
use crate::config::{TcpSettings, TimingSettings};
use crate::pool::UpstreamPool;
use crate::registry::{ClientRegistry, ForwardOutcome};
use crate::rule::{ForwardRule, Protocol};
use crate::sink::{ConnectionRecord, ConnectionSink, ConnectionStatus, ListenerStatusSink, MetricsSink};

use super::error::{TcpRelayError, TcpRelayResult};

/// Handle to a running TCP relay server.
pub struct TcpServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl TcpServerHandle {
    /// The address the listener actually bound.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal the accept loop and every client task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop the server, waiting up to `grace` for the accept loop before
    /// aborting it.
    pub async fn stop(mut self, grace: Duration) {
        self.shutdown();
        if timeout(grace, &mut self.accept_task).await.is_err() {
            warn!(address = %self.local_addr, "accept loop did not stop in time, aborting");
            self.accept_task.abort();
        }
    }
}

/// TCP relay server for one forwarding rule.
///
/// Collaborators are wired explicitly at construction; the server owns no
/// global state and can run against in-memory sinks.
pub struct TcpRelayServer {
    rule: ForwardRule,
    tcp: TcpSettings,
    idle_timeout: Duration,
    registry: Arc<ClientRegistry>,
    pool: UpstreamPool,
    decider: Arc<AccessDecider>,
    connections: Arc<dyn ConnectionSink>,
    metrics: Arc<dyn MetricsSink>,
    listener_status: Arc<dyn ListenerStatusSink>,
}

impl TcpRelayServer {
    /// Wire up a server for a rule.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        rule: ForwardRule,
        tcp: TcpSettings,
        timing: &TimingSettings,
        registry: Arc<ClientRegistry>,
        pool: UpstreamPool,
        decider: Arc<AccessDecider>,
        connections: Arc<dyn ConnectionSink>,
        metrics: Arc<dyn MetricsSink>,
        listener_status: Arc<dyn ListenerStatusSink>,
    ) -> Self {
        Self {
            rule,
            tcp,
            idle_timeout: timing.tcp_idle_timeout(),
            registry,
            pool,
            decider,
            connections,
            metrics,
            listener_status,
        }
    }

    /// Bind the listener and start accepting clients.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound; this is fatal for
    /// the rule activation.
    pub async fn start(self) -> TcpRelayResult<TcpServerHandle> {
        let addr = self.rule.bind_addr();
        let listener = bind_listener(addr, self.tcp.so_backlog)?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TcpRelayError::BindError { address: addr, source: e })?;

        info!(
            rule = %self.rule.name,
            address = %local_addr,
            target = %self.rule.target_addr(),
            "TCP relay listening"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = Arc::new(self);
        let accept_server = Arc::clone(&server);
        let accept_task = tokio::spawn(async move {
            accept_server.accept_loop(listener, shutdown_rx).await;
        });

        Ok(TcpServerHandle {
            local_addr,
            shutdown_tx,
            accept_task,
        })
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, shutdown_rx: watch::Receiver<bool>) {
        let mut shutdown = shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        let client_shutdown = shutdown_rx.clone();
                        tokio::spawn(async move {
                            server.handle_client(stream, peer, client_shutdown).await;
                        });
                    }
                    Err(e) => {
                        warn!(rule = %self.rule.name, error = %e, "accept failed");
                        self.metrics.inc_connection_errors();
                    }
                }
            }
        }
        info!(rule = %self.rule.name, "TCP relay stopped accepting");
    }

    async fn handle_client(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        // Access control comes before any other work on the connection.
        if !self.decider.allowed(peer.ip(), self.rule.id) {
            warn!(rule = %self.rule.name, peer = %peer, "client denied by access policy");
            self.metrics.inc_connection_errors();
            return;
        }

        if let Err(e) = self.configure_stream(&stream) {
            debug!(peer = %peer, error = %e, "failed to tune client socket");
        }

        let mut record =
            ConnectionRecord::new(self.rule.id, Protocol::Tcp, self.rule.source_port, peer);
        record.transition(ConnectionStatus::Connected);
        self.connections.save(&record);
        let connection_id = record.connection_id;

        let (mut read_half, write_half) = stream.into_split();
        let entry = self
            .registry
            .register(self.rule.id, connection_id, write_half)
            .await;

        self.listener_status
            .on_client_connected(self.rule.id, Protocol::Tcp);
        self.metrics.inc_active_connections();
        self.metrics.inc_total_connections();

        info!(
            rule = %self.rule.name,
            peer = %peer,
            connection = %connection_id,
            "TCP client connected"
        );

        let mut buf = vec![0u8; self.tcp.read_buffer_size];
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                result = timeout(self.idle_timeout, read_half.read(&mut buf)) => match result {
                    Err(_) => {
                        // The read timer expired, but replies also count as
                        // activity; only close when both directions idled.
                        if entry.idle_time() >= self.idle_timeout {
                            info!(connection = %connection_id, "TCP client idle, closing");
                            record.transition(ConnectionStatus::Timeout);
                            self.connections.update(&record);
                            break;
                        }
                    }
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => {
                        let payload = Bytes::copy_from_slice(&buf[..n]);
                        let outcome = self
                            .registry
                            .forward_to_upstream(self.rule.id, connection_id, payload, &self.pool)
                            .await;
                        match outcome {
                            ForwardOutcome::Forwarded => {
                                self.connections
                                    .update_traffic(connection_id, 0, n as u64, 0, 1);
                                self.metrics.add_bytes_transferred(n as u64);
                            }
                            ForwardOutcome::Buffered => {}
                            ForwardOutcome::Dropped => {
                                self.metrics.inc_transfer_errors();
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "TCP client read failed");
                        record.fail(e.to_string());
                        self.connections.update(&record);
                        self.metrics.inc_connection_errors();
                        break;
                    }
                }
            }
        }

        self.registry.unregister(self.rule.id, connection_id).await;
        self.listener_status
            .on_client_disconnected(self.rule.id, Protocol::Tcp);
        // TCP history is not retained: the record is deleted on close.
        self.connections.delete(connection_id);
        self.metrics.dec_active_connections();

        info!(connection = %connection_id, "TCP client disconnected");
    }

    fn configure_stream(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.tcp.tcp_nodelay)?;
        if self.tcp.so_keepalive {
            socket2::SockRef::from(stream).set_keepalive(true)?;
        }
        Ok(())
    }
}

/// Bind a TCP listener with an explicit backlog.
fn bind_listener(addr: SocketAddr, backlog: u32) -> TcpRelayResult<TcpListener> {
    let map_err = |source| TcpRelayError::BindError { address: addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None).map_err(map_err)?;
    socket.set_reuse_address(true).map_err(map_err)?;
    socket.set_nonblocking(true).map_err(map_err)?;
    socket.bind(&addr.into()).map_err(map_err)?;
    socket.listen(backlog.min(i32::MAX as u32) as i32).map_err(map_err)?;

    TcpListener::from_std(socket.into()).map_err(map_err)
}
