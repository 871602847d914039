//! End-to-end relay scenarios against the full engine.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio::time::timeout;

use portrelay::access::{AccessAction, AccessRule, Cidr, MemoryAccessPolicy};
use portrelay::config::{RelayConfig, UdpMode};
use portrelay::engine::ForwardingEngine;
use portrelay::pool::PoolState;
use portrelay::rule::{ForwardRule, Protocol};
use portrelay::sink::{
    AtomicMetrics, ConnectionStatus, MemoryConnectionSink, MemoryListenerStatus,
};

struct Harness {
    engine: Arc<ForwardingEngine>,
    policy: Arc<MemoryAccessPolicy>,
    connections: Arc<MemoryConnectionSink>,
    metrics: Arc<AtomicMetrics>,
}

fn harness(config: RelayConfig) -> Harness {
    let policy = Arc::new(MemoryAccessPolicy::new());
    let connections = Arc::new(MemoryConnectionSink::new());
    let metrics = Arc::new(AtomicMetrics::new());
    let engine = Arc::new(ForwardingEngine::new(
        config,
        Arc::clone(&policy) as _,
        Arc::clone(&connections) as _,
        Arc::clone(&metrics) as _,
        Arc::new(MemoryListenerStatus::new()),
    ));
    engine.start();
    Harness {
        engine,
        policy,
        connections,
        metrics,
    }
}

/// Two distinct free TCP ports, probed together so they cannot collide.
async fn free_tcp_ports() -> (u16, u16) {
    let a = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let b = TcpListener::bind("127.0.0.1:0").await.unwrap();
    (
        a.local_addr().unwrap().port(),
        b.local_addr().unwrap().port(),
    )
}

/// Two distinct free UDP ports, probed together so they cannot collide.
async fn free_udp_ports() -> (u16, u16) {
    let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    (
        a.local_addr().unwrap().port(),
        b.local_addr().unwrap().port(),
    )
}

fn tcp_rule(id: i64, source_port: u16, target_port: u16) -> ForwardRule {
    ForwardRule::new(
        id,
        &format!("e2e-{id}"),
        source_port,
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        target_port,
        Protocol::Tcp,
    )
    .with_source_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
    .with_reconnect(50, 30)
}

/// TCP echo server that stays up until its handle is dropped.
async fn start_echo(port: u16) -> tokio::task::JoinHandle<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    })
}

/// Upstream that records every byte it receives, in arrival order.
struct Collector {
    received: Arc<Mutex<Vec<u8>>>,
    accept_task: tokio::task::JoinHandle<()>,
    conn_tasks: Arc<std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl Collector {
    async fn start(port: u16) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let conn_tasks = Arc::new(std::sync::Mutex::new(Vec::new()));

        let sink = Arc::clone(&received);
        let tasks = Arc::clone(&conn_tasks);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let sink = Arc::clone(&sink);
                let conn_task = tokio::spawn(async move {
                    let mut buf = [0u8; 8192];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => sink.lock().await.extend_from_slice(&buf[..n]),
                        }
                    }
                });
                tasks.lock().unwrap().push(conn_task);
            }
        });

        Self {
            received,
            accept_task,
            conn_tasks,
        }
    }

    async fn bytes(&self) -> Vec<u8> {
        self.received.lock().await.clone()
    }

    /// Kill the listener and every accepted connection.
    fn stop(self) {
        self.accept_task.abort();
        for task in self.conn_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

async fn wait_until<F, Fut>(what: &str, limit: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn tcp_happy_path() {
    let hx = harness(RelayConfig::default());
    let (listen_port, target_port) = free_tcp_ports().await;
    let _echo = start_echo(target_port).await;

    let rule = tcp_rule(1, listen_port, target_port);
    assert!(hx.engine.activate(&rule).await);

    let mut client = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    client.write_all(b"hello").await.unwrap();

    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("no echo within deadline")
        .unwrap();
    assert_eq!(&buf[..n], b"hello");

    let stats = hx.engine.client_stats(1).await;
    assert_eq!(stats.bytes_tx, 5);
    assert_eq!(stats.bytes_rx, 5);
    assert_eq!(hx.metrics.snapshot().active_connections, 1);
    assert_eq!(hx.metrics.snapshot().total_connections, 1);

    drop(client);
    assert!(hx.engine.deactivate(&rule).await);
}

#[tokio::test]
async fn tcp_upstream_flap_buffers_and_replays_in_order() {
    let hx = harness(RelayConfig::default());
    let (listen_port, target_port) = free_tcp_ports().await;

    let collector = Collector::start(target_port).await;
    let rule = tcp_rule(1, listen_port, target_port);
    assert!(hx.engine.activate(&rule).await);

    // Client connects while the upstream is healthy, sends nothing yet.
    let mut client = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    {
        let engine = Arc::clone(&hx.engine);
        wait_until("upstream pool to connect", Duration::from_secs(2), || {
            let engine = Arc::clone(&engine);
            async move { engine.pool_status(1).await.unwrap().state == PoolState::Connected }
        })
        .await;
    }

    // Kill the upstream and wait for the pool to notice.
    collector.stop();
    {
        let engine = Arc::clone(&hx.engine);
        wait_until("pool to go down", Duration::from_secs(2), || {
            let engine = Arc::clone(&engine);
            async move { engine.pool_status(1).await.unwrap().active == 0 }
        })
        .await;
    }

    // 100 KiB in 100 patterned chunks while the upstream is gone.
    let mut expected = Vec::with_capacity(100 * 1024);
    for i in 0..100u32 {
        let chunk = vec![(i % 251) as u8; 1024];
        client.write_all(&chunk).await.unwrap();
        expected.extend_from_slice(&chunk);
    }
    {
        let engine = Arc::clone(&hx.engine);
        wait_until("payloads to buffer", Duration::from_secs(2), || {
            let engine = Arc::clone(&engine);
            async move { engine.client_stats(1).await.buffered_bytes == 100 * 1024 }
        })
        .await;
    }

    // Restart the upstream on the same port; reconnect interval is 50 ms.
    let collector = Collector::start(target_port).await;
    {
        let engine = Arc::clone(&hx.engine);
        wait_until("buffer to flush", Duration::from_secs(5), || {
            let engine = Arc::clone(&engine);
            async move { engine.client_stats(1).await.buffered_bytes == 0 }
        })
        .await;
    }

    let expected_len = expected.len();
    wait_until("all bytes to arrive", Duration::from_secs(2), || {
        let collector = &collector;
        async move { collector.bytes().await.len() == expected_len }
    })
    .await;
    assert_eq!(collector.bytes().await, expected, "replay reordered bytes");

    assert!(hx.engine.deactivate(&rule).await);
}

#[tokio::test]
async fn buffer_overflow_tail_drops_and_keeps_prefix() {
    let mut config = RelayConfig::default();
    config.buffer.client_buffer_cap = 1024;
    let hx = harness(config);

    let (listen_port, target_port) = free_tcp_ports().await;
    // No upstream yet: everything the client writes must buffer or drop.
    let rule = tcp_rule(1, listen_port, target_port);
    assert!(hx.engine.activate(&rule).await);

    let mut client = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();

    // Four 512-byte patterned chunks: 2x the cap. Spaced out so each
    // arrives as its own read on the relay side.
    for i in 0..4u8 {
        client.write_all(&vec![i; 512]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    {
        let engine = Arc::clone(&hx.engine);
        wait_until("buffer to fill to cap", Duration::from_secs(2), || {
            let engine = Arc::clone(&engine);
            async move { engine.client_stats(1).await.buffered_bytes == 1024 }
        })
        .await;
    }
    assert!(hx.metrics.snapshot().transfer_errors >= 1);

    // The client connection survives the overflow.
    client.write_all(&[9u8; 8]).await.unwrap();
    assert_eq!(hx.engine.client_stats(1).await.connections, 1);

    // Bring the upstream up: only the first cap's worth arrives, in order.
    let collector = Collector::start(target_port).await;
    {
        let engine = Arc::clone(&hx.engine);
        wait_until("buffer to flush", Duration::from_secs(5), || {
            let engine = Arc::clone(&engine);
            async move { engine.client_stats(1).await.buffered_bytes == 0 }
        })
        .await;
    }

    let mut expected = vec![0u8; 512];
    expected.extend_from_slice(&[1u8; 512]);
    wait_until("prefix to arrive", Duration::from_secs(2), || {
        let collector = &collector;
        async move { collector.bytes().await.len() >= 1024 }
    })
    .await;
    assert_eq!(collector.bytes().await, expected, "retained bytes are not the FIFO prefix");

    assert!(hx.engine.deactivate(&rule).await);
}

#[tokio::test]
async fn udp_session_created_and_evicted() {
    let mut config = RelayConfig::default();
    config.timing.udp_session_timeout_secs = 1;
    config.timing.udp_sweep_interval_secs = 1;
    let hx = harness(config);

    let (listen_port, target_port) = free_udp_ports().await;

    // UDP echo upstream.
    let upstream = UdpSocket::bind(("127.0.0.1", target_port)).await.unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 65535];
        while let Ok((n, peer)) = upstream.recv_from(&mut buf).await {
            let _ = upstream.send_to(&buf[..n], peer).await;
        }
    });

    let mut rule = tcp_rule(1, listen_port, target_port);
    rule.protocol = Protocol::Udp;
    assert!(hx.engine.activate(&rule).await);

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(b"A", ("127.0.0.1", listen_port))
        .await
        .unwrap();

    let mut buf = [0u8; 16];
    let (n, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("no UDP echo within deadline")
        .unwrap();
    assert_eq!(&buf[..n], b"A");

    let stats = hx.engine.session_stats().await;
    assert_eq!(stats.current, 1);
    assert_eq!(stats.total, 1);

    // Stay silent past the timeout; the sweeper runs every second.
    {
        let engine = Arc::clone(&hx.engine);
        wait_until("session eviction", Duration::from_secs(5), || {
            let engine = Arc::clone(&engine);
            async move { engine.session_stats().await.current == 0 }
        })
        .await;
    }
    assert_eq!(hx.engine.session_stats().await.expired, 1);

    // UDP records are retained, marked disconnected.
    let records = hx.connections.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ConnectionStatus::Disconnected);

    assert!(hx.engine.deactivate(&rule).await);
}

#[tokio::test]
async fn broadcast_subscribe_fanout_unsubscribe() {
    let mut config = RelayConfig::default();
    config.udp.mode = UdpMode::Broadcast;
    let hx = harness(config);

    let (listen_port, target_port) = free_udp_ports().await;
    let mut rule = tcp_rule(1, listen_port, target_port);
    rule.protocol = Protocol::Udp;
    assert!(hx.engine.activate(&rule).await);

    let downstream: SocketAddr = ([127, 0, 0, 1], listen_port).into();
    let upstream: SocketAddr = ([127, 0, 0, 1], target_port).into();

    async fn recv_text(socket: &UdpSocket) -> String {
        let mut buf = [0u8; 256];
        let (n, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for datagram")
            .unwrap();
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    let c1 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let c2 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for client in [&c1, &c2] {
        client.send_to(b"SUBSCRIBE", downstream).await.unwrap();
        assert_eq!(recv_text(client).await, "SUBSCRIBED");
    }

    let source = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    source.send_to(b"tick-1", upstream).await.unwrap();
    assert_eq!(recv_text(&c1).await, "tick-1");
    assert_eq!(recv_text(&c2).await, "tick-1");

    c1.send_to(b"UNSUBSCRIBE", downstream).await.unwrap();
    assert_eq!(recv_text(&c1).await, "UNSUBSCRIBED");

    source.send_to(b"tick-2", upstream).await.unwrap();
    assert_eq!(recv_text(&c2).await, "tick-2");
    let mut buf = [0u8; 16];
    assert!(
        timeout(Duration::from_millis(300), c1.recv_from(&mut buf))
            .await
            .is_err(),
        "unsubscribed client still receives fan-out"
    );

    let stats = hx.engine.broadcast_stats(1).await.unwrap();
    assert_eq!(stats.downstream_clients, 1);
    assert_eq!(stats.upstream_clients, 1);

    assert!(hx.engine.deactivate(&rule).await);
}

#[tokio::test]
async fn access_denied_client_is_dropped_before_forwarding() {
    let hx = harness(RelayConfig::default());
    hx.policy.add(AccessRule::global(
        1,
        Cidr::parse("127.0.0.0/8").unwrap(),
        AccessAction::Deny,
        1,
    ));

    let (listen_port, target_port) = free_tcp_ports().await;
    let _echo = start_echo(target_port).await;
    let rule = tcp_rule(1, listen_port, target_port);
    assert!(hx.engine.activate(&rule).await);

    let mut client = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("relay did not close the denied client")
        .unwrap();
    assert_eq!(n, 0, "expected immediate close");

    assert_eq!(hx.metrics.snapshot().connection_errors, 1);
    assert_eq!(hx.connections.connected_count(), 0);
    assert_eq!(hx.connections.len(), 0);
    assert_eq!(hx.engine.client_stats(1).await.connections, 0);

    assert!(hx.engine.deactivate(&rule).await);
}

#[tokio::test]
async fn active_client_count_matches_registry() {
    let hx = harness(RelayConfig::default());
    let (listen_port, target_port) = free_tcp_ports().await;
    let _echo = start_echo(target_port).await;
    let rule = tcp_rule(1, listen_port, target_port);
    assert!(hx.engine.activate(&rule).await);

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap());
    }
    {
        let engine = Arc::clone(&hx.engine);
        wait_until("clients to register", Duration::from_secs(2), || {
            let engine = Arc::clone(&engine);
            async move { engine.client_stats(1).await.connections == 3 }
        })
        .await;
    }
    assert_eq!(hx.metrics.snapshot().active_connections, 3);

    clients.pop();
    {
        let engine = Arc::clone(&hx.engine);
        wait_until("client to unregister", Duration::from_secs(2), || {
            let engine = Arc::clone(&engine);
            async move { engine.client_stats(1).await.connections == 2 }
        })
        .await;
    }

    assert!(hx.engine.deactivate(&rule).await);
    assert_eq!(hx.engine.client_stats(1).await.connections, 0);
}
