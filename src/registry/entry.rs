//! Per-client state: connection handle, counters, and the outage buffer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Aggregated statistics for the clients of one rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Live client connections.
    pub connections: usize,

    /// Bytes delivered back to clients (upstream -> downstream).
    pub bytes_rx: u64,

    /// Bytes forwarded to the upstream (downstream -> upstream).
    pub bytes_tx: u64,

    /// Packets delivered back to clients.
    pub packets_rx: u64,

    /// Packets forwarded to the upstream.
    pub packets_tx: u64,

    /// Payload bytes currently pending in outage buffers.
    pub buffered_bytes: usize,
}

/// One live downstream TCP client.
///
/// The write half of the client socket lives here so replies can be routed
/// from any task; the read half stays with the listener's per-client loop.
pub struct ClientEntry {
    rule_id: i64,
    connection_id: Uuid,
    writer: Mutex<OwnedWriteHalf>,
    open: AtomicBool,
    buffer: StdMutex<VecDeque<Bytes>>,
    buffered_bytes: AtomicUsize,
    buffer_cap: usize,
    dropped_tail: AtomicBool,
    bytes_rx: AtomicU64,
    bytes_tx: AtomicU64,
    packets_rx: AtomicU64,
    packets_tx: AtomicU64,
    created: Instant,
    /// Milliseconds since `created` of the last transfer in either
    /// direction. Reads and writes both count toward idleness.
    last_activity_ms: AtomicU64,
}

impl ClientEntry {
    /// Create an entry for a freshly accepted client.
    #[must_use]
    pub fn new(
        rule_id: i64,
        connection_id: Uuid,
        writer: OwnedWriteHalf,
        buffer_cap: usize,
    ) -> Self {
        Self {
            rule_id,
            connection_id,
            writer: Mutex::new(writer),
            open: AtomicBool::new(true),
            buffer: StdMutex::new(VecDeque::new()),
            buffered_bytes: AtomicUsize::new(0),
            buffer_cap,
            dropped_tail: AtomicBool::new(false),
            bytes_rx: AtomicU64::new(0),
            bytes_tx: AtomicU64::new(0),
            packets_rx: AtomicU64::new(0),
            packets_tx: AtomicU64::new(0),
            created: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    /// The forwarding rule this client belongs to.
    #[must_use]
    pub fn rule_id(&self) -> i64 {
        self.rule_id
    }

    /// The client's stable connection id.
    #[must_use]
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Whether the client connection is still usable.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    /// Mark the client closed. Idempotent.
    pub fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
    }

    /// Write a reply payload to the client.
    ///
    /// # Errors
    ///
    /// Returns the IO error and marks the entry closed when the write fails.
    pub async fn send_to_client(&self, payload: &[u8]) -> std::io::Result<()> {
        if !self.is_open() {
            return Err(std::io::ErrorKind::BrokenPipe.into());
        }
        let mut writer = self.writer.lock().await;
        match writer.write_all(payload).await {
            Ok(()) => {
                self.record_received(payload.len());
                Ok(())
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Queue a payload while the upstream is unavailable.
    ///
    /// Returns `false` without queuing when the payload would push the
    /// pending total past the cap (tail-drop). Once a payload has been
    /// dropped, later payloads are refused until the queue drains: the
    /// retained bytes must stay a prefix of the stream, never a spliced
    /// middle.
    pub fn buffer_payload(&self, payload: Bytes) -> bool {
        let size = payload.len();
        let mut buffer = self.buffer.lock().expect("buffer lock poisoned");
        if self.dropped_tail.load(Ordering::Relaxed)
            || self.buffered_bytes.load(Ordering::Relaxed) + size > self.buffer_cap
        {
            self.dropped_tail.store(true, Ordering::Relaxed);
            return false;
        }
        buffer.push_back(payload);
        self.buffered_bytes.fetch_add(size, Ordering::Relaxed);
        true
    }

    /// Take the oldest pending payload.
    pub fn pop_buffered(&self) -> Option<Bytes> {
        let mut buffer = self.buffer.lock().expect("buffer lock poisoned");
        match buffer.pop_front() {
            Some(payload) => {
                self.buffered_bytes.fetch_sub(payload.len(), Ordering::Relaxed);
                if buffer.is_empty() {
                    self.dropped_tail.store(false, Ordering::Relaxed);
                }
                Some(payload)
            }
            None => {
                self.dropped_tail.store(false, Ordering::Relaxed);
                None
            }
        }
    }

    /// Return a payload to the head of the queue after a failed flush.
    pub fn requeue_front(&self, payload: Bytes) {
        let size = payload.len();
        self.buffer
            .lock()
            .expect("buffer lock poisoned")
            .push_front(payload);
        self.buffered_bytes.fetch_add(size, Ordering::Relaxed);
    }

    /// Drop every pending payload.
    pub fn clear_buffer(&self) {
        self.buffer.lock().expect("buffer lock poisoned").clear();
        self.buffered_bytes.store(0, Ordering::Relaxed);
        self.dropped_tail.store(false, Ordering::Relaxed);
    }

    /// Payload bytes currently pending.
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes.load(Ordering::Relaxed)
    }

    /// Record a payload forwarded to the upstream.
    pub fn record_sent(&self, bytes: usize) {
        self.bytes_tx.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_tx.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Record a payload delivered back to the client.
    pub fn record_received(&self, bytes: usize) {
        self.bytes_rx.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_rx.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Refresh the activity timestamp.
    pub fn touch(&self) {
        self.last_activity_ms
            .store(self.created.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Time since the last transfer in either direction.
    #[must_use]
    pub fn idle_time(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }

    /// Fold this entry's counters into a per-rule aggregate.
    pub(crate) fn accumulate(&self, stats: &mut ClientStats) {
        stats.connections += 1;
        stats.bytes_rx += self.bytes_rx.load(Ordering::Relaxed);
        stats.bytes_tx += self.bytes_tx.load(Ordering::Relaxed);
        stats.packets_rx += self.packets_rx.load(Ordering::Relaxed);
        stats.packets_tx += self.packets_tx.load(Ordering::Relaxed);
        stats.buffered_bytes += self.buffered_bytes();
    }
}

impl std::fmt::Debug for ClientEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientEntry")
            .field("rule_id", &self.rule_id)
            .field("connection_id", &self.connection_id)
            .field("open", &self.is_open())
            .field("buffered_bytes", &self.buffered_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn entry_pair(cap: usize) -> (ClientEntry, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (_read, write) = server.into_split();
        (ClientEntry::new(1, Uuid::new_v4(), write, cap), client)
    }

    #[tokio::test]
    async fn test_buffer_tail_drop_at_cap() {
        let (entry, _client) = entry_pair(10).await;

        assert!(entry.buffer_payload(Bytes::from_static(b"12345")));
        assert!(entry.buffer_payload(Bytes::from_static(b"12345")));
        // Third chunk would exceed the cap and is dropped.
        assert!(!entry.buffer_payload(Bytes::from_static(b"x")));
        assert_eq!(entry.buffered_bytes(), 10);

        // FIFO order out.
        assert_eq!(entry.pop_buffered().unwrap(), Bytes::from_static(b"12345"));
        assert_eq!(entry.buffered_bytes(), 5);
    }

    #[tokio::test]
    async fn test_no_splice_after_drop() {
        let (entry, _client) = entry_pair(10).await;

        assert!(entry.buffer_payload(Bytes::from_static(b"123456789")));
        // Too big: dropped, and the queue latches.
        assert!(!entry.buffer_payload(Bytes::from_static(b"abc")));
        // Would fit, but splicing it after the gap would corrupt the
        // stream.
        assert!(!entry.buffer_payload(Bytes::from_static(b"x")));

        // Draining the queue re-opens it.
        assert!(entry.pop_buffered().is_some());
        assert!(entry.pop_buffered().is_none());
        assert!(entry.buffer_payload(Bytes::from_static(b"x")));
    }

    #[tokio::test]
    async fn test_requeue_front_preserves_order() {
        let (entry, _client) = entry_pair(100).await;
        entry.buffer_payload(Bytes::from_static(b"first"));
        entry.buffer_payload(Bytes::from_static(b"second"));

        let head = entry.pop_buffered().unwrap();
        entry.requeue_front(head);
        assert_eq!(entry.pop_buffered().unwrap(), Bytes::from_static(b"first"));
        assert_eq!(entry.pop_buffered().unwrap(), Bytes::from_static(b"second"));
    }

    #[tokio::test]
    async fn test_send_to_client_counts_traffic() {
        use tokio::io::AsyncReadExt;

        let (entry, mut client) = entry_pair(100).await;
        entry.send_to_client(b"hello").await.unwrap();

        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        let mut stats = ClientStats::default();
        entry.accumulate(&mut stats);
        assert_eq!(stats.bytes_rx, 5);
        assert_eq!(stats.packets_rx, 1);
    }

    #[tokio::test]
    async fn test_closed_entry_refuses_writes() {
        let (entry, _client) = entry_pair(100).await;
        entry.close();
        assert!(entry.send_to_client(b"data").await.is_err());
    }
}
