//! A single live upstream connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

/// The write side of one pooled upstream connection.
///
/// Connections are persistent and shared: multiple clients of the same rule
/// may write through one connection, serialised by the writer mutex. The
/// read half is owned by the pool's reader task. The `id` is unique per dial
/// and keys the registry's reply-affinity mapping.
pub struct UpstreamConn {
    id: u64,
    slot: usize,
    target: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    open: AtomicBool,
}

impl UpstreamConn {
    pub(crate) fn new(id: u64, slot: usize, target: SocketAddr, writer: OwnedWriteHalf) -> Self {
        Self {
            id,
            slot,
            target,
            writer: Mutex::new(writer),
            open: AtomicBool::new(true),
        }
    }

    /// Dial-unique identity of this connection.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The slot this connection occupies.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// The upstream address this connection is dialled to.
    #[must_use]
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Whether the connection is still usable.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::Relaxed);
    }

    /// Write a payload to the upstream.
    ///
    /// # Errors
    ///
    /// Returns the IO error and marks the connection closed when the write
    /// fails; the reader task then drives the slot into reconnect.
    pub async fn send(&self, payload: &[u8]) -> std::io::Result<()> {
        if !self.is_open() {
            return Err(std::io::ErrorKind::BrokenPipe.into());
        }
        let mut writer = self.writer.lock().await;
        match writer.write_all(payload).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.mark_closed();
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for UpstreamConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConn")
            .field("id", &self.id)
            .field("slot", &self.slot)
            .field("target", &self.target)
            .field("open", &self.is_open())
            .finish()
    }
}
