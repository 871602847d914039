//! Broadcast relay error types.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors that can occur in the broadcast relay.
#[derive(Debug, Error)]
pub enum BroadcastError {
    /// Failed to bind one of the two relay sockets.
    #[error("failed to bind broadcast socket on {address}: {source}")]
    BindError {
        /// The address that failed to bind.
        address: SocketAddr,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Result type for broadcast relay operations.
pub type BroadcastResult<T> = Result<T, BroadcastError>;
