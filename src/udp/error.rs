//! UDP relay error types.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors that can occur in the UDP relay path.
#[derive(Debug, Error)]
pub enum UdpRelayError {
    /// Failed to bind a datagram socket.
    #[error("failed to bind UDP socket on {address}: {source}")]
    BindError {
        /// The address that failed to bind.
        address: SocketAddr,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Result type for UDP relay operations.
pub type UdpRelayResult<T> = Result<T, UdpRelayError>;
