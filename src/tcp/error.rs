//! TCP relay error types.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors that can occur in the TCP relay path.
#[derive(Debug, Error)]
pub enum TcpRelayError {
    /// Failed to bind the listener.
    #[error("failed to bind to {address}: {source}")]
    BindError {
        /// The address that failed to bind.
        address: SocketAddr,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to accept a connection.
    #[error("failed to accept connection: {0}")]
    AcceptError(#[source] std::io::Error),
}

/// Result type for TCP relay operations.
pub type TcpRelayResult<T> = Result<T, TcpRelayError>;
