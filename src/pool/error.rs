//! Upstream pool error types.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors that can occur while managing upstream connections.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The dial did not complete within the connect timeout.
    #[error("connect timeout to {address}")]
    DialTimeout {
        /// The upstream address.
        address: SocketAddr,
    },

    /// The dial failed outright.
    #[error("failed to connect to {address}: {source}")]
    DialFailed {
        /// The upstream address.
        address: SocketAddr,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The pool has been shut down.
    #[error("pool is shut down")]
    Shutdown,
}

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;
