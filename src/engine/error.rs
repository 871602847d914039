//! Engine error types.

use thiserror::Error;

use crate::broadcast::BroadcastError;
use crate::rule::RuleError;
use crate::tcp::TcpRelayError;
use crate::udp::UdpRelayError;

/// Errors that can occur while activating or deactivating a rule.
///
/// These never cross the engine boundary: `activate`/`deactivate` log the
/// cause and surface a plain boolean to the administrator.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine is not running.
    #[error("forwarding engine is not running")]
    NotRunning,

    /// The rule failed validation.
    #[error("invalid rule: {0}")]
    InvalidRule(#[from] RuleError),

    /// The rule is disabled and cannot be activated.
    #[error("rule '{0}' is disabled")]
    RuleDisabled(String),

    /// Another active rule already holds the listener endpoint.
    #[error("listener endpoint {key} is already held by rule {holder}")]
    EndpointBusy {
        /// The contested server key.
        key: String,
        /// The rule currently holding it.
        holder: i64,
    },

    /// The TCP half failed to start.
    #[error(transparent)]
    TcpStart(#[from] TcpRelayError),

    /// The UDP half failed to start.
    #[error(transparent)]
    UdpStart(#[from] UdpRelayError),

    /// The broadcast half failed to start.
    #[error(transparent)]
    BroadcastStart(#[from] BroadcastError),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
