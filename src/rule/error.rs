//! Rule validation error types.

use thiserror::Error;

/// Errors raised when validating a forwarding rule.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuleError {
    /// The rule name is empty.
    #[error("rule name must not be empty")]
    EmptyName,

    /// The source port is outside 1..=65535.
    #[error("source port must be in 1..=65535, got {0}")]
    InvalidSourcePort(u16),

    /// The target port is outside 1..=65535.
    #[error("target port must be in 1..=65535, got {0}")]
    InvalidTargetPort(u16),

    /// The pool size is zero.
    #[error("connection pool size must be at least 1")]
    InvalidPoolSize,

    /// Two enabled rules bind the same listener endpoint for an
    /// overlapping protocol.
    #[error("rule '{name}' conflicts with rule '{other}' on {endpoint}")]
    EndpointConflict {
        /// Name of the rule being validated.
        name: String,
        /// Name of the already-registered rule.
        other: String,
        /// The contested `ip:port` endpoint.
        endpoint: String,
    },
}

/// Result type for rule operations.
pub type RuleResult<T> = Result<T, RuleError>;
