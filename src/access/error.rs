//! Access control error types.

use thiserror::Error;

/// Errors that can occur in access control.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccessError {
    /// The CIDR string is malformed.
    #[error("invalid CIDR '{0}'")]
    InvalidCidr(String),

    /// The prefix length is outside 0..=32.
    #[error("prefix length must be 0-32, got {0}")]
    InvalidPrefixLength(u8),

    /// The policy store could not produce the effective rule set.
    #[error("access rule lookup failed: {0}")]
    LookupFailed(String),
}

/// Result type for access control operations.
pub type AccessResult<T> = Result<T, AccessError>;
