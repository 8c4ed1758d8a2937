//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic input failures (malformed idempotency keys).
/// Store and runtime concerns belong to `retention-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An idempotency key could not be turned into a usable token.
    #[error("invalid idempotency key: {0}")]
    InvalidIdempotencyKey(String),
}

impl DomainError {
    pub fn invalid_idempotency_key(msg: impl Into<String>) -> Self {
        Self::InvalidIdempotencyKey(msg.into())
    }
}
