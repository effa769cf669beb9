use crate::store::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Result type for gatekeeper operations
pub type Result<T> = std::result::Result<T, CoordinationError>;

/// Errors surfaced by the rate limiter, the distributed lock and configuration loading.
///
/// The retry executor and circuit breaker wrap the caller's own error type
/// instead, see [`crate::retry::RetryError`] and [`crate::circuit_breaker::BreakerError`].
#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    #[error("Rate limit exceeded for '{subject}', retry after {retry_after:?}")]
    LimitExceeded {
        subject: String,
        retry_after: Duration,
    },

    #[error("Lock '{key}' is held by another owner")]
    LockHeld { key: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoordinationError {
    /// Whether this error came from the coordination store rather than a policy decision
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, CoordinationError::StoreUnavailable(_))
    }

    /// Suggested wait before trying again, when the error carries one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CoordinationError::LimitExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<StoreError> for CoordinationError {
    fn from(err: StoreError) -> Self {
        CoordinationError::StoreUnavailable(err)
    }
}
