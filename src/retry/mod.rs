//! Retries with exponential backoff
//!
//! [`RetryExecutor::run`] re-invokes a failed operation until it succeeds,
//! the [`ErrorClassifier`] calls the error fatal, or `max_attempts` is
//! reached. The delay before attempt `n` is
//! `min(max_delay, base_delay * 2^(n-2))`, scaled by a random factor in
//! `[1 - jitter, 1 + jitter]` and clamped to `max_delay`.

pub mod classifier;
pub mod executor;
pub mod types;

pub use classifier::{AlwaysRetry, BreakerAware, ErrorClassifier, TransientCoordinationErrors};
pub use executor::RetryExecutor;
pub use types::{ErrorClass, RetryError, RetryPolicy};
