//! Circuit breaking for calls to a failing resource
//!
//! A breaker starts `Closed`. After `failure_threshold` consecutive failures
//! it opens and rejects every call until `reset_timeout` has passed since the
//! failure that opened it. The next call moves it to `HalfOpen`, where up to
//! `half_open_trial_count` probes run; that many successes close it, any
//! failure opens it again.

pub mod breaker;
pub mod registry;
pub mod types;

pub use breaker::CircuitBreaker;
pub use registry::CircuitBreakerRegistry;
pub use types::{
    BreakerError, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitSnapshot, CircuitState,
};
