//! Coordination primitives for services sharing a backing store
//!
//! - [`rate_limit`]: fixed window, sliding window log and token bucket
//!   limiters whose state lives in a [`store::CoordinationStore`]
//! - [`retry`]: bounded retries with exponential backoff and jitter
//! - [`circuit_breaker`]: per-resource Closed/Open/HalfOpen breakers
//! - [`lock`]: TTL-bounded mutual exclusion with fencing tokens
//!
//! Every blocking operation takes a [`CancellationToken`] and reports its
//! decisions through an [`observability::EventSink`].

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod lock;
pub mod observability;
pub mod rate_limit;
pub mod retry;
pub mod store;
pub mod time;

pub use circuit_breaker::{BreakerError, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use config::GatekeeperConfig;
pub use error::{CoordinationError, Result};
pub use lock::{DistributedLock, FencingToken, LockHandle};
pub use rate_limit::{RateLimitConfig, RateLimitDecision, RateLimiter};
pub use retry::{RetryError, RetryExecutor, RetryPolicy};
pub use store::{CoordinationStore, InMemoryStore, RedisStore};
pub use tokio_util::sync::CancellationToken;
