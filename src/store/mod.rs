//! Coordination store abstraction
//!
//! The rate limiter and the distributed lock keep all shared state in an
//! external key-value store and only ever touch it through the atomic
//! primitives declared by [`CoordinationStore`]. Two backends ship with the
//! crate:
//!
//! - [`RedisStore`]: Redis via a connection manager, with Lua scripts for the
//!   read-modify-write primitives
//! - [`InMemoryStore`]: a process-local map with the same semantics, for
//!   single-process deployments and tests

pub mod lua_scripts;
pub mod memory;
pub mod redis;

pub use self::memory::InMemoryStore;
pub use self::redis::RedisStore;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Failures talking to the coordination store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Key '{key}' holds a value of the wrong type")]
    WrongType { key: String },

    #[error("Corrupted value at '{key}': {reason}")]
    Corrupted { key: String, reason: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Arguments of the scripted token bucket step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketRequest {
    /// Bucket capacity (burst size)
    pub capacity: f64,
    /// Tokens added per second
    pub refill_per_sec: f64,
    /// Caller's notion of "now", Unix milliseconds
    pub now_ms: u64,
    /// How long an untouched bucket is kept before the store may drop it
    pub idle_ttl: Duration,
}

/// Result of the scripted token bucket step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketOutcome {
    pub allowed: bool,
    /// Tokens left in the bucket after this call
    pub tokens: f64,
    /// Time until one whole token is available (zero when allowed)
    pub retry_after: Duration,
}

/// Arguments of the scripted sliding window log step
#[derive(Debug, Clone, PartialEq)]
pub struct SlidingWindowRequest {
    pub limit: u64,
    pub window: Duration,
    pub now_ms: u64,
    /// Unique member recorded for this call
    pub member: String,
}

/// Result of the scripted sliding window log step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlidingWindowOutcome {
    pub allowed: bool,
    /// Entries in the window after this call
    pub count: u64,
    pub retry_after: Duration,
}

/// Atomic primitives the coordination primitives rely on.
///
/// Every method must be executed by the backend as a single atomic step:
/// concurrent callers sharing a key never observe or produce a partial update.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set `key` to `value`. With `only_if_absent`, returns `false` and leaves
    /// the store untouched when a live value already exists.
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        only_if_absent: bool,
    ) -> StoreResult<bool>;

    /// Delete `key` only if it currently holds `expected`
    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Replace the TTL of `key` only if it currently holds `expected`
    async fn compare_and_set_ttl(&self, key: &str, expected: &str, ttl: Duration)
        -> StoreResult<bool>;

    /// Add `amount` to the counter at `key`, creating it with `ttl_if_new` when absent
    async fn incr_with_expiry(&self, key: &str, amount: i64, ttl_if_new: Duration)
        -> StoreResult<i64>;

    async fn token_bucket(
        &self,
        key: &str,
        request: &TokenBucketRequest,
    ) -> StoreResult<TokenBucketOutcome>;

    async fn sliding_window_log(
        &self,
        key: &str,
        request: &SlidingWindowRequest,
    ) -> StoreResult<SlidingWindowOutcome>;

    /// Check the store is reachable
    async fn ping(&self) -> StoreResult<()>;
}

/// Coordination store connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL; the in-memory store is used when absent
    #[serde(default)]
    pub url: Option<String>,
    /// Upper bound for a single store round-trip in milliseconds
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    /// How often the in-memory store drops expired entries, in milliseconds
    #[serde(default = "default_purge_interval_ms")]
    pub purge_interval_ms: u64,
}

fn default_operation_timeout_ms() -> u64 {
    500
}

fn default_purge_interval_ms() -> u64 {
    60_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            operation_timeout_ms: default_operation_timeout_ms(),
            purge_interval_ms: default_purge_interval_ms(),
        }
    }
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }
}

/// Build the store described by `config`
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn CoordinationStore>> {
    match &config.url {
        Some(url) => {
            let store = RedisStore::connect(url, config.operation_timeout()).await?;
            info!(timeout = ?config.operation_timeout(), "Using Redis coordination store");
            Ok(Arc::new(store))
        }
        None => {
            info!("Using in-memory coordination store");
            let store = Arc::new(InMemoryStore::new());
            // Stops on its own once the last handle to the store is dropped
            store.spawn_purge_task(config.purge_interval());
            Ok(store)
        }
    }
}

/// One token bucket step: refill for the elapsed time, then try to take a token.
///
/// Returns the outcome and the refill timestamp to persist. Mirrors
/// [`lua_scripts::TOKEN_BUCKET_SCRIPT`].
pub(crate) fn token_bucket_step(
    tokens: f64,
    last_refill_ms: u64,
    request: &TokenBucketRequest,
) -> (TokenBucketOutcome, u64) {
    let elapsed_ms = request.now_ms.saturating_sub(last_refill_ms) as f64;
    let refill_per_ms = request.refill_per_sec / 1000.0;
    let mut tokens = (tokens + elapsed_ms * refill_per_ms).min(request.capacity);
    let refilled_at = request.now_ms.max(last_refill_ms);

    if tokens >= 1.0 {
        tokens -= 1.0;
        let outcome = TokenBucketOutcome {
            allowed: true,
            tokens,
            retry_after: Duration::ZERO,
        };
        return (outcome, refilled_at);
    }

    let wait_ms = ((1.0 - tokens) / refill_per_ms).ceil();
    let outcome = TokenBucketOutcome {
        allowed: false,
        tokens,
        retry_after: Duration::try_from_secs_f64(wait_ms / 1000.0).unwrap_or(Duration::MAX),
    };
    (outcome, refilled_at)
}
