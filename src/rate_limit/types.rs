use crate::error::{CoordinationError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rate limiting algorithm
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    /// One counter per `floor(now / window)`. Admits up to twice the limit
    /// across a window boundary.
    FixedWindow,
    /// Exact log of admitted calls within the trailing window. Storage grows
    /// with the limit.
    SlidingWindowLog,
    /// Continuous refill up to a burst capacity; bounded storage per subject.
    TokenBucket,
}

impl RateLimitAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitAlgorithm::FixedWindow => "fixed_window",
            RateLimitAlgorithm::SlidingWindowLog => "sliding_window_log",
            RateLimitAlgorithm::TokenBucket => "token_bucket",
        }
    }
}

/// What to do when the coordination store cannot be reached
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Return `CoordinationError::StoreUnavailable` to the caller
    #[default]
    Propagate,
    /// Admit the call
    FailOpen,
    /// Reject the call, retry after one window
    FailClosed,
    /// Answer from a per-process limiter with the same quota
    LocalFallback,
}

/// Rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: RateLimitAlgorithm,
    /// Maximum number of calls per window
    pub limit: u32,
    /// Time window for the limit (in seconds)
    pub window_secs: u64,
    /// Token refill rate, TokenBucket only (defaults to `limit / window_secs`)
    #[serde(default)]
    pub refill_rate_per_second: Option<f64>,
    /// Bucket capacity, TokenBucket only (defaults to `limit`)
    #[serde(default)]
    pub burst_capacity: Option<u32>,
    /// Prefix of every store key written by this limiter
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default)]
    pub on_store_error: StoreFailurePolicy,
}

fn default_algorithm() -> RateLimitAlgorithm {
    RateLimitAlgorithm::SlidingWindowLog
}

fn default_key_prefix() -> String {
    "gatekeeper:ratelimit".to_string()
}

impl RateLimitConfig {
    pub fn fixed_window(limit: u32, window_secs: u64) -> Self {
        Self::new(RateLimitAlgorithm::FixedWindow, limit, window_secs)
    }

    pub fn sliding_window_log(limit: u32, window_secs: u64) -> Self {
        Self::new(RateLimitAlgorithm::SlidingWindowLog, limit, window_secs)
    }

    /// Token bucket holding up to `burst_capacity` tokens, refilled at `refill_rate_per_second`
    pub fn token_bucket(burst_capacity: u32, refill_rate_per_second: f64) -> Self {
        Self {
            refill_rate_per_second: Some(refill_rate_per_second),
            burst_capacity: Some(burst_capacity),
            ..Self::new(RateLimitAlgorithm::TokenBucket, burst_capacity, 1)
        }
    }

    fn new(algorithm: RateLimitAlgorithm, limit: u32, window_secs: u64) -> Self {
        Self {
            algorithm,
            limit,
            window_secs,
            refill_rate_per_second: None,
            burst_capacity: None,
            key_prefix: default_key_prefix(),
            on_store_error: StoreFailurePolicy::default(),
        }
    }

    pub fn with_store_failure_policy(mut self, policy: StoreFailurePolicy) -> Self {
        self.on_store_error = policy;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Get the window as a Duration
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Tokens added per second
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate_per_second
            .unwrap_or(self.limit as f64 / self.window_secs.max(1) as f64)
    }

    /// Get burst size (defaults to limit if not specified)
    pub fn burst(&self) -> u32 {
        self.burst_capacity.unwrap_or(self.limit)
    }

    /// Calls admitted per window (or bucket capacity for TokenBucket)
    pub fn effective_limit(&self) -> u32 {
        match self.algorithm {
            RateLimitAlgorithm::TokenBucket => self.burst(),
            _ => self.limit,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(CoordinationError::Config(
                "Rate limit must be >= 1".to_string(),
            ));
        }
        if self.window_secs == 0 {
            return Err(CoordinationError::Config(
                "Rate limit window must be > 0".to_string(),
            ));
        }
        if self.key_prefix.is_empty() {
            return Err(CoordinationError::Config(
                "Rate limit key prefix cannot be empty".to_string(),
            ));
        }
        if self.algorithm == RateLimitAlgorithm::TokenBucket {
            let rate = self.refill_rate();
            if !rate.is_finite() || rate <= 0.0 {
                return Err(CoordinationError::Config(format!(
                    "Token bucket refill rate must be a positive number, got {}",
                    rate
                )));
            }
            if self.burst() == 0 {
                return Err(CoordinationError::Config(
                    "Token bucket burst capacity must be >= 1".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Outcome of one rate limit check
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    /// Whether the call is allowed
    pub allowed: bool,
    /// How long to wait before the next call can be admitted (zero when allowed)
    pub retry_after: Duration,
    /// Calls (or whole tokens) left; 0 when unknown
    pub remaining: u64,
    /// Configured limit (bucket capacity for TokenBucket)
    pub limit: u32,
}

impl RateLimitDecision {
    /// Create an allowed decision
    pub fn allowed(remaining: u64, limit: u32) -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
            remaining,
            limit,
        }
    }

    /// Create a denied decision
    pub fn denied(limit: u32, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after,
            remaining: 0,
            limit,
        }
    }
}
