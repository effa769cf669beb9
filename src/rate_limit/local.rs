use super::types::{RateLimitAlgorithm, RateLimitConfig, RateLimitDecision};
use governor::{
    clock::{Clock, DefaultClock},
    DefaultKeyedRateLimiter, Quota, RateLimiter as GovernorRateLimiter,
};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Per-process limiter used while the coordination store is unreachable
///
/// Enforces the same quota as the distributed limiter, but only across the
/// callers of this process, so the cluster-wide rate is approximate.
/// Subjects back at a full quota are forgotten every [`SHRINK_EVERY`] checks.
pub struct LocalFallback {
    limiter: DefaultKeyedRateLimiter<String>,
    clock: DefaultClock,
    limit: u32,
    checks: AtomicU64,
}

/// Number of checks between two [`LocalFallback::shrink`] passes
pub const SHRINK_EVERY: u64 = 1024;

impl LocalFallback {
    /// Build a fallback for `config`, or `None` if the quota cannot be expressed
    pub fn new(config: &RateLimitConfig) -> Option<Self> {
        let quota = match config.algorithm {
            RateLimitAlgorithm::TokenBucket => {
                let period = Duration::try_from_secs_f64(1.0 / config.refill_rate()).ok()?;
                Quota::with_period(period)?.allow_burst(NonZeroU32::new(config.burst())?)
            }
            RateLimitAlgorithm::FixedWindow | RateLimitAlgorithm::SlidingWindowLog => {
                Quota::with_period(config.window() / config.limit.max(1))?
                    .allow_burst(NonZeroU32::new(config.limit)?)
            }
        };

        debug!(algorithm = config.algorithm.as_str(), ?quota, "Creating local fallback limiter");

        Some(Self {
            limiter: GovernorRateLimiter::keyed(quota),
            clock: DefaultClock::default(),
            limit: config.effective_limit(),
            checks: AtomicU64::new(0),
        })
    }

    /// Check if a call for `subject` is allowed
    pub fn check(&self, subject: &str) -> RateLimitDecision {
        if (self.checks.fetch_add(1, Ordering::Relaxed) + 1) % SHRINK_EVERY == 0 {
            self.shrink();
        }

        match self.limiter.check_key(&subject.to_string()) {
            // governor does not expose the remaining quota
            Ok(()) => RateLimitDecision::allowed(0, self.limit),
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                warn!(subject, retry_after = ?wait, "Local fallback rate limit exceeded");
                RateLimitDecision::denied(self.limit, wait)
            }
        }
    }

    /// Drop state for subjects that are back to a full quota
    pub fn shrink(&self) {
        let before = self.limiter.len();
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        debug!(before, after = self.limiter.len(), "Shrank local fallback state");
    }

    /// Get the number of tracked subjects (for testing/monitoring)
    pub fn tracked_subjects(&self) -> usize {
        self.limiter.len()
    }
}
