use super::local::LocalFallback;
use super::types::{RateLimitAlgorithm, RateLimitConfig, RateLimitDecision, StoreFailurePolicy};
use crate::error::{CoordinationError, Result};
use crate::observability::events::{default_sink, Component, EventEmitter, EventSink, Outcome};
use crate::store::{CoordinationStore, SlidingWindowRequest, StoreError, TokenBucketRequest};
use crate::time::{system_clock, TimeProvider};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Distributed rate limiter for one quota
///
/// All shared state lives in the coordination store; every check is exactly
/// one atomic store round-trip and never sleeps. Subjects (e.g. `user:123`)
/// are limited independently.
pub struct RateLimiter<S: CoordinationStore + ?Sized = dyn CoordinationStore> {
    store: Arc<S>,
    config: RateLimitConfig,
    clock: Arc<dyn TimeProvider>,
    events: EventEmitter,
    fallback: Option<LocalFallback>,
}

impl<S: CoordinationStore + ?Sized> RateLimiter<S> {
    /// Create a new rate limiter, validating `config`
    pub fn new(store: Arc<S>, config: RateLimitConfig) -> Result<Self> {
        config.validate()?;

        let fallback = match config.on_store_error {
            StoreFailurePolicy::LocalFallback => {
                let fallback = LocalFallback::new(&config);
                if fallback.is_none() {
                    warn!(
                        algorithm = config.algorithm.as_str(),
                        "Quota cannot be enforced locally, store failures will reject calls"
                    );
                }
                fallback
            }
            _ => None,
        };

        let clock = system_clock();
        Ok(Self {
            store,
            events: EventEmitter::new(Component::RateLimiter, default_sink(), clock.clone()),
            clock,
            config,
            fallback,
        })
    }

    /// Read time from `clock` instead of the system clock
    pub fn with_clock(mut self, clock: Arc<dyn TimeProvider>) -> Self {
        self.events = self.events.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    /// Report decisions to `sink`
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = self.events.with_sink(sink);
        self
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Decide whether a call for `subject` is admitted
    ///
    /// A rejection is not an error: it comes back as a decision with
    /// `allowed == false` and the time to wait. Store failures are handled
    /// according to the configured [`StoreFailurePolicy`].
    pub async fn allow(
        &self,
        subject: &str,
        cancel: &CancellationToken,
    ) -> Result<RateLimitDecision> {
        if subject.is_empty() {
            return Err(CoordinationError::InvalidArgument(
                "Rate limit subject cannot be empty".to_string(),
            ));
        }

        let now_ms = self.clock.now_ms();
        let checked = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.events.emit(subject, Outcome::Cancelled, None);
                return Err(CoordinationError::Cancelled);
            }
            checked = self.check(subject, now_ms) => checked,
        };

        match checked {
            Ok(decision) => {
                self.record_decision(subject, &decision);
                Ok(decision)
            }
            Err(e) => self.on_store_error(subject, e),
        }
    }

    /// Like [`allow`](Self::allow), but a rejection becomes
    /// [`CoordinationError::LimitExceeded`]
    pub async fn admit(
        &self,
        subject: &str,
        cancel: &CancellationToken,
    ) -> Result<RateLimitDecision> {
        let decision = self.allow(subject, cancel).await?;
        if decision.allowed {
            Ok(decision)
        } else {
            Err(CoordinationError::LimitExceeded {
                subject: subject.to_string(),
                retry_after: decision.retry_after,
            })
        }
    }

    fn subject_key(&self, subject: &str) -> String {
        format!(
            "{}:{}:{}",
            self.config.key_prefix,
            self.config.algorithm.as_str(),
            subject
        )
    }

    async fn check(
        &self,
        subject: &str,
        now_ms: u64,
    ) -> std::result::Result<RateLimitDecision, StoreError> {
        let key = self.subject_key(subject);

        match self.config.algorithm {
            RateLimitAlgorithm::FixedWindow => self.check_fixed_window(&key, now_ms).await,
            RateLimitAlgorithm::SlidingWindowLog => self.check_sliding_window(&key, now_ms).await,
            RateLimitAlgorithm::TokenBucket => self.check_token_bucket(&key, now_ms).await,
        }
    }

    /// Check rate limit using fixed window algorithm
    async fn check_fixed_window(
        &self,
        key: &str,
        now_ms: u64,
    ) -> std::result::Result<RateLimitDecision, StoreError> {
        let window_ms = self.config.window_secs.saturating_mul(1000);
        let window_index = now_ms / window_ms;
        let window_key = format!("{}:{}", key, window_index);

        let count = self
            .store
            .incr_with_expiry(&window_key, 1, self.config.window())
            .await?;

        let limit = self.config.limit;
        debug!(key = %window_key, count, limit, "Fixed window check");

        if count <= limit as i64 {
            Ok(RateLimitDecision::allowed(
                (limit as i64 - count).max(0) as u64,
                limit,
            ))
        } else {
            let window_end_ms = (window_index + 1).saturating_mul(window_ms);
            Ok(RateLimitDecision::denied(
                limit,
                Duration::from_millis(window_end_ms.saturating_sub(now_ms)),
            ))
        }
    }

    /// Check rate limit using sliding window log algorithm
    async fn check_sliding_window(
        &self,
        key: &str,
        now_ms: u64,
    ) -> std::result::Result<RateLimitDecision, StoreError> {
        let limit = self.config.limit;
        let request = SlidingWindowRequest {
            limit: limit as u64,
            window: self.config.window(),
            now_ms,
            member: format!("{}-{}", now_ms, Uuid::new_v4().simple()),
        };

        let outcome = self.store.sliding_window_log(key, &request).await?;
        debug!(key, count = outcome.count, limit, allowed = outcome.allowed, "Sliding window check");

        if outcome.allowed {
            Ok(RateLimitDecision::allowed(
                (limit as u64).saturating_sub(outcome.count),
                limit,
            ))
        } else {
            Ok(RateLimitDecision::denied(limit, outcome.retry_after))
        }
    }

    /// Check rate limit using token bucket algorithm
    async fn check_token_bucket(
        &self,
        key: &str,
        now_ms: u64,
    ) -> std::result::Result<RateLimitDecision, StoreError> {
        let capacity = self.config.burst();
        let refill_per_sec = self.config.refill_rate();
        // Once idle long enough to refill completely the bucket is equivalent to a new one
        let idle_ttl = Duration::try_from_secs_f64(capacity as f64 / refill_per_sec + 1.0)
            .unwrap_or(Duration::from_secs(86_400));

        let request = TokenBucketRequest {
            capacity: capacity as f64,
            refill_per_sec,
            now_ms,
            idle_ttl,
        };

        let outcome = self.store.token_bucket(key, &request).await?;
        debug!(key, tokens = outcome.tokens, allowed = outcome.allowed, "Token bucket check");

        if outcome.allowed {
            Ok(RateLimitDecision::allowed(
                outcome.tokens.floor().max(0.0) as u64,
                capacity,
            ))
        } else {
            Ok(RateLimitDecision::denied(capacity, outcome.retry_after))
        }
    }

    fn record_decision(&self, subject: &str, decision: &RateLimitDecision) {
        if decision.allowed {
            self.events.emit(subject, Outcome::Admitted, None);
        } else {
            self.events.emit(
                subject,
                Outcome::Rejected,
                Some(format!("retry_after_ms={}", decision.retry_after.as_millis())),
            );
        }
    }

    fn on_store_error(&self, subject: &str, err: StoreError) -> Result<RateLimitDecision> {
        error!(subject, error = %err, policy = ?self.config.on_store_error, "Rate limit store check failed");
        counter!(
            "gatekeeper_rate_limit_store_errors_total",
            "algorithm" => self.config.algorithm.as_str()
        )
        .increment(1);
        self.events
            .emit(subject, Outcome::StoreUnavailable, Some(err.to_string()));

        let limit = self.config.effective_limit();
        let decision = match self.config.on_store_error {
            StoreFailurePolicy::Propagate => return Err(CoordinationError::StoreUnavailable(err)),
            StoreFailurePolicy::FailOpen => RateLimitDecision::allowed(0, limit),
            StoreFailurePolicy::FailClosed => RateLimitDecision::denied(limit, self.config.window()),
            StoreFailurePolicy::LocalFallback => match &self.fallback {
                Some(fallback) => fallback.check(subject),
                None => RateLimitDecision::denied(limit, self.config.window()),
            },
        };

        self.record_decision(subject, &decision);
        Ok(decision)
    }
}
