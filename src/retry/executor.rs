use super::classifier::{AlwaysRetry, ErrorClassifier};
use super::types::{ErrorClass, RetryError, RetryPolicy};
use crate::error::Result;
use crate::observability::events::{default_sink, Component, EventEmitter, EventSink, Outcome};
use crate::time::{system_clock, TimeProvider};
use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_LABEL: &str = "retry";

/// Retry executor with exponential backoff and jitter
pub struct RetryExecutor<C = AlwaysRetry> {
    policy: RetryPolicy,
    classifier: C,
    label: String,
    events: EventEmitter,
}

impl RetryExecutor<AlwaysRetry> {
    /// Create a retry executor that retries every error
    pub fn new(policy: RetryPolicy) -> Result<Self> {
        policy.validate()?;

        Ok(Self {
            policy,
            classifier: AlwaysRetry,
            label: DEFAULT_LABEL.to_string(),
            events: EventEmitter::new(Component::RetryExecutor, default_sink(), system_clock()),
        })
    }
}

impl<C> RetryExecutor<C> {
    /// Replace the error classifier
    pub fn with_classifier<D>(self, classifier: D) -> RetryExecutor<D> {
        RetryExecutor {
            policy: self.policy,
            classifier,
            label: self.label,
            events: self.events,
        }
    }

    /// Name reported in logs and events (e.g. the operation being retried)
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = self.events.with_sink(sink);
        self
    }

    /// Timestamp events with `clock`
    pub fn with_clock(mut self, clock: Arc<dyn TimeProvider>) -> Self {
        self.events = self.events.with_clock(clock);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails fatally or runs out of attempts
    ///
    /// Cancelling `cancel` aborts the current attempt or backoff sleep and
    /// returns [`RetryError::Cancelled`].
    pub async fn run<F, Fut, T, E>(
        &self,
        mut op: F,
        cancel: &CancellationToken,
    ) -> std::result::Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
        C: ErrorClassifier<E>,
    {
        let mut backoff = self.create_backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(
                label = %self.label,
                attempt,
                max_attempts = self.policy.max_attempts,
                "Executing attempt"
            );

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancelled(attempt)),
                result = op() => result,
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(label = %self.label, attempt, "Operation succeeded after retries");
                    }
                    self.events.emit(&self.label, Outcome::Succeeded, None);
                    return Ok(value);
                }
                Err(e) => e,
            };

            if self.classifier.classify(&error) == ErrorClass::Fatal {
                debug!(label = %self.label, attempt, error = %error, "Error not retryable");
                self.events.emit(
                    &self.label,
                    Outcome::Failed,
                    Some(format!("attempt={}", attempt)),
                );
                return Err(RetryError::Fatal {
                    attempt,
                    source: error,
                });
            }

            if attempt >= self.policy.max_attempts {
                warn!(
                    label = %self.label,
                    attempt,
                    max_attempts = self.policy.max_attempts,
                    error = %error,
                    "Operation failed after max attempts"
                );
                self.events.emit(
                    &self.label,
                    Outcome::Exhausted,
                    Some(format!("attempts={}", attempt)),
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    source: error,
                });
            }

            let wait = self.next_delay(&mut backoff, attempt + 1);
            debug!(
                label = %self.label,
                attempt,
                wait_ms = wait.as_millis(),
                error = %error,
                "Operation failed, retrying after backoff"
            );
            self.events.emit(
                &self.label,
                Outcome::Retrying,
                Some(format!("attempt={} wait_ms={}", attempt, wait.as_millis())),
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancelled(attempt)),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn cancelled<E>(&self, attempts: u32) -> RetryError<E> {
        debug!(label = %self.label, attempts, "Retry cancelled");
        self.events.emit(&self.label, Outcome::Cancelled, None);
        RetryError::Cancelled { attempts }
    }

    /// Jittered delay before `attempt`, clamped to the policy's max delay
    fn next_delay(&self, backoff: &mut ExponentialBackoff, attempt: u32) -> Duration {
        backoff
            .next_backoff()
            .unwrap_or_else(|| self.policy.nominal_delay(attempt))
            .min(self.policy.max_delay())
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.policy.base_delay())
            .with_max_interval(self.policy.max_delay())
            .with_multiplier(2.0)
            .with_randomization_factor(self.policy.jitter_fraction)
            .with_max_elapsed_time(None) // Attempts are bounded by max_attempts
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::MemoryEventSink;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
            jitter_fraction: 0.0,
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_immediately() {
        let executor = RetryExecutor::new(policy(3, 10, 100)).unwrap();

        let result = executor
            .run(|| async { Ok::<_, String>("success") }, &CancellationToken::new())
            .await;

        assert_eq!(result.unwrap(), "success");
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let executor = RetryExecutor::new(policy(3, 10, 100)).unwrap();
        let attempts = Arc::new(AtomicU32::new(0));

        let result = executor
            .run(
                || {
                    let attempts = attempts.clone();
                    async move {
                        let current = attempts.fetch_add(1, Ordering::SeqCst);
                        if current < 2 {
                            Err("failed".to_string())
                        } else {
                            Ok("success")
                        }
                    }
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_after_max_attempts() {
        let executor = RetryExecutor::new(policy(3, 10, 100)).unwrap();
        let attempts = Arc::new(AtomicU32::new(0));

        let result = executor
            .run(
                || {
                    let attempts = attempts.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>("always fails".to_string())
                    }
                },
                &CancellationToken::new(),
            )
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert_eq!(source, "always fails");
            }
            other => panic!("expected Exhausted, got {:?}", other),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let executor = RetryExecutor::new(policy(5, 10, 100))
            .unwrap()
            .with_classifier(|e: &&str| {
                if *e == "permanent" {
                    ErrorClass::Fatal
                } else {
                    ErrorClass::Retryable
                }
            });
        let attempts = Arc::new(AtomicU32::new(0));

        let result = executor
            .run(
                || {
                    let attempts = attempts.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>("permanent")
                    }
                },
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(RetryError::Fatal { attempt: 1, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_attempt_policy_never_sleeps() {
        let executor = RetryExecutor::new(policy(1, 10_000, 10_000)).unwrap();
        let start = std::time::Instant::now();

        let result = executor
            .run(|| async { Err::<(), _>("fail") }, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 1, .. })));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_exponential_backoff_timing() {
        let executor = RetryExecutor::new(policy(4, 50, 500)).unwrap();
        let start = std::time::Instant::now();

        let _ = executor
            .run(|| async { Err::<(), _>("fail") }, &CancellationToken::new())
            .await;

        let elapsed = start.elapsed();

        // Should have waited roughly: 50ms + 100ms + 200ms = 350ms
        assert!(elapsed >= Duration::from_millis(350));
        assert!(elapsed < Duration::from_millis(700));
    }

    #[tokio::test]
    async fn test_delays_are_clamped_to_max_delay() {
        let executor = RetryExecutor::new(RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 400,
            jitter_fraction: 1.0,
        })
        .unwrap();
        let mut backoff = executor.create_backoff();

        for attempt in 2..10 {
            let delay = executor.next_delay(&mut backoff, attempt);
            assert!(delay <= Duration::from_millis(400), "attempt {}: {:?}", attempt, delay);
        }
    }

    #[tokio::test]
    async fn test_jittered_delay_stays_within_bounds() {
        let executor = RetryExecutor::new(RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            jitter_fraction: 0.5,
        })
        .unwrap();

        for _ in 0..20 {
            let mut backoff = executor.create_backoff();
            for attempt in 2..=4 {
                let nominal = executor.policy().nominal_delay(attempt).as_millis() as f64;
                let delay = executor.next_delay(&mut backoff, attempt).as_millis() as f64;
                assert!(delay >= nominal * 0.5 - 1.0, "{} < {}", delay, nominal * 0.5);
                assert!(delay <= nominal * 1.5 + 1.0, "{} > {}", delay, nominal * 1.5);
            }
        }
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff_sleep() {
        let executor = RetryExecutor::new(policy(3, 60_000, 60_000)).unwrap();
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let start = std::time::Instant::now();
        let result = executor
            .run(
                || {
                    let attempts = attempts.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>("fail")
                    }
                },
                &cancel,
            )
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1 })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_events_report_each_retry() {
        let sink = Arc::new(MemoryEventSink::new());
        let executor = RetryExecutor::new(policy(3, 1, 10))
            .unwrap()
            .with_label("fetch-profile")
            .with_event_sink(sink.clone());

        let _ = executor
            .run(|| async { Err::<(), _>("fail") }, &CancellationToken::new())
            .await;

        assert_eq!(
            sink.outcomes(Component::RetryExecutor),
            vec![Outcome::Retrying, Outcome::Retrying, Outcome::Exhausted]
        );
        assert!(sink.events().iter().all(|e| e.subject == "fetch-profile"));
    }

    #[test]
    fn test_invalid_policy_is_rejected() {
        assert!(RetryExecutor::new(policy(0, 10, 100)).is_err());
    }
}
