use super::types::{
    BreakerError, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitSnapshot, CircuitState,
};
use crate::error::Result;
use crate::observability::events::{default_sink, Component, EventEmitter, EventSink, Outcome};
use crate::time::{system_clock, TimeProvider};
use metrics::{counter, gauge};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Circuit breaker for a single resource
///
/// State lives behind a mutex that is never held across an await, so the
/// admission decision and every transition are atomic with respect to other
/// callers. The Open -> HalfOpen transition happens lazily on the first call
/// after the reset timeout; there is no background timer.
pub struct CircuitBreaker {
    /// Configuration
    config: CircuitBreakerConfig,
    /// Current state
    state: Mutex<State>,
    /// Resource identifier
    resource: String,
    clock: Arc<dyn TimeProvider>,
    events: EventEmitter,
}

#[derive(Debug)]
struct State {
    /// Current circuit state
    circuit_state: CircuitState,
    /// Number of consecutive failures in closed state
    consecutive_failures: u32,
    /// Number of successful probes in half-open state
    half_open_successes: u32,
    /// Number of half-open probes in flight
    half_open_in_flight: u32,
    /// Time of the failure that opened the circuit
    last_failure_at_ms: Option<u64>,
    /// Bumped on every transition; outcomes of calls admitted earlier are not counted
    generation: u64,
    /// Metrics
    metrics: CircuitBreakerMetrics,
}

/// Admission to run one call
#[derive(Debug, Clone, Copy)]
struct Permit {
    generation: u64,
    probe: bool,
}

/// Gives back an unfinished permit when the call is dropped or cancelled
struct PermitGuard<'a> {
    breaker: &'a CircuitBreaker,
    permit: Permit,
    armed: bool,
}

impl PermitGuard<'_> {
    fn complete(mut self) -> Permit {
        self.armed = false;
        self.permit
    }
}

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon(self.permit);
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker, validating `config`
    pub fn new(resource: impl Into<String>, config: CircuitBreakerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_validated(resource.into(), config))
    }

    pub(crate) fn from_validated(resource: String, config: CircuitBreakerConfig) -> Self {
        info!(
            resource = %resource,
            failure_threshold = config.failure_threshold,
            reset_timeout_ms = config.reset_timeout_ms,
            half_open_trial_count = config.half_open_trial_count,
            "Creating circuit breaker"
        );

        gauge!("gatekeeper_circuit_breaker_state", "resource" => resource.clone())
            .set(CircuitState::Closed.as_gauge());

        let clock = system_clock();
        Self {
            config,
            state: Mutex::new(State {
                circuit_state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                half_open_in_flight: 0,
                last_failure_at_ms: None,
                generation: 0,
                metrics: CircuitBreakerMetrics::default(),
            }),
            events: EventEmitter::new(Component::CircuitBreaker, default_sink(), clock.clone()),
            clock,
            resource,
        }
    }

    /// Read time from `clock` instead of the system clock
    pub fn with_clock(mut self, clock: Arc<dyn TimeProvider>) -> Self {
        self.events = self.events.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    /// Report admissions, rejections and transitions to `sink`
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = self.events.with_sink(sink);
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `op` through the breaker
    ///
    /// Rejected calls return [`BreakerError::Open`] without invoking `op`.
    /// A failure of `op`, or exceeding the configured call timeout, is
    /// recorded as a failure. Cancelling `cancel` returns
    /// [`BreakerError::Cancelled`] and records no outcome.
    pub async fn execute<F, Fut, T, E>(
        &self,
        op: F,
        cancel: &CancellationToken,
    ) -> std::result::Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if cancel.is_cancelled() {
            return Err(BreakerError::Cancelled);
        }

        let permit = match self.try_acquire() {
            Ok(permit) => permit,
            Err(retry_after) => {
                debug!(
                    resource = %self.resource,
                    retry_after = ?retry_after,
                    "Circuit breaker open, rejecting request"
                );
                self.events.emit(
                    &self.resource,
                    Outcome::Rejected,
                    Some(format!("retry_after_ms={}", retry_after.as_millis())),
                );
                return Err(BreakerError::Open {
                    resource: self.resource.clone(),
                    retry_after,
                });
            }
        };
        self.events.emit(&self.resource, Outcome::Admitted, None);

        let guard = PermitGuard {
            breaker: self,
            permit,
            armed: true,
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(resource = %self.resource, "Circuit breaker call cancelled");
                self.events.emit(&self.resource, Outcome::Cancelled, None);
                return Err(BreakerError::Cancelled);
            }
            outcome = call_with_timeout(op, self.config.call_timeout()) => outcome,
        };
        let permit = guard.complete();

        match outcome {
            Ok(Ok(value)) => {
                self.record_success(permit);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure(permit, false);
                Err(BreakerError::Operation(e))
            }
            Err(elapsed) => {
                warn!(resource = %self.resource, elapsed = ?elapsed, "Circuit breaker call timed out");
                self.record_failure(permit, true);
                Err(BreakerError::Timeout {
                    resource: self.resource.clone(),
                    elapsed,
                })
            }
        }
    }

    /// Get current state
    ///
    /// An open circuit whose reset timeout has elapsed still reports `Open`
    /// until the next call moves it to half-open.
    pub fn state(&self) -> CircuitState {
        self.lock_state().circuit_state
    }

    /// Get metrics
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        self.lock_state().metrics.clone()
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.lock_state();
        CircuitSnapshot {
            resource: self.resource.clone(),
            state: state.circuit_state,
            consecutive_failures: state.consecutive_failures,
            half_open_successes: state.half_open_successes,
            half_open_in_flight: state.half_open_in_flight,
            last_failure_at_ms: state.last_failure_at_ms,
            metrics: state.metrics.clone(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check if a request can proceed, claiming a probe slot in half-open state.
    /// On rejection returns the time until the circuit may admit calls again.
    fn try_acquire(&self) -> std::result::Result<Permit, Duration> {
        let now = self.clock.now_ms();
        let mut transition = None;

        let admitted = {
            let mut state = self.lock_state();

            match state.circuit_state {
                CircuitState::Closed => {
                    state.metrics.total_requests += 1;
                    Ok(Permit {
                        generation: state.generation,
                        probe: false,
                    })
                }
                CircuitState::Open => {
                    let reset_timeout = self.config.reset_timeout();
                    let opened_at = state.last_failure_at_ms.unwrap_or(0);
                    let elapsed = Duration::from_millis(now.saturating_sub(opened_at));

                    if elapsed >= reset_timeout {
                        self.transition_to_half_open(&mut state);
                        transition = Some(CircuitState::HalfOpen);
                        state.metrics.total_requests += 1;
                        state.half_open_in_flight += 1;
                        Ok(Permit {
                            generation: state.generation,
                            probe: true,
                        })
                    } else {
                        state.metrics.rejected_requests += 1;
                        Err(reset_timeout - elapsed)
                    }
                }
                CircuitState::HalfOpen => {
                    let claimed = state.half_open_successes + state.half_open_in_flight;
                    if claimed < self.config.half_open_trial_count {
                        state.metrics.total_requests += 1;
                        state.half_open_in_flight += 1;
                        debug!(
                            resource = %self.resource,
                            half_open_in_flight = state.half_open_in_flight,
                            max = self.config.half_open_trial_count,
                            "Allowing half-open probe request"
                        );
                        Ok(Permit {
                            generation: state.generation,
                            probe: true,
                        })
                    } else {
                        // All trial slots are claimed
                        state.metrics.rejected_requests += 1;
                        Err(Duration::ZERO)
                    }
                }
            }
        };

        if let Some(to) = transition {
            self.publish_transition(to);
        }
        admitted
    }

    /// Record a successful request
    fn record_success(&self, permit: Permit) {
        let mut transition = None;

        {
            let mut state = self.lock_state();
            state.metrics.successful_requests += 1;

            if state.generation != permit.generation {
                debug!(resource = %self.resource, "Ignoring success of a call admitted before the last transition");
            } else {
                match state.circuit_state {
                    CircuitState::Closed => {
                        // Reset failure count on success
                        state.consecutive_failures = 0;
                    }
                    CircuitState::HalfOpen => {
                        state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
                        state.half_open_successes += 1;

                        debug!(
                            resource = %self.resource,
                            half_open_successes = state.half_open_successes,
                            threshold = self.config.half_open_trial_count,
                            "Half-open probe request succeeded"
                        );

                        if state.half_open_successes >= self.config.half_open_trial_count {
                            self.transition_to_closed(&mut state);
                            transition = Some(CircuitState::Closed);
                        }
                    }
                    CircuitState::Open => {}
                }
            }
        }

        if let Some(to) = transition {
            self.publish_transition(to);
        }
    }

    /// Record a failed request
    fn record_failure(&self, permit: Permit, timed_out: bool) {
        let now = self.clock.now_ms();
        let mut transition = None;

        {
            let mut state = self.lock_state();
            state.metrics.failed_requests += 1;
            if timed_out {
                state.metrics.timeout_count += 1;
            }

            if state.generation != permit.generation {
                debug!(resource = %self.resource, "Ignoring failure of a call admitted before the last transition");
            } else {
                match state.circuit_state {
                    CircuitState::Closed => {
                        state.consecutive_failures += 1;

                        debug!(
                            resource = %self.resource,
                            consecutive_failures = state.consecutive_failures,
                            threshold = self.config.failure_threshold,
                            "Request failed in closed state"
                        );

                        if state.consecutive_failures >= self.config.failure_threshold {
                            self.transition_to_open(&mut state, now);
                            transition = Some(CircuitState::Open);
                        }
                    }
                    CircuitState::HalfOpen => {
                        warn!(
                            resource = %self.resource,
                            "Half-open probe request failed, reopening circuit"
                        );
                        // Any failure in half-open state reopens the circuit
                        self.transition_to_open(&mut state, now);
                        transition = Some(CircuitState::Open);
                    }
                    CircuitState::Open => {}
                }
            }
        }

        if let Some(to) = transition {
            self.publish_transition(to);
        }
    }

    /// Give back a permit whose call never completed
    fn abandon(&self, permit: Permit) {
        let mut state = self.lock_state();
        state.metrics.cancelled_requests += 1;

        if permit.probe
            && state.generation == permit.generation
            && state.circuit_state == CircuitState::HalfOpen
        {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
            debug!(resource = %self.resource, "Released unfinished half-open probe slot");
        }
    }

    /// Transition to open state
    fn transition_to_open(&self, state: &mut State, now_ms: u64) {
        warn!(
            resource = %self.resource,
            consecutive_failures = state.consecutive_failures,
            from = %state.circuit_state,
            "Circuit breaker opening"
        );

        state.circuit_state = CircuitState::Open;
        state.last_failure_at_ms = Some(now_ms);
        state.consecutive_failures = 0;
        state.half_open_successes = 0;
        state.half_open_in_flight = 0;
        state.generation += 1;
        state.metrics.circuit_opened_count += 1;
    }

    /// Transition to half-open state
    fn transition_to_half_open(&self, state: &mut State) {
        info!(
            resource = %self.resource,
            reset_timeout = ?self.config.reset_timeout(),
            "Circuit breaker transitioning to half-open"
        );

        state.circuit_state = CircuitState::HalfOpen;
        state.consecutive_failures = 0;
        state.half_open_successes = 0;
        state.half_open_in_flight = 0;
        state.generation += 1;
        state.metrics.circuit_half_opened_count += 1;
    }

    /// Transition to closed state
    fn transition_to_closed(&self, state: &mut State) {
        info!(
            resource = %self.resource,
            half_open_successes = state.half_open_successes,
            "Circuit breaker closing"
        );

        state.circuit_state = CircuitState::Closed;
        state.last_failure_at_ms = None;
        state.consecutive_failures = 0;
        state.half_open_successes = 0;
        state.half_open_in_flight = 0;
        state.generation += 1;
        state.metrics.circuit_closed_count += 1;
    }

    fn publish_transition(&self, to: CircuitState) {
        gauge!("gatekeeper_circuit_breaker_state", "resource" => self.resource.clone())
            .set(to.as_gauge());
        counter!(
            "gatekeeper_circuit_breaker_transitions_total",
            "resource" => self.resource.clone(),
            "to" => to.to_string()
        )
        .increment(1);

        let outcome = match to {
            CircuitState::Open => Outcome::Opened,
            CircuitState::HalfOpen => Outcome::HalfOpened,
            CircuitState::Closed => Outcome::Closed,
        };
        self.events.emit(&self.resource, outcome, None);
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("resource", &self.resource)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

/// Run `op`, failing with the limit if it takes longer than `timeout`
async fn call_with_timeout<F, Fut, T, E>(
    op: F,
    timeout: Option<Duration>,
) -> std::result::Result<std::result::Result<T, E>, Duration>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, op()).await.map_err(|_| limit),
        None => Ok(op().await),
    }
}
