use crate::error::{CoordinationError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, allowing probe requests
    HalfOpen,
}

impl CircuitState {
    /// Numeric value exported in the `gatekeeper_circuit_breaker_state` gauge
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "Closed"),
            CircuitState::Open => write!(f, "Open"),
            CircuitState::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time to stay open after the last failure before probing (milliseconds)
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Successful probes needed in half-open state to close the circuit.
    /// Also the number of probes admitted at once.
    #[serde(default = "default_half_open_trial_count")]
    pub half_open_trial_count: u32,

    /// Optional timeout for the wrapped call (milliseconds); exceeding it counts as a failure
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    60_000
}

fn default_half_open_trial_count() -> u32 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_trial_count: default_half_open_trial_count(),
            call_timeout_ms: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(CoordinationError::Config(
                "Circuit breaker failure_threshold must be >= 1".to_string(),
            ));
        }
        if self.half_open_trial_count == 0 {
            return Err(CoordinationError::Config(
                "Circuit breaker half_open_trial_count must be >= 1".to_string(),
            ));
        }
        if self.call_timeout_ms == Some(0) {
            return Err(CoordinationError::Config(
                "Circuit breaker call_timeout_ms must be > 0 when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Circuit breaker metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerMetrics {
    /// Total number of admitted requests
    pub total_requests: u64,
    /// Number of successful requests
    pub successful_requests: u64,
    /// Number of failed requests (timeouts included)
    pub failed_requests: u64,
    /// Number of requests rejected (circuit open or no probe slot)
    pub rejected_requests: u64,
    /// Number of timeouts
    pub timeout_count: u64,
    /// Admitted requests cancelled before completing
    pub cancelled_requests: u64,
    /// Number of times circuit opened
    pub circuit_opened_count: u64,
    /// Number of times circuit closed
    pub circuit_closed_count: u64,
    /// Number of times circuit half-opened
    pub circuit_half_opened_count: u64,
}

/// Read-only view of a breaker's state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub resource: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    /// Probe calls currently running
    pub half_open_in_flight: u32,
    /// Unix milliseconds of the failure that last opened the circuit
    pub last_failure_at_ms: Option<u64>,
    pub metrics: CircuitBreakerMetrics,
}

/// Failure of a call made through a circuit breaker
#[derive(Error, Debug)]
pub enum BreakerError<E> {
    /// Rejected without calling the operation
    #[error("Circuit open for '{resource}', retry after {retry_after:?}")]
    Open {
        resource: String,
        retry_after: Duration,
    },

    #[error("Call to '{resource}' timed out after {elapsed:?}")]
    Timeout { resource: String, elapsed: Duration },

    #[error("Call cancelled")]
    Cancelled,

    #[error("{0}")]
    Operation(#[source] E),
}

impl<E> BreakerError<E> {
    /// Whether the breaker rejected the call without running it
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    /// The operation's own error, if the operation ran and failed
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            BreakerError::Operation(e) => Some(e),
            _ => None,
        }
    }
}
