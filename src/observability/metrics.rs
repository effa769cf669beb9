use crate::error::{CoordinationError, Result};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use tracing::{debug, info};

/// Prometheus recorder for gatekeeper metrics
///
/// Installs the global `metrics` recorder; the host service exposes
/// [`MetricsService::render`] on whatever endpoint it serves.
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl MetricsService {
    /// Install the Prometheus recorder and describe gatekeeper metrics
    pub fn new() -> Result<Self> {
        let handle = install_prometheus_recorder()?;

        info!("Metrics service initialized successfully");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    /// Get the Prometheus metrics handle
    pub fn handle(&self) -> Arc<PrometheusHandle> {
        self.handle.clone()
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Install the Prometheus recorder as the global `metrics` recorder
///
/// Fails if a global recorder is already installed.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        CoordinationError::Config(format!("Failed to install metrics recorder: {}", e))
    })?;

    describe_metrics();
    Ok(handle)
}

/// Register descriptions for every metric the crate emits
pub fn describe_metrics() {
    describe_counter!(
        "gatekeeper_events_total",
        "Coordination decisions by component and outcome"
    );
    describe_gauge!(
        "gatekeeper_circuit_breaker_state",
        "Circuit breaker state (0 = closed, 1 = open, 2 = half-open)"
    );
    describe_counter!(
        "gatekeeper_circuit_breaker_transitions_total",
        "Total number of circuit breaker state transitions"
    );
    describe_counter!(
        "gatekeeper_rate_limit_store_errors_total",
        "Rate limit checks that could not reach the coordination store"
    );

    debug!("All metrics registered with descriptions");
}
