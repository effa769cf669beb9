//! Logging, metrics and the coordination event stream
//!
//! Every primitive reports its decisions (admit, reject, state transition,
//! lock acquire/release) as a [`CoordinationEvent`] to an [`EventSink`].
//! The default sink logs through `tracing`; [`MetricsEventSink`] feeds the
//! `metrics` facade and [`FanoutEventSink`] combines several sinks.

pub mod events;
pub mod metrics;

pub use events::{
    default_sink, Component, CoordinationEvent, EventSink, FanoutEventSink, MemoryEventSink,
    MetricsEventSink, Outcome, TracingEventSink,
};
pub use self::metrics::{describe_metrics, install_prometheus_recorder, MetricsService};

use crate::error::{CoordinationError, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "gatekeeper=debug";

/// Install a global `tracing` subscriber
///
/// Honors `RUST_LOG`, falling back to `gatekeeper=debug`. Fails if a global
/// subscriber is already installed.
pub fn init_tracing(json: bool) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());

    let installed = if json {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .try_init()
    };

    installed.map_err(|e| {
        CoordinationError::Config(format!("Failed to install tracing subscriber: {}", e))
    })?;

    info!(json, "Tracing initialized");
    Ok(())
}
