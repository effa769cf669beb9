use crate::time::TimeProvider;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Which primitive produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    RateLimiter,
    RetryExecutor,
    CircuitBreaker,
    DistributedLock,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::RateLimiter => "rate_limiter",
            Component::RetryExecutor => "retry_executor",
            Component::CircuitBreaker => "circuit_breaker",
            Component::DistributedLock => "distributed_lock",
        }
    }
}

/// The decision or transition an event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Admitted,
    Rejected,
    StoreUnavailable,
    Succeeded,
    Failed,
    Retrying,
    Exhausted,
    Opened,
    HalfOpened,
    Closed,
    Acquired,
    Contended,
    Released,
    ReleaseRejected,
    Extended,
    ExtendRejected,
    Cancelled,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Admitted => "admitted",
            Outcome::Rejected => "rejected",
            Outcome::StoreUnavailable => "store_unavailable",
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
            Outcome::Retrying => "retrying",
            Outcome::Exhausted => "exhausted",
            Outcome::Opened => "opened",
            Outcome::HalfOpened => "half_opened",
            Outcome::Closed => "closed",
            Outcome::Acquired => "acquired",
            Outcome::Contended => "contended",
            Outcome::Released => "released",
            Outcome::ReleaseRejected => "release_rejected",
            Outcome::Extended => "extended",
            Outcome::ExtendRejected => "extend_rejected",
            Outcome::Cancelled => "cancelled",
        }
    }
}

/// One admit/reject/transition/lock decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationEvent {
    pub component: Component,
    /// Rate-limit subject, breaker resource, retry label or lock key
    pub subject: String,
    pub outcome: Outcome,
    /// Unix milliseconds
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Observer for coordination events
///
/// Sinks are called inline on the decision path and must not block.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &CoordinationEvent);
}

/// Logs every event through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: &CoordinationEvent) {
        let component = event.component.as_str();
        let outcome = event.outcome.as_str();
        let detail = event.detail.as_deref().unwrap_or("");

        match event.outcome {
            Outcome::Rejected
            | Outcome::StoreUnavailable
            | Outcome::Exhausted
            | Outcome::Opened
            | Outcome::ReleaseRejected
            | Outcome::ExtendRejected => warn!(
                component,
                subject = %event.subject,
                outcome,
                timestamp_ms = event.timestamp_ms,
                detail,
                "coordination event"
            ),
            Outcome::HalfOpened | Outcome::Closed => info!(
                component,
                subject = %event.subject,
                outcome,
                timestamp_ms = event.timestamp_ms,
                detail,
                "coordination event"
            ),
            _ => debug!(
                component,
                subject = %event.subject,
                outcome,
                timestamp_ms = event.timestamp_ms,
                detail,
                "coordination event"
            ),
        }
    }
}

/// Counts events in the `gatekeeper_events_total` counter
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsEventSink;

impl EventSink for MetricsEventSink {
    fn record(&self, event: &CoordinationEvent) {
        counter!(
            "gatekeeper_events_total",
            "component" => event.component.as_str(),
            "outcome" => event.outcome.as_str()
        )
        .increment(1);
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<CoordinationEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CoordinationEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Outcomes recorded for `component`, in order
    pub fn outcomes(&self, component: Component) -> Vec<Outcome> {
        self.events()
            .into_iter()
            .filter(|e| e.component == component)
            .map(|e| e.outcome)
            .collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl EventSink for MemoryEventSink {
    fn record(&self, event: &CoordinationEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}

/// Forwards every event to several sinks
#[derive(Default, Clone)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutEventSink {
    fn record(&self, event: &CoordinationEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}

/// Default sink used by every primitive unless one is supplied
pub fn default_sink() -> Arc<dyn EventSink> {
    Arc::new(TracingEventSink)
}

/// Stamps and forwards events for one component
#[derive(Clone)]
pub(crate) struct EventEmitter {
    component: Component,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn TimeProvider>,
}

impl EventEmitter {
    pub(crate) fn new(
        component: Component,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            component,
            sink,
            clock,
        }
    }

    pub(crate) fn with_sink(&self, sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            ..self.clone()
        }
    }

    pub(crate) fn with_clock(&self, clock: Arc<dyn TimeProvider>) -> Self {
        Self {
            clock,
            ..self.clone()
        }
    }

    pub(crate) fn emit(&self, subject: &str, outcome: Outcome, detail: Option<String>) {
        self.sink.record(&CoordinationEvent {
            component: self.component,
            subject: subject.to_string(),
            outcome,
            timestamp_ms: self.clock.now_ms(),
            detail,
        });
    }
}
