use super::breaker::CircuitBreaker;
use super::types::{
    BreakerError, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitSnapshot, CircuitState,
};
use crate::error::Result;
use crate::observability::events::{default_sink, EventSink};
use crate::time::{system_clock, TimeProvider};
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Circuit breakers for many resources, created on first use
///
/// Each resource gets its own breaker, configured from a per-resource
/// override or the registry default.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    /// Circuit breakers per resource
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
    /// Default configuration
    default_config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    clock: Arc<dyn TimeProvider>,
    sink: Arc<dyn EventSink>,
}

impl CircuitBreakerRegistry {
    /// Create a new registry, validating the default configuration
    pub fn new(default_config: CircuitBreakerConfig) -> Result<Self> {
        default_config.validate()?;

        Ok(Self {
            breakers: Arc::new(DashMap::new()),
            default_config,
            overrides: HashMap::new(),
            clock: system_clock(),
            sink: default_sink(),
        })
    }

    /// Use `config` for `resource` instead of the default
    pub fn with_resource_config(
        mut self,
        resource: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Result<Self> {
        config.validate()?;
        self.overrides.insert(resource.into(), config);
        Ok(self)
    }

    /// Clock handed to breakers created from now on
    pub fn with_clock(mut self, clock: Arc<dyn TimeProvider>) -> Self {
        self.clock = clock;
        self
    }

    /// Event sink handed to breakers created from now on
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Get or create the circuit breaker for a resource
    pub fn breaker(&self, resource: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(resource.to_string())
            .or_insert_with(|| {
                debug!(resource = resource, "Creating new circuit breaker");
                let config = self
                    .overrides
                    .get(resource)
                    .unwrap_or(&self.default_config)
                    .clone();
                Arc::new(
                    CircuitBreaker::from_validated(resource.to_string(), config)
                        .with_clock(self.clock.clone())
                        .with_event_sink(self.sink.clone()),
                )
            })
            .clone()
    }

    /// Run `op` through the breaker for `resource`
    pub async fn execute<F, Fut, T, E>(
        &self,
        resource: &str,
        op: F,
        cancel: &CancellationToken,
    ) -> std::result::Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let breaker = self.breaker(resource);
        breaker.execute(op, cancel).await
    }

    /// Get the state of the circuit breaker for a resource
    pub fn state(&self, resource: &str) -> CircuitState {
        self.breakers
            .get(resource)
            .map(|breaker| breaker.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Get metrics for a resource
    pub fn metrics(&self, resource: &str) -> Option<CircuitBreakerMetrics> {
        self.breakers.get(resource).map(|breaker| breaker.metrics())
    }

    /// Get all resource names with circuit breakers
    pub fn resources(&self) -> Vec<String> {
        self.breakers.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshots of every breaker
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        self.breakers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("resources", &self.resources())
            .field("default_config", &self.default_config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fail(registry: &CircuitBreakerRegistry, resource: &str) {
        let result: std::result::Result<(), BreakerError<String>> = registry
            .execute(
                resource,
                || async { Err("boom".to_string()) },
                &CancellationToken::new(),
            )
            .await;
        assert!(result.is_err());
    }

    async fn succeed(registry: &CircuitBreakerRegistry, resource: &str) {
        let result: std::result::Result<(), BreakerError<String>> = registry
            .execute(resource, || async { Ok(()) }, &CancellationToken::new())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_registry_manages_multiple_resources() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        };
        let registry = CircuitBreakerRegistry::new(config).unwrap();

        succeed(&registry, "backend1").await;
        fail(&registry, "backend2").await;
        fail(&registry, "backend2").await;

        assert_eq!(registry.state("backend1"), CircuitState::Closed);
        assert_eq!(registry.state("backend2"), CircuitState::Open);

        let resources = registry.resources();
        assert_eq!(resources.len(), 2);
        assert!(resources.contains(&"backend1".to_string()));
        assert!(resources.contains(&"backend2".to_string()));
    }

    #[tokio::test]
    async fn test_registry_snapshots() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default()).unwrap();

        succeed(&registry, "backend1").await;
        fail(&registry, "backend2").await;

        let snapshots = registry.snapshots();
        assert_eq!(snapshots.len(), 2);

        let backend1 = snapshots.iter().find(|s| s.resource == "backend1").unwrap();
        assert_eq!(backend1.metrics.successful_requests, 1);

        let backend2 = snapshots.iter().find(|s| s.resource == "backend2").unwrap();
        assert_eq!(backend2.metrics.failed_requests, 1);
        assert_eq!(backend2.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_resource_override() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default())
            .unwrap()
            .with_resource_config(
                "fragile",
                CircuitBreakerConfig {
                    failure_threshold: 1,
                    ..Default::default()
                },
            )
            .unwrap();

        fail(&registry, "fragile").await;
        fail(&registry, "sturdy").await;

        assert_eq!(registry.state("fragile"), CircuitState::Open);
        assert_eq!(registry.state("sturdy"), CircuitState::Closed);
        assert_eq!(registry.breaker("fragile").config().failure_threshold, 1);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default()).unwrap();
        let invalid = CircuitBreakerConfig {
            half_open_trial_count: 0,
            ..Default::default()
        };
        assert!(registry.with_resource_config("x", invalid).is_err());
    }

    #[test]
    fn test_registry_nonexistent_resource() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default()).unwrap();

        assert_eq!(registry.state("nonexistent"), CircuitState::Closed);
        assert!(registry.metrics("nonexistent").is_none());
    }

    #[test]
    fn test_breaker_is_shared_between_lookups() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default()).unwrap();
        let a = registry.breaker("backend");
        let b = registry.clone().breaker("backend");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
