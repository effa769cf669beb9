use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::error::{CoordinationError, Result};
use crate::lock::{DistributedLock, LockConfig};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::store::{CoordinationStore, StoreConfig};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Prefix of environment variables overriding file settings,
/// e.g. `GATEKEEPER__STORE__OPERATION_TIMEOUT_MS=250`
const ENV_PREFIX: &str = "GATEKEEPER";
const ENV_SEPARATOR: &str = "__";

/// Main gatekeeper configuration
///
/// Named sections let one file describe every guarded resource of a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Coordination store connection
    #[serde(default)]
    pub store: StoreConfig,
    /// Rate limiters by name
    #[serde(default)]
    pub rate_limiters: HashMap<String, RateLimitConfig>,
    /// Circuit breakers by resource; `default` applies to unlisted resources
    #[serde(default)]
    pub circuit_breakers: HashMap<String, CircuitBreakerConfig>,
    /// Retry policies by name
    #[serde(default)]
    pub retry_policies: HashMap<String, RetryPolicy>,
    /// Distributed lock settings
    #[serde(default)]
    pub lock: LockConfig,
}

/// Key in `circuit_breakers` used as the registry default
pub const DEFAULT_BREAKER: &str = "default";

impl GatekeeperConfig {
    /// Load configuration from a YAML file, applying `GATEKEEPER__*` environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = Config::builder()
            .add_source(File::from(path).format(FileFormat::Yaml))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| {
                CoordinationError::Config(format!(
                    "Failed to read config file {}: {}",
                    path.display(),
                    e
                ))
            })?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| CoordinationError::Config(format!("Failed to parse config: {}", e)))?;

        info!(
            path = %path.display(),
            rate_limiters = config.rate_limiters.len(),
            circuit_breakers = config.circuit_breakers.len(),
            retry_policies = config.retry_policies.len(),
            "Loaded gatekeeper configuration"
        );
        Ok(config)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| CoordinationError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.store.operation_timeout_ms == 0 {
            return Err(CoordinationError::Config(
                "store.operation_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.store.purge_interval_ms == 0 {
            return Err(CoordinationError::Config(
                "store.purge_interval_ms must be > 0".to_string(),
            ));
        }
        if matches!(&self.store.url, Some(url) if url.is_empty()) {
            return Err(CoordinationError::Config(
                "store.url cannot be empty when set".to_string(),
            ));
        }

        for (name, limiter) in &self.rate_limiters {
            limiter
                .validate()
                .map_err(|e| in_section("rate_limiters", name, e))?;
        }
        for (name, breaker) in &self.circuit_breakers {
            breaker
                .validate()
                .map_err(|e| in_section("circuit_breakers", name, e))?;
        }
        for (name, policy) in &self.retry_policies {
            policy
                .validate()
                .map_err(|e| in_section("retry_policies", name, e))?;
        }
        self.lock
            .validate()
            .map_err(|e| in_section("lock", "settings", e))?;

        Ok(())
    }

    /// Build the rate limiter configured under `name`
    pub fn rate_limiter(
        &self,
        name: &str,
        store: Arc<dyn CoordinationStore>,
    ) -> Result<RateLimiter> {
        let config = lookup(&self.rate_limiters, "rate_limiters", name)?;
        RateLimiter::new(store, config.clone())
    }

    /// Build the retry executor configured under `name`
    pub fn retry_executor(&self, name: &str) -> Result<RetryExecutor> {
        let policy = lookup(&self.retry_policies, "retry_policies", name)?;
        Ok(RetryExecutor::new(policy.clone())?.with_label(name))
    }

    /// Build a breaker registry; the `default` entry (or built-in defaults)
    /// covers resources without their own section
    pub fn circuit_breaker_registry(&self) -> Result<CircuitBreakerRegistry> {
        let default = self
            .circuit_breakers
            .get(DEFAULT_BREAKER)
            .cloned()
            .unwrap_or_default();

        let mut registry = CircuitBreakerRegistry::new(default)?;
        for (resource, config) in &self.circuit_breakers {
            if resource != DEFAULT_BREAKER {
                registry = registry.with_resource_config(resource.clone(), config.clone())?;
            }
        }
        Ok(registry)
    }

    /// Build a lock client over `store`
    pub fn distributed_lock(&self, store: Arc<dyn CoordinationStore>) -> Result<DistributedLock> {
        DistributedLock::new(store, self.lock.clone())
    }
}

fn lookup<'a, T>(section: &'a HashMap<String, T>, section_name: &str, name: &str) -> Result<&'a T> {
    section.get(name).ok_or_else(|| {
        CoordinationError::Config(format!("No entry '{}' in {}", name, section_name))
    })
}

fn in_section(section: &str, name: &str, err: CoordinationError) -> CoordinationError {
    match err {
        CoordinationError::Config(msg) => {
            CoordinationError::Config(format!("{}.{}: {}", section, name, msg))
        }
        other => other,
    }
}
