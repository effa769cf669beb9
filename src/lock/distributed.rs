//! Distributed lock with fencing tokens.
//!
//! Provides mutual exclusion across processes with:
//! - A random fencing token per acquisition, stored as the lock's value
//! - TTL-based automatic expiration for crash recovery
//! - Release and extend that only act on the caller's own record

use super::types::{FencingToken, LockConfig, LockHandle};
use crate::error::{CoordinationError, Result};
use crate::observability::events::{default_sink, Component, EventEmitter, EventSink, Outcome};
use crate::retry::{ErrorClassifier, RetryError, RetryExecutor};
use crate::store::{CoordinationStore, StoreError};
use crate::time::{system_clock, TimeProvider};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// A distributed mutex over the coordination store.
///
/// Acquisition never blocks: contention is reported as `Ok(None)` and the
/// caller decides whether to poll, give up, or use
/// [`acquire_with_retry`](Self::acquire_with_retry).
pub struct DistributedLock<S: CoordinationStore + ?Sized = dyn CoordinationStore> {
    store: Arc<S>,
    config: LockConfig,
    clock: Arc<dyn TimeProvider>,
    events: EventEmitter,
}

impl<S: CoordinationStore + ?Sized + 'static> DistributedLock<S> {
    /// Create a lock client over `store`, validating `config`.
    pub fn new(store: Arc<S>, config: LockConfig) -> Result<Self> {
        config.validate()?;

        let clock = system_clock();
        Ok(Self {
            store,
            config,
            events: EventEmitter::new(Component::DistributedLock, default_sink(), clock.clone()),
            clock,
        })
    }

    /// Read time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn TimeProvider>) -> Self {
        self.events = self.events.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    /// Report lock decisions to `sink`.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = self.events.with_sink(sink);
        self
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Current time on this lock's clock, for [`LockHandle::remaining_ttl`].
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Try to acquire the lock on `resource` for `ttl`.
    ///
    /// Returns `Ok(None)` if another owner holds a live lock. If `cancel`
    /// fires while the store write is in flight, a background
    /// compare-and-delete removes whatever that write may have created.
    pub async fn acquire(
        &self,
        resource: &str,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<LockHandle>> {
        validate_request(resource, ttl)?;
        if cancel.is_cancelled() {
            return Err(CoordinationError::Cancelled);
        }

        let key = self.lock_key(resource);
        let token = FencingToken::generate();
        let acquired_at_ms = self.clock.now_ms();

        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.cleanup_after_cancel(key.clone(), token.clone());
                self.events.emit(resource, Outcome::Cancelled, None);
                return Err(CoordinationError::Cancelled);
            }
            result = self.store.set(&key, token.as_str(), Some(ttl), true) => {
                result.map_err(|e| self.store_failure(resource, "acquire", e))?
            }
        };

        if !acquired {
            debug!(key = %key, "Lock held, not acquired");
            self.events.emit(resource, Outcome::Contended, None);
            return Ok(None);
        }

        let handle = LockHandle {
            resource: resource.to_string(),
            key,
            fencing_token: token,
            acquired_at_ms,
            expires_at_ms: acquired_at_ms.saturating_add(ttl.as_millis() as u64),
        };

        debug!(
            key = %handle.key,
            fencing_token = %handle.fencing_token,
            ttl_ms = ttl.as_millis() as u64,
            "Lock acquired"
        );
        self.events.emit(
            resource,
            Outcome::Acquired,
            Some(format!("ttl_ms={}", ttl.as_millis())),
        );
        Ok(Some(handle))
    }

    /// Acquire, retrying contention and store failures with `retry`'s backoff.
    ///
    /// Returns `Ok(None)` if the lock was still held when retries ran out.
    pub async fn acquire_with_retry<C>(
        &self,
        resource: &str,
        ttl: Duration,
        retry: &RetryExecutor<C>,
        cancel: &CancellationToken,
    ) -> Result<Option<LockHandle>>
    where
        C: ErrorClassifier<CoordinationError>,
    {
        let outcome = retry
            .run(
                move || async move {
                    match self.acquire(resource, ttl, cancel).await {
                        Ok(Some(handle)) => Ok(handle),
                        Ok(None) => Err(CoordinationError::LockHeld {
                            key: resource.to_string(),
                        }),
                        Err(e) => Err(e),
                    }
                },
                cancel,
            )
            .await;

        match outcome {
            Ok(handle) => Ok(Some(handle)),
            Err(RetryError::Cancelled { .. }) => Err(CoordinationError::Cancelled),
            Err(RetryError::Exhausted {
                source: CoordinationError::LockHeld { .. },
                attempts,
            })
            | Err(RetryError::Fatal {
                source: CoordinationError::LockHeld { .. },
                attempt: attempts,
            }) => {
                debug!(resource, attempts, "Lock still held after retries");
                Ok(None)
            }
            Err(RetryError::Exhausted { source, .. }) | Err(RetryError::Fatal { source, .. }) => {
                Err(source)
            }
        }
    }

    /// Release the lock if `handle` still owns it.
    ///
    /// Returns `false` when the lock expired or now belongs to someone else;
    /// the other owner's record is left untouched.
    pub async fn release(&self, handle: &LockHandle, cancel: &CancellationToken) -> Result<bool> {
        if cancel.is_cancelled() {
            return Err(CoordinationError::Cancelled);
        }

        let released = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CoordinationError::Cancelled),
            result = self.store.compare_and_delete(&handle.key, handle.fencing_token.as_str()) => {
                result.map_err(|e| self.store_failure(&handle.resource, "release", e))?
            }
        };

        if released {
            debug!(key = %handle.key, fencing_token = %handle.fencing_token, "Lock released");
            self.events.emit(&handle.resource, Outcome::Released, None);
        } else {
            warn!(
                key = %handle.key,
                fencing_token = %handle.fencing_token,
                "Lock release failed: already expired or taken"
            );
            self.events.emit(&handle.resource, Outcome::ReleaseRejected, None);
        }
        Ok(released)
    }

    /// Reset the lock's TTL to `ttl` if `handle` still owns it.
    ///
    /// On success the handle's expiry moves forward.
    pub async fn extend(
        &self,
        handle: &mut LockHandle,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        validate_request(&handle.resource, ttl)?;
        if cancel.is_cancelled() {
            return Err(CoordinationError::Cancelled);
        }

        let now_ms = self.clock.now_ms();
        let extended = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CoordinationError::Cancelled),
            result = self.store.compare_and_set_ttl(&handle.key, handle.fencing_token.as_str(), ttl) => {
                result.map_err(|e| self.store_failure(&handle.resource, "extend", e))?
            }
        };

        if extended {
            handle.expires_at_ms = now_ms.saturating_add(ttl.as_millis() as u64);
            debug!(key = %handle.key, ttl_ms = ttl.as_millis() as u64, "Lock extended");
            self.events.emit(
                &handle.resource,
                Outcome::Extended,
                Some(format!("ttl_ms={}", ttl.as_millis())),
            );
        } else {
            warn!(
                key = %handle.key,
                fencing_token = %handle.fencing_token,
                "Lock extend failed: lock lost"
            );
            self.events.emit(&handle.resource, Outcome::ExtendRejected, None);
        }
        Ok(extended)
    }

    fn lock_key(&self, resource: &str) -> String {
        format!("{}:{}", self.config.key_prefix, resource)
    }

    fn store_failure(&self, resource: &str, operation: &str, err: StoreError) -> CoordinationError {
        error!(resource, operation, error = %err, "Lock store operation failed");
        self.events
            .emit(resource, Outcome::StoreUnavailable, Some(err.to_string()));
        CoordinationError::StoreUnavailable(err)
    }

    /// Best-effort removal of a record a cancelled acquire may have written.
    /// The record expires via TTL anyway.
    fn cleanup_after_cancel(&self, key: String, token: FencingToken) {
        let store = self.store.clone();

        tokio::spawn(async move {
            match store.compare_and_delete(&key, token.as_str()).await {
                Ok(true) => debug!(key = %key, "Removed lock written by a cancelled acquire"),
                Ok(false) => {}
                Err(e) => {
                    debug!(key = %key, error = %e, "Cleanup after cancelled acquire failed (will expire via TTL)")
                }
            }
        });
    }
}

fn validate_request(resource: &str, ttl: Duration) -> Result<()> {
    if resource.is_empty() {
        return Err(CoordinationError::InvalidArgument(
            "Lock resource cannot be empty".to_string(),
        ));
    }
    if ttl.as_millis() == 0 {
        return Err(CoordinationError::InvalidArgument(
            "Lock TTL must be at least 1ms".to_string(),
        ));
    }
    Ok(())
}
