//! Shared types for the distributed lock.

use crate::error::{CoordinationError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Configuration for distributed locks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Prefix of every lock key written to the store.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// TTL used by callers that do not pick one, in milliseconds.
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,
}

fn default_key_prefix() -> String {
    "gatekeeper:lock".to_string()
}

fn default_ttl_ms() -> u64 {
    30_000
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            default_ttl_ms: default_ttl_ms(),
        }
    }
}

impl LockConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.is_empty() {
            return Err(CoordinationError::Config(
                "Lock key prefix cannot be empty".to_string(),
            ));
        }
        if self.default_ttl_ms == 0 {
            return Err(CoordinationError::Config(
                "Lock default_ttl_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Proof of ownership returned on successful lock acquisition.
///
/// Stored as the lock's value; release and extend only act on a record that
/// still holds this exact token. Include it in operations protected by the
/// lock so downstream services can reject stale holders.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FencingToken(String);

impl FencingToken {
    /// Generate a new random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FencingToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FencingToken({})", self.0)
    }
}

/// A held lock.
///
/// Owned by the acquiring caller; dropping it does not release the lock,
/// which then expires through its TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    /// Name passed to `acquire`
    pub(crate) resource: String,
    /// Store key, prefix included
    pub(crate) key: String,
    pub(crate) fencing_token: FencingToken,
    /// Unix milliseconds
    pub(crate) acquired_at_ms: u64,
    /// Unix milliseconds; moved forward by a successful extend
    pub(crate) expires_at_ms: u64,
}

impl LockHandle {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn fencing_token(&self) -> &FencingToken {
        &self.fencing_token
    }

    pub fn acquired_at_ms(&self) -> u64 {
        self.acquired_at_ms
    }

    pub fn expires_at_ms(&self) -> u64 {
        self.expires_at_ms
    }

    /// Remaining lease at `now_ms` (zero once expired).
    pub fn remaining_ttl(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.expires_at_ms.saturating_sub(now_ms))
    }

    /// Whether the lease has run out at `now_ms`.
    ///
    /// Based on the local view of the TTL; the store may have dropped the
    /// record slightly earlier or later.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}
