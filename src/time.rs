//! Injectable wall-clock time.
//!
//! Every primitive reads "now" through a [`TimeProvider`] so window
//! boundaries, token refill and reset timeouts can be driven
//! deterministically in tests with [`ManualTimeProvider`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of the current Unix time in milliseconds
pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    fn now_ms(&self) -> u64;
}

/// Current Unix timestamp in milliseconds, 0 if the clock is before the epoch
pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Production time provider backed by the system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_ms(&self) -> u64 {
        unix_now_ms()
    }
}

/// Manually advanced clock. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualTimeProvider {
    now_ms: Arc<AtomicU64>,
}

impl ManualTimeProvider {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_ms(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Default for ManualTimeProvider {
    fn default() -> Self {
        Self::new(unix_now_ms())
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Shared handle to the default system clock
pub fn system_clock() -> Arc<dyn TimeProvider> {
    Arc::new(SystemTimeProvider)
}
