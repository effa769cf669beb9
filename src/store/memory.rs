use super::{
    token_bucket_step, CoordinationStore, SlidingWindowOutcome, SlidingWindowRequest, StoreError,
    StoreResult, TokenBucketOutcome, TokenBucketRequest,
};
use crate::time::{system_clock, TimeProvider};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// In-process coordination store
///
/// Each primitive runs under the map shard's write lock for its key, which
/// makes every read-modify-write atomic with respect to other callers of the
/// same store instance. Expired entries are dropped lazily on access, by
/// [`InMemoryStore::purge_expired`], or by the loop started with
/// [`InMemoryStore::spawn_purge_task`]. Keys that are never read again, such
/// as past fixed windows, only go away through the latter two.
#[derive(Debug)]
pub struct InMemoryStore {
    entries: DashMap<String, Slot>,
    clock: Arc<dyn TimeProvider>,
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Text(String),
    Counter(i64),
    Bucket { tokens: f64, last_refill_ms: u64 },
    Log(Vec<(u64, String)>),
}

impl Slot {
    fn new(value: Value, now_ms: u64, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at_ms: ttl.map(|ttl| now_ms.saturating_add(ttl.as_millis() as u64)),
        }
    }

    fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms.map_or(true, |at| now_ms < at)
    }

    fn holds_text(&self, expected: &str) -> bool {
        matches!(&self.value, Value::Text(v) if v == expected)
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Create a store whose expiry decisions follow `clock`
    pub fn with_clock(clock: Arc<dyn TimeProvider>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, slot| slot.is_live(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "Purged expired entries");
        }
        removed
    }

    /// Purge expired entries every `every` until the returned token is
    /// cancelled or the store is dropped
    pub fn spawn_purge_task(self: &Arc<Self>, every: Duration) -> CancellationToken {
        let cancel = CancellationToken::new();
        let store = Arc::downgrade(self);
        tokio::spawn(run_purge_loop(store, every, cancel.clone()));
        cancel
    }

    /// Number of stored entries, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

async fn run_purge_loop(store: Weak<InMemoryStore>, every: Duration, cancel: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(interval_ms = every.as_millis() as u64, "Expired entry purge task started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Expired entry purge task shutting down");
                break;
            }
            _ = ticker.tick() => {
                match store.upgrade() {
                    Some(store) => {
                        store.purge_expired();
                    }
                    None => {
                        debug!("Store dropped, stopping purge task");
                        break;
                    }
                }
            }
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = self.clock.now_ms();

        let found = self
            .entries
            .get(key)
            .map(|slot| (slot.is_live(now), slot.value.clone()));

        match found {
            None => Ok(None),
            Some((false, _)) => {
                self.entries.remove_if(key, |_, slot| !slot.is_live(now));
                Ok(None)
            }
            Some((true, Value::Text(value))) => Ok(Some(value)),
            Some((true, Value::Counter(n))) => Ok(Some(n.to_string())),
            Some((true, _)) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        only_if_absent: bool,
    ) -> StoreResult<bool> {
        let now = self.clock.now_ms();
        let slot = Slot::new(Value::Text(value.to_string()), now, ttl);

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if only_if_absent && occupied.get().is_live(now) {
                    return Ok(false);
                }
                occupied.insert(slot);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                Ok(true)
            }
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let now = self.clock.now_ms();
        let removed = self
            .entries
            .remove_if(key, |_, slot| slot.is_live(now) && slot.holds_text(expected));
        Ok(removed.is_some())
    }

    async fn compare_and_set_ttl(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = self.clock.now_ms();
        match self.entries.get_mut(key) {
            Some(mut slot) if slot.is_live(now) && slot.holds_text(expected) => {
                slot.expires_at_ms = Some(now.saturating_add(ttl.as_millis() as u64));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn incr_with_expiry(
        &self,
        key: &str,
        amount: i64,
        ttl_if_new: Duration,
    ) -> StoreResult<i64> {
        let now = self.clock.now_ms();

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().is_live(now) => {
                let slot = occupied.get_mut();
                let current = match &slot.value {
                    Value::Counter(n) => *n,
                    Value::Text(text) => text.parse::<i64>().map_err(|_| StoreError::WrongType {
                        key: key.to_string(),
                    })?,
                    _ => {
                        return Err(StoreError::WrongType {
                            key: key.to_string(),
                        })
                    }
                };
                let next = current.saturating_add(amount);
                slot.value = Value::Counter(next);
                Ok(next)
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(Slot::new(Value::Counter(amount), now, Some(ttl_if_new)));
                Ok(amount)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(Value::Counter(amount), now, Some(ttl_if_new)));
                Ok(amount)
            }
        }
    }

    async fn token_bucket(
        &self,
        key: &str,
        request: &TokenBucketRequest,
    ) -> StoreResult<TokenBucketOutcome> {
        let now = self.clock.now_ms();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| {
            Slot::new(
                Value::Bucket {
                    tokens: request.capacity,
                    last_refill_ms: request.now_ms,
                },
                now,
                Some(request.idle_ttl),
            )
        });

        let (tokens, last_refill_ms) = match (&entry.value, entry.is_live(now)) {
            (Value::Bucket {
                tokens,
                last_refill_ms,
            }, true) => (*tokens, *last_refill_ms),
            (Value::Bucket { .. }, false) => (request.capacity, request.now_ms),
            _ => {
                return Err(StoreError::WrongType {
                    key: key.to_string(),
                })
            }
        };

        let (outcome, refilled_at) = token_bucket_step(tokens, last_refill_ms, request);
        *entry = Slot::new(
            Value::Bucket {
                tokens: outcome.tokens,
                last_refill_ms: refilled_at,
            },
            now,
            Some(request.idle_ttl),
        );

        Ok(outcome)
    }

    async fn sliding_window_log(
        &self,
        key: &str,
        request: &SlidingWindowRequest,
    ) -> StoreResult<SlidingWindowOutcome> {
        let now = self.clock.now_ms();
        let window_ms = request.window.as_millis() as u64;
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(Value::Log(Vec::new()), now, Some(request.window)));

        if !entry.is_live(now) {
            *entry = Slot::new(Value::Log(Vec::new()), now, Some(request.window));
        }

        let log = match &mut entry.value {
            Value::Log(log) => log,
            _ => {
                return Err(StoreError::WrongType {
                    key: key.to_string(),
                })
            }
        };

        log.retain(|(at, _)| at.saturating_add(window_ms) > request.now_ms);
        let count = log.len() as u64;

        let outcome = if count < request.limit {
            log.push((request.now_ms, request.member.clone()));
            SlidingWindowOutcome {
                allowed: true,
                count: count + 1,
                retry_after: Duration::ZERO,
            }
        } else {
            let oldest = log.iter().map(|(at, _)| *at).min().unwrap_or(request.now_ms);
            let wait_ms = oldest
                .saturating_add(window_ms)
                .saturating_sub(request.now_ms)
                .max(1);
            SlidingWindowOutcome {
                allowed: false,
                count,
                retry_after: Duration::from_millis(wait_ms),
            }
        };

        if outcome.allowed {
            entry.expires_at_ms = Some(now.saturating_add(window_ms));
        }

        Ok(outcome)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
