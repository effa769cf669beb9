use super::lua_scripts::{
    COMPARE_AND_DELETE_SCRIPT, COMPARE_AND_SET_TTL_SCRIPT, INCR_WITH_EXPIRY_SCRIPT,
    SLIDING_WINDOW_SCRIPT, TOKEN_BUCKET_SCRIPT,
};
use super::{
    CoordinationStore, SlidingWindowOutcome, SlidingWindowRequest, StoreError, StoreResult,
    TokenBucketOutcome, TokenBucketRequest,
};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, RedisResult, Script};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Redis-backed coordination store
///
/// Every primitive is a single command or a single Lua script, so Redis
/// executes it atomically. Each round-trip is bounded by the configured
/// operation timeout.
#[derive(Clone)]
pub struct RedisStore {
    /// Redis connection manager (reconnects transparently)
    connection: ConnectionManager,
    /// Upper bound for one round-trip
    operation_timeout: Duration,
    scripts: Arc<Scripts>,
}

struct Scripts {
    token_bucket: Script,
    sliding_window: Script,
    incr_with_expiry: Script,
    compare_and_delete: Script,
    compare_and_set_ttl: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            token_bucket: Script::new(TOKEN_BUCKET_SCRIPT),
            sliding_window: Script::new(SLIDING_WINDOW_SCRIPT),
            incr_with_expiry: Script::new(INCR_WITH_EXPIRY_SCRIPT),
            compare_and_delete: Script::new(COMPARE_AND_DELETE_SCRIPT),
            compare_and_set_ttl: Script::new(COMPARE_AND_SET_TTL_SCRIPT),
        }
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("operation_timeout", &self.operation_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis at `redis_url`
    pub async fn connect(redis_url: &str, operation_timeout: Duration) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let connection = tokio::time::timeout(operation_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(operation_timeout))??;

        Ok(Self {
            connection,
            operation_timeout,
            scripts: Arc::new(Scripts::load()),
        })
    }

    /// Run one round-trip under the operation timeout
    async fn bounded<T, F>(&self, operation: &str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                error!(operation, error = %e, "Redis command failed");
                Err(StoreError::Redis(e))
            }
            Err(_) => {
                error!(operation, timeout = ?self.operation_timeout, "Redis command timed out");
                Err(StoreError::Timeout(self.operation_timeout))
            }
        }
    }
}

fn millis(duration: Duration) -> u64 {
    // PX / PEXPIRE reject 0
    (duration.as_millis() as u64).max(1)
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection.clone();
        self.bounded(
            "GET",
            redis::cmd("GET")
                .arg(key)
                .query_async::<_, Option<String>>(&mut conn),
        )
        .await
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        only_if_absent: bool,
    ) -> StoreResult<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        if only_if_absent {
            cmd.arg("NX");
        }

        let mut conn = self.connection.clone();
        // SET replies OK on success and nil when NX prevented the write
        let reply = self
            .bounded("SET", cmd.query_async::<_, Option<String>>(&mut conn))
            .await?;
        debug!(key, only_if_absent, written = reply.is_some(), "SET");
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.connection.clone();
        let deleted = self
            .bounded(
                "COMPARE_AND_DELETE",
                self.scripts
                    .compare_and_delete
                    .key(key)
                    .arg(expected)
                    .invoke_async::<_, i64>(&mut conn),
            )
            .await?;
        Ok(deleted == 1)
    }

    async fn compare_and_set_ttl(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut conn = self.connection.clone();
        let updated = self
            .bounded(
                "COMPARE_AND_SET_TTL",
                self.scripts
                    .compare_and_set_ttl
                    .key(key)
                    .arg(expected)
                    .arg(millis(ttl))
                    .invoke_async::<_, i64>(&mut conn),
            )
            .await?;
        Ok(updated == 1)
    }

    async fn incr_with_expiry(
        &self,
        key: &str,
        amount: i64,
        ttl_if_new: Duration,
    ) -> StoreResult<i64> {
        let mut conn = self.connection.clone();
        self.bounded(
            "INCR_WITH_EXPIRY",
            self.scripts
                .incr_with_expiry
                .key(key)
                .arg(amount)
                .arg(millis(ttl_if_new))
                .invoke_async::<_, i64>(&mut conn),
        )
        .await
    }

    async fn token_bucket(
        &self,
        key: &str,
        request: &TokenBucketRequest,
    ) -> StoreResult<TokenBucketOutcome> {
        let mut conn = self.connection.clone();
        let (allowed, tokens, retry_after_ms) = self
            .bounded(
                "TOKEN_BUCKET",
                self.scripts
                    .token_bucket
                    .key(key)
                    .arg(request.capacity)
                    .arg(request.refill_per_sec)
                    .arg(request.now_ms)
                    .arg(millis(request.idle_ttl))
                    .invoke_async::<_, (i64, String, i64)>(&mut conn),
            )
            .await?;

        let tokens = tokens.parse::<f64>().map_err(|e| StoreError::Corrupted {
            key: key.to_string(),
            reason: format!("token count '{}' is not a number: {}", tokens, e),
        })?;

        Ok(TokenBucketOutcome {
            allowed: allowed == 1,
            tokens,
            retry_after: Duration::from_millis(retry_after_ms.max(0) as u64),
        })
    }

    async fn sliding_window_log(
        &self,
        key: &str,
        request: &SlidingWindowRequest,
    ) -> StoreResult<SlidingWindowOutcome> {
        let mut conn = self.connection.clone();
        let (allowed, count, retry_after_ms) = self
            .bounded(
                "SLIDING_WINDOW_LOG",
                self.scripts
                    .sliding_window
                    .key(key)
                    .arg(request.limit)
                    .arg(millis(request.window))
                    .arg(request.now_ms)
                    .arg(&request.member)
                    .invoke_async::<_, (i64, i64, i64)>(&mut conn),
            )
            .await?;

        Ok(SlidingWindowOutcome {
            allowed: allowed == 1,
            count: count.max(0) as u64,
            retry_after: Duration::from_millis(retry_after_ms.max(0) as u64),
        })
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        self.bounded(
            "PING",
            redis::cmd("PING").query_async::<_, String>(&mut conn),
        )
        .await
        .map(|_| ())
    }
}
