//! Tests against a live Redis, run with `cargo test -- --ignored`
//! (uses `REDIS_URL`, default `redis://127.0.0.1:6379`)

use gatekeeper::lock::{DistributedLock, LockConfig};
use gatekeeper::rate_limit::{RateLimitConfig, RateLimiter};
use gatekeeper::store::RedisStore;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn redis_store() -> Arc<RedisStore> {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let store = RedisStore::connect(&url, Duration::from_millis(500))
        .await
        .expect("Redis not reachable");
    Arc::new(store)
}

/// Key prefix unique to one test run
fn unique_prefix(name: &str) -> String {
    let suffix: u64 = rand::thread_rng().gen();
    format!("gatekeeper-test:{}:{:x}", name, suffix)
}

#[tokio::test]
#[ignore]
async fn test_redis_token_bucket_limiter() {
    let store = redis_store().await;
    let config = RateLimitConfig::token_bucket(3, 1.0).with_key_prefix(unique_prefix("tb"));
    let limiter = RateLimiter::new(store, config).unwrap();
    let cancel = CancellationToken::new();

    for _ in 0..3 {
        assert!(limiter.allow("user:1", &cancel).await.unwrap().allowed);
    }
    let denied = limiter.allow("user:1", &cancel).await.unwrap();
    assert!(!denied.allowed);
    assert!(denied.retry_after > Duration::ZERO);
    assert!(denied.retry_after <= Duration::from_secs(1));
}

#[tokio::test]
#[ignore]
async fn test_redis_sliding_window_limiter_is_shared() {
    let store = redis_store().await;
    let config = RateLimitConfig::sliding_window_log(5, 10).with_key_prefix(unique_prefix("sw"));
    let first = RateLimiter::new(store.clone(), config.clone()).unwrap();
    let second = RateLimiter::new(store, config).unwrap();
    let cancel = CancellationToken::new();

    let calls = (0..12).map(|i| {
        let limiter = if i % 2 == 0 { &first } else { &second };
        let cancel = &cancel;
        async move { limiter.allow("tenant", cancel).await.unwrap().allowed }
    });
    let allowed = futures::future::join_all(calls)
        .await
        .into_iter()
        .filter(|allowed| *allowed)
        .count();

    assert_eq!(allowed, 5);
}

#[tokio::test]
#[ignore]
async fn test_redis_lock_lifecycle() {
    let store = redis_store().await;
    let config = LockConfig {
        key_prefix: unique_prefix("lock"),
        ..Default::default()
    };
    let lock = DistributedLock::new(store, config).unwrap();
    let cancel = CancellationToken::new();

    let mut handle = lock
        .acquire("job", Duration::from_secs(2), &cancel)
        .await
        .unwrap()
        .expect("lock should be free");
    assert!(lock
        .acquire("job", Duration::from_secs(2), &cancel)
        .await
        .unwrap()
        .is_none());

    assert!(lock
        .extend(&mut handle, Duration::from_secs(5), &cancel)
        .await
        .unwrap());
    assert!(lock.release(&handle, &cancel).await.unwrap());
    assert!(!lock.release(&handle, &cancel).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn test_redis_lock_expires() {
    let store = redis_store().await;
    let config = LockConfig {
        key_prefix: unique_prefix("expiry"),
        ..Default::default()
    };
    let lock = DistributedLock::new(store, config).unwrap();
    let cancel = CancellationToken::new();

    let stale = lock
        .acquire("job", Duration::from_millis(100), &cancel)
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    let current = lock
        .acquire("job", Duration::from_secs(5), &cancel)
        .await
        .unwrap()
        .expect("expired lock should be free");
    assert!(!lock.release(&stale, &cancel).await.unwrap());
    assert!(lock.release(&current, &cancel).await.unwrap());
}
