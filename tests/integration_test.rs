use gatekeeper::config::GatekeeperConfig;
use gatekeeper::error::CoordinationError;
use gatekeeper::lock::{DistributedLock, LockConfig};
use gatekeeper::observability::{Component, MemoryEventSink, Outcome};
use gatekeeper::rate_limit::{RateLimitConfig, RateLimiter};
use gatekeeper::retry::{RetryExecutor, RetryPolicy, TransientCoordinationErrors};
use gatekeeper::store::{self, CoordinationStore, InMemoryStore, StoreConfig};
use gatekeeper::time::{ManualTimeProvider, TimeProvider};
use gatekeeper::{CircuitBreakerRegistry, CircuitState};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const START_MS: u64 = 1_700_000_000_000;

/// Store and clock shared by every instance in a test, standing in for
/// several processes talking to one backend
fn shared_backend() -> (Arc<InMemoryStore>, Arc<ManualTimeProvider>) {
    let clock = Arc::new(ManualTimeProvider::new(START_MS));
    let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
    (store, clock)
}

fn limiter(
    store: &Arc<InMemoryStore>,
    clock: &Arc<ManualTimeProvider>,
    config: RateLimitConfig,
) -> RateLimiter<InMemoryStore> {
    RateLimiter::new(store.clone(), config)
        .unwrap()
        .with_clock(clock.clone())
}

#[tokio::test]
async fn test_token_bucket_burst_then_refill() {
    let (store, clock) = shared_backend();
    let limiter = limiter(&store, &clock, RateLimitConfig::token_bucket(5, 1.0));
    let cancel = CancellationToken::new();

    for i in 0..5 {
        let decision = limiter.allow("user:1", &cancel).await.unwrap();
        assert!(decision.allowed, "call {} should be allowed", i + 1);
        assert_eq!(decision.remaining, 4 - i);
    }

    let denied = limiter.allow("user:1", &cancel).await.unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after, Duration::from_secs(1));

    clock.advance(Duration::from_secs(1));
    assert!(limiter.allow("user:1", &cancel).await.unwrap().allowed);
    assert!(!limiter.allow("user:1", &cancel).await.unwrap().allowed);
}

#[tokio::test]
async fn test_sliding_window_has_no_boundary_burst() {
    let (store, clock) = shared_backend();
    let limiter = limiter(&store, &clock, RateLimitConfig::sliding_window_log(3, 1));
    let cancel = CancellationToken::new();

    for offset in [0, 250, 500] {
        clock.set_ms(START_MS + offset);
        assert!(limiter.allow("ip:10.0.0.1", &cancel).await.unwrap().allowed);
    }

    clock.set_ms(START_MS + 999);
    let denied = limiter.allow("ip:10.0.0.1", &cancel).await.unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after, Duration::from_millis(1));

    // The call at 0ms leaves the window; the one at 250ms is still in it
    clock.set_ms(START_MS + 1_000);
    assert!(limiter.allow("ip:10.0.0.1", &cancel).await.unwrap().allowed);
    assert!(!limiter.allow("ip:10.0.0.1", &cancel).await.unwrap().allowed);
}

#[tokio::test]
async fn test_fixed_window_resets_at_boundary() {
    let (store, clock) = shared_backend();
    let limiter = limiter(&store, &clock, RateLimitConfig::fixed_window(2, 10));
    let cancel = CancellationToken::new();

    clock.set_ms(START_MS + 4_000);
    assert!(limiter.allow("tenant:a", &cancel).await.unwrap().allowed);
    assert!(limiter.allow("tenant:a", &cancel).await.unwrap().allowed);

    let denied = limiter.allow("tenant:a", &cancel).await.unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after, Duration::from_secs(6));

    clock.set_ms(START_MS + 10_000);
    assert!(limiter.allow("tenant:a", &cancel).await.unwrap().allowed);
}

#[tokio::test]
async fn test_limiters_sharing_a_store_share_the_quota() {
    let (store, clock) = shared_backend();
    let config = RateLimitConfig::sliding_window_log(4, 60);
    let first = limiter(&store, &clock, config.clone());
    let second = limiter(&store, &clock, config);
    let cancel = CancellationToken::new();

    let calls = (0..10).map(|i| {
        let limiter = if i % 2 == 0 { &first } else { &second };
        let cancel = &cancel;
        async move { limiter.allow("api-key:42", cancel).await.unwrap().allowed }
    });
    let results = futures::future::join_all(calls).await;

    assert_eq!(results.iter().filter(|allowed| **allowed).count(), 4);
}

#[tokio::test]
async fn test_admit_surfaces_limit_exceeded() {
    let (store, clock) = shared_backend();
    let limiter = limiter(&store, &clock, RateLimitConfig::fixed_window(1, 1));
    let cancel = CancellationToken::new();

    limiter.admit("job:7", &cancel).await.unwrap();
    match limiter.admit("job:7", &cancel).await.unwrap_err() {
        CoordinationError::LimitExceeded {
            subject,
            retry_after,
        } => {
            assert_eq!(subject, "job:7");
            assert_eq!(retry_after, Duration::from_secs(1));
        }
        other => panic!("expected LimitExceeded, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lock_mutual_exclusion() {
    let (store, clock) = shared_backend();

    // Each task is a separate client racing for the same resource
    let attempts: Vec<_> = (0..10)
        .map(|_| {
            let lock = DistributedLock::new(store.clone(), LockConfig::default())
                .unwrap()
                .with_clock(clock.clone());
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let handle = lock
                    .acquire("reindex", Duration::from_secs(30), &cancel)
                    .await
                    .unwrap();
                (lock, handle)
            })
        })
        .collect();

    let mut holders = Vec::new();
    for attempt in futures::future::join_all(attempts).await {
        let (lock, handle) = attempt.unwrap();
        if let Some(handle) = handle {
            holders.push((lock, handle));
        }
    }
    assert_eq!(holders.len(), 1);

    // Released lock can be taken again by another client
    let cancel = CancellationToken::new();
    let (owner, handle) = holders.pop().unwrap();
    assert!(owner.release(&handle, &cancel).await.unwrap());

    let other = DistributedLock::new(store, LockConfig::default())
        .unwrap()
        .with_clock(clock);
    assert!(other
        .acquire("reindex", Duration::from_secs(30), &cancel)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_purge_task_bounds_fixed_window_keys() {
    let (store, clock) = shared_backend();
    let limiter = limiter(&store, &clock, RateLimitConfig::fixed_window(10, 1));
    let purge = store.spawn_purge_task(Duration::from_millis(5));
    let cancel = CancellationToken::new();

    // Every window writes a new key that is never read again
    for window in 1..=1_000 {
        assert!(limiter.allow("tenant:a", &cancel).await.unwrap().allowed);
        clock.advance(Duration::from_secs(1));

        if window % 100 == 0 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert!(store.len() <= 1, "{} keys after {} windows", store.len(), window);
        }
    }

    purge.cancel();
}

#[tokio::test]
async fn test_stale_holder_cannot_release_new_lock() {
    let (store, clock) = shared_backend();
    let sink = Arc::new(MemoryEventSink::new());
    let lock = DistributedLock::new(store, LockConfig::default())
        .unwrap()
        .with_clock(clock.clone())
        .with_event_sink(sink.clone());
    let cancel = CancellationToken::new();

    let stale = lock
        .acquire("migrations", Duration::from_millis(100), &cancel)
        .await
        .unwrap()
        .unwrap();

    clock.advance(Duration::from_millis(150));
    assert!(stale.is_expired(clock.now_ms()));

    let current = lock
        .acquire("migrations", Duration::from_secs(10), &cancel)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(stale.fencing_token(), current.fencing_token());

    // The expired holder neither releases nor extends the new owner's lock
    assert!(!lock.release(&stale, &cancel).await.unwrap());
    let mut stale = stale;
    assert!(!lock
        .extend(&mut stale, Duration::from_secs(10), &cancel)
        .await
        .unwrap());
    assert!(lock
        .acquire("migrations", Duration::from_secs(10), &cancel)
        .await
        .unwrap()
        .is_none());

    assert!(lock.release(&current, &cancel).await.unwrap());

    let outcomes = sink.outcomes(Component::DistributedLock);
    assert!(outcomes.contains(&Outcome::ReleaseRejected));
    assert!(outcomes.contains(&Outcome::ExtendRejected));
    assert_eq!(outcomes.last(), Some(&Outcome::Released));
}

#[tokio::test]
async fn test_retry_waits_out_rate_limit() {
    let store = Arc::new(InMemoryStore::new());
    let limiter = RateLimiter::new(store, RateLimitConfig::token_bucket(1, 20.0)).unwrap();
    let policy = RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 80,
        max_delay_ms: 200,
        jitter_fraction: 0.0,
    };
    let retry = RetryExecutor::new(policy)
        .unwrap()
        .with_classifier(TransientCoordinationErrors);
    let cancel = CancellationToken::new();

    limiter.admit("worker", &cancel).await.unwrap();

    // Second call is limited, the retry after 80ms finds a refilled token
    let decision = retry
        .run(|| limiter.admit("worker", &cancel), &cancel)
        .await
        .unwrap();
    assert!(decision.allowed);
}

#[tokio::test]
async fn test_limited_and_guarded_call() {
    let (store, clock) = shared_backend();
    let limiter = limiter(&store, &clock, RateLimitConfig::fixed_window(3, 60));
    let registry = CircuitBreakerRegistry::new(Default::default())
        .unwrap()
        .with_clock(clock.clone());
    let cancel = CancellationToken::new();

    let mut served = 0;
    for _ in 0..5 {
        if !limiter.allow("partner", &cancel).await.unwrap().allowed {
            continue;
        }
        let response = registry
            .execute("partner-api", || async { Ok::<_, String>("200 OK") }, &cancel)
            .await
            .unwrap();
        assert_eq!(response, "200 OK");
        served += 1;
    }

    assert_eq!(served, 3);
    assert_eq!(registry.state("partner-api"), CircuitState::Closed);
    assert_eq!(
        registry.metrics("partner-api").unwrap().successful_requests,
        3
    );
}

#[tokio::test]
async fn test_components_from_config() {
    let yaml = r#"
rate_limiters:
  search:
    algorithm: fixed_window
    limit: 1
    window_secs: 60
lock:
  key_prefix: "jobs:lock"
"#;
    let config = GatekeeperConfig::from_yaml(yaml).unwrap();
    config.validate().unwrap();

    let store: Arc<dyn CoordinationStore> = store::connect(&StoreConfig::default()).await.unwrap();
    store.ping().await.unwrap();

    let limiter = config.rate_limiter("search", store.clone()).unwrap();
    let lock = config.distributed_lock(store).unwrap();
    let cancel = CancellationToken::new();

    assert!(limiter.allow("q", &cancel).await.unwrap().allowed);
    assert!(!limiter.allow("q", &cancel).await.unwrap().allowed);

    let handle = lock
        .acquire("nightly", lock.config().default_ttl(), &cancel)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(handle.key(), "jobs:lock:nightly");
}
