use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use gatekeeper::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use gatekeeper::config::GatekeeperConfig;
use gatekeeper::rate_limit::{RateLimitConfig, RateLimiter};
use gatekeeper::store::InMemoryStore;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

fn runtime() -> Runtime {
    Runtime::new().expect("Failed to create runtime")
}

fn benchmark_rate_limit_algorithms(c: &mut Criterion) {
    let rt = runtime();
    let cancel = CancellationToken::new();
    let mut group = c.benchmark_group("rate_limit_allow");

    let configs = [
        ("fixed_window", RateLimitConfig::fixed_window(1_000_000, 60)),
        (
            "sliding_window_log",
            RateLimitConfig::sliding_window_log(1_000, 1),
        ),
        ("token_bucket", RateLimitConfig::token_bucket(1_000, 1_000.0)),
    ];

    for (name, config) in configs {
        let limiter = RateLimiter::new(Arc::new(InMemoryStore::new()), config)
            .expect("Failed to create limiter");

        let limiter = &limiter;
        let cancel = &cancel;
        group.bench_function(BenchmarkId::from_parameter(name), |b| {
            b.to_async(&rt)
                .iter(move || async move { black_box(limiter.allow("bench:user", cancel).await) })
        });
    }
    group.finish();
}

fn benchmark_rate_limit_subjects(c: &mut Criterion) {
    let rt = runtime();
    let cancel = CancellationToken::new();
    let mut group = c.benchmark_group("rate_limit_subjects");

    for num_subjects in [10usize, 1_000, 10_000].iter() {
        let limiter = RateLimiter::new(
            Arc::new(InMemoryStore::new()),
            RateLimitConfig::token_bucket(100, 100.0),
        )
        .expect("Failed to create limiter");
        let subjects: Vec<String> = (0..*num_subjects).map(|i| format!("user:{}", i)).collect();

        group.bench_with_input(
            BenchmarkId::from_parameter(num_subjects),
            &subjects,
            |b, subjects| {
                let limiter = &limiter;
                let cancel = &cancel;
                let mut next = 0;
                b.to_async(&rt).iter(move || {
                    next = (next + 1) % subjects.len();
                    let subject = subjects[next].as_str();
                    async move { black_box(limiter.allow(subject, cancel).await) }
                })
            },
        );
    }
    group.finish();
}

fn benchmark_circuit_breaker_closed(c: &mut Criterion) {
    let rt = runtime();
    let cancel = CancellationToken::new();
    let breaker = CircuitBreaker::new("bench", CircuitBreakerConfig::default())
        .expect("Failed to create breaker");

    let breaker = &breaker;
    let cancel = &cancel;

    c.bench_function("circuit_breaker_closed", |b| {
        b.to_async(&rt).iter(move || async move {
            black_box(
                breaker
                    .execute(|| async { Ok::<_, String>(42) }, cancel)
                    .await,
            )
        })
    });
}

fn benchmark_config_parsing(c: &mut Criterion) {
    let yaml = r#"
rate_limiters:
  api:
    algorithm: token_bucket
    limit: 100
    window_secs: 1
    refill_rate_per_second: 50.0
circuit_breakers:
  payments:
    failure_threshold: 3
retry_policies:
  default:
    max_attempts: 4
"#;

    c.bench_function("config_parsing", |b| {
        b.iter(|| black_box(GatekeeperConfig::from_yaml(yaml)))
    });
}

criterion_group!(
    benches,
    benchmark_rate_limit_algorithms,
    benchmark_rate_limit_subjects,
    benchmark_circuit_breaker_closed,
    benchmark_config_parsing
);
criterion_main!(benches);
