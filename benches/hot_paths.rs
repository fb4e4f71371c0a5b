//! Benchmarks for the per-call hot paths
//!
//! This benchmark measures:
//! - Token-bucket admission
//! - Circuit breaker overhead around an immediately ready call
//! - Percentile math over a full latency window
//! - Queue admission with and without deduplication keys

use backend_orchestrator::queue::{EnqueueOptions, Priority, QueueConfig, QueueManager};
use backend_orchestrator::resilience::{
    CircuitBreakerConfig, CircuitBreakerCoordinator, RateLimitConfig, RateLimiter,
};
use backend_orchestrator::utils::LatencyPercentiles;
use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use serde_json::json;

fn bench_rate_limiter(c: &mut Criterion) {
    let limiter = RateLimiter::new();
    limiter
        .configure(
            "bench",
            RateLimitConfig::new()
                .with_max_tokens(u32::MAX)
                .with_refill_rate(1_000_000.0),
        )
        .unwrap();

    let mut group = c.benchmark_group("rate_limiter");
    group.bench_function("try_consume_configured", |b| {
        b.iter(|| black_box(limiter.try_consume(black_box("bench"), 1)))
    });
    group.bench_function("try_consume_unlimited", |b| {
        b.iter(|| black_box(limiter.try_consume(black_box("unconfigured"), 1)))
    });
    group.finish();
}

fn bench_circuit_execute(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let breaker = CircuitBreakerCoordinator::new(CircuitBreakerConfig::default());

    let mut group = c.benchmark_group("circuit_breaker");
    group.bench_function("execute_closed", |b| {
        b.to_async(&rt).iter(|| async {
            let v: u32 = breaker
                .execute("bench", "op", || async { Ok(1u32) }, None)
                .await
                .unwrap();
            black_box(v)
        })
    });

    breaker.force_open("open");
    group.bench_function("reject_open", |b| {
        b.to_async(&rt).iter(|| async {
            let r = breaker
                .execute::<u32, _, _>("open", "op", || async { Ok(1u32) }, None)
                .await;
            black_box(r.is_err())
        })
    });
    group.finish();
}

fn bench_percentiles(c: &mut Criterion) {
    let mut group = c.benchmark_group("percentiles");
    for size in [100usize, 1_000, 10_000] {
        let samples: Vec<f64> = (0..size).map(|i| ((i * 7919) % size) as f64).collect();
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("from_samples", size), &samples, |b, s| {
            b.iter(|| black_box(LatencyPercentiles::from_samples(black_box(s.iter()))))
        });
    }
    group.finish();
}

fn bench_enqueue(c: &mut Criterion) {
    let config = QueueConfig::default().with_max_size(100_000);

    let mut group = c.benchmark_group("queue_enqueue");
    group.throughput(Throughput::Elements(100));
    group.bench_function("mixed_priorities", |b| {
        b.iter_batched(
            || QueueManager::new(config.clone()),
            |queue| {
                for i in 0..100u32 {
                    let priority = Priority::ALL[(i % 4) as usize];
                    queue
                        .enqueue(
                            "bench",
                            "op",
                            json!({ "i": i }),
                            EnqueueOptions::new().with_priority(priority),
                        )
                        .unwrap();
                }
                queue
            },
            BatchSize::SmallInput,
        )
    });
    group.bench_function("deduplicated", |b| {
        b.iter_batched(
            || QueueManager::new(config.clone()),
            |queue| {
                for i in 0..100u32 {
                    let key = format!("k{}", i % 10);
                    queue
                        .enqueue(
                            "bench",
                            "op",
                            json!(null),
                            EnqueueOptions::new().with_deduplication_key(key),
                        )
                        .unwrap();
                }
                queue
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_rate_limiter,
    bench_circuit_execute,
    bench_percentiles,
    bench_enqueue,
);
criterion_main!(benches);
