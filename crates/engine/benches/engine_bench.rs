//! Engine hot-path benchmarks
//!
//! Covers the paths every unit of work crosses: retry bookkeeping without
//! sleeps, permit acquisition and release, backoff arithmetic, poll interval
//! adaptation and observer fan-out.
//!
//! Run with: `cargo bench --bench engine_bench -p backstop-engine`

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

use backstop_engine::admission::{AdmissionConfig, AdmissionController};
use backstop_engine::poller::{CycleKind, ObserverRegistry, PollConfig, PollState};
use backstop_engine::retry::{policies, RetryConfig, RetryExecutor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Builder as RuntimeBuilder;

fn build_runtime() -> tokio::runtime::Runtime {
    RuntimeBuilder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime should build for benchmarks")
}

#[derive(Debug, Clone)]
struct BenchError(&'static str);

impl Display for BenchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for BenchError {}

// ============================================================================
// Retry Benchmarks
// ============================================================================

fn bench_retry_executor(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_executor");
    let runtime = build_runtime();

    group.bench_function("immediate_success", |b| {
        let config = RetryConfig::builder()
            .max_attempts(3)
            .no_jitter()
            .build()
            .expect("retry config should build for immediate success");
        let executor = &RetryExecutor::new(config, policies::AlwaysRetry)
            .expect("retry executor should build for benchmarks");

        b.to_async(&runtime).iter(|| async move {
            let result = executor.execute(|| async { Ok::<_, BenchError>(()) }).await;
            if let Err(err) = result {
                panic!("retry immediate success failed: {err:?}");
            }
        });
    });

    group.bench_function("client_error_short_circuit", |b| {
        let config = RetryConfig::builder()
            .max_attempts(3)
            .no_jitter()
            .build()
            .expect("retry config should build for client errors");
        let executor = &RetryExecutor::new(config, policies::NeverRetry)
            .expect("retry executor should build for benchmarks");

        b.to_async(&runtime).iter(|| async move {
            let result =
                executor.execute(|| async { Err::<(), _>(BenchError("bad request")) }).await;
            let _result = black_box(result);
        });
    });

    group.finish();
}

fn bench_backoff_delay(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff_delay");
    let attempts = [0u32, 1, 5, 10, 40];

    let configs = [
        ("uncapped", RetryConfig::builder().no_jitter().build()),
        ("capped", RetryConfig::builder().no_jitter().max_delay(Duration::from_secs(30)).build()),
        ("jittered", RetryConfig::builder().jitter_max(Duration::from_millis(500)).build()),
    ];

    for (name, config) in configs {
        let config = config.expect("retry config should build for backoff benchmarks");
        group.bench_with_input(BenchmarkId::new("delay_for", name), &config, |b, config| {
            b.iter(|| {
                for attempt in attempts {
                    black_box(config.delay_for(attempt));
                }
            });
        });
    }

    group.finish();
}

// ============================================================================
// Admission Benchmarks
// ============================================================================

fn bench_admission(c: &mut Criterion) {
    let mut group = c.benchmark_group("admission");
    let runtime = build_runtime();

    group.bench_function("try_acquire_release", |b| {
        let config = AdmissionConfig::builder()
            .concurrency_limit(64)
            .rate_limit_per_second(1e9)
            .bucket_capacity(u32::MAX)
            .build()
            .expect("admission config should build for benchmarks");
        let admission = AdmissionController::new(config)
            .expect("admission controller should build for benchmarks");

        b.iter(|| {
            let permit = admission.try_acquire();
            black_box(&permit);
        });
    });

    group.bench_function("acquire_release_async", |b| {
        let config = AdmissionConfig::builder()
            .concurrency_limit(64)
            .rate_limit_per_second(1e9)
            .bucket_capacity(u32::MAX)
            .build()
            .expect("admission config should build for benchmarks");
        let admission = &AdmissionController::new(config)
            .expect("admission controller should build for benchmarks");

        b.to_async(&runtime).iter(|| async move {
            let permit = admission.acquire().await;
            black_box(permit.id());
        });
    });

    group.bench_function("snapshot", |b| {
        let admission = AdmissionController::with_defaults();
        b.iter(|| black_box(admission.snapshot()));
    });

    group.finish();
}

// ============================================================================
// Poller Benchmarks
// ============================================================================

fn bench_poll_state(c: &mut Criterion) {
    let mut group = c.benchmark_group("poll_state");
    let config = PollConfig::default();
    let cycles = [
        CycleKind::Unchanged,
        CycleKind::Unchanged,
        CycleKind::Failed,
        CycleKind::Changed,
        CycleKind::Unchanged,
    ];

    group.bench_function("apply_cycle_mix", |b| {
        let mut state = PollState::new(&config);
        b.iter(|| {
            for kind in cycles {
                black_box(state.apply(kind, &config));
            }
        });
    });

    for observers in [1usize, 8, 64] {
        let registry: ObserverRegistry<u64> = ObserverRegistry::new();
        for index in 0..observers {
            registry.register(format!("observer-{index}"), |value: &u64| {
                black_box(value);
                Ok(())
            });
        }
        group.bench_with_input(
            BenchmarkId::new("notify_all", observers),
            &registry,
            |b, registry| {
                b.iter(|| black_box(registry.notify_all(&42)));
            },
        );
    }

    group.finish();
}

criterion_group!(
    engine,
    bench_retry_executor,
    bench_backoff_delay,
    bench_admission,
    bench_poll_state
);
criterion_main!(engine);
