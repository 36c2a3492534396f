use std::hint::black_box;
use std::time::Duration;

use criterion::BenchmarkGroup;
use criterion::Criterion;
use criterion::criterion_group;
use criterion::criterion_main;
use criterion::measurement::WallTime;
use futures::stream::FuturesUnordered;
use futures::stream::StreamExt;
use http::Request;
use http::Response;
use moat_keeper::Context;
use moat_keeper::MoatKeeper;
use moat_keeper::MoatLayer;
use moat_keeper::ResourceId;
use moat_keeper::config::ConcurrentLimitConfig;
use moat_keeper::config::RateLimitConfig;
use moat_keeper::config::ResourceConfig;
use moat_limit::breaker::BreakerConfig;
use tower::BoxError;
use tower::Service;
use tower::ServiceBuilder;
use tower::ServiceExt;
use tower::limit::ConcurrencyLimitLayer;
use tower::service_fn;
use tower::util::BoxCloneSyncService;

// --- HELPERS & TYPES ---

type BenchService = BoxCloneSyncService<Request<String>, Response<String>, BoxError>;

async fn noop_handler(_req: Request<String>) -> Result<Response<String>, BoxError> {
    Ok(Response::new("ok".to_string()))
}

/// Generic runner for single-call overhead benchmarks
fn bench_overhead(
    group: &mut BenchmarkGroup<WallTime>,
    rt: &tokio::runtime::Runtime,
    id: &str,
    svc: BenchService,
) {
    group.bench_function(id, |b| {
        b.to_async(rt).iter(|| {
            let mut s = svc.clone();
            async move {
                let req = Request::builder().body("test".to_string()).unwrap();
                let res = s.ready().await.unwrap().call(req).await;
                black_box(res)
            }
        });
    });
}

/// Generic runner for burst/contention benchmarks
fn bench_burst(
    group: &mut BenchmarkGroup<WallTime>,
    rt: &tokio::runtime::Runtime,
    id: &str,
    svc: BenchService,
    burst_size: usize,
) {
    group.bench_function(id, |b| {
        b.to_async(rt).iter(|| {
            let s = svc.clone();
            async move {
                let mut futures = FuturesUnordered::new();
                for _ in 0..burst_size {
                    let mut local_svc = s.clone();
                    futures.push(async move {
                        let req = Request::builder().body("test".to_string()).unwrap();
                        local_svc.ready().await.unwrap().call(req).await
                    });
                }
                while let Some(res) = futures.next().await {
                    let _ = black_box(res);
                }
            }
        });
    });
}

// --- MAIN BENCHMARK ---

fn bench_all_scenarios(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(8)
        .enable_all()
        .build()
        .unwrap();
    let _guard = rt.enter();

    let limit = 100_000;
    let period = Duration::from_millis(1);
    let burst_size = 1000;

    // 1. Setup Shared Keeper
    // Limits are far above the offered load so we measure the pipeline,
    // not the rejections.
    let concurrent = ResourceId::method("concurrent");
    let rate = ResourceId::method("rate");
    let full = ResourceId::method("full");
    let keeper = MoatKeeper::builder()
        .baseline(
            concurrent.clone(),
            ResourceConfig::new().with_concurrent(ConcurrentLimitConfig::new(limit)),
        )
        .baseline(
            rate.clone(),
            ResourceConfig::new().with_rate(RateLimitConfig::new(limit, period)),
        )
        .baseline(
            full.clone(),
            ResourceConfig::new()
                .with_concurrent(ConcurrentLimitConfig::new(limit))
                .with_breaker(BreakerConfig::default())
                .with_rate(RateLimitConfig::new(limit, period)),
        )
        .build()
        .unwrap();

    // 2. Define Scenarios (ID, Service)
    let moat = |id: &ResourceId| {
        BoxCloneSyncService::new(
            ServiceBuilder::new()
                .layer(MoatLayer::new(keeper.clone(), id.clone()))
                .service(service_fn(noop_handler)),
        )
    };
    let scenarios: Vec<(&str, BenchService)> = vec![
        ("no_moat", BoxCloneSyncService::new(service_fn(noop_handler))),
        (
            "tower_concurrency_limit",
            BoxCloneSyncService::new(
                ServiceBuilder::new()
                    .buffer(1_024)
                    .layer(ConcurrencyLimitLayer::new(limit))
                    .service(service_fn(noop_handler)),
            ),
        ),
        ("moat_concurrent", moat(&concurrent)),
        ("moat_rate", moat(&rate)),
        ("moat_full", moat(&full)),
    ];

    // 3. Run Overhead Group
    let mut overhead_group = c.benchmark_group("Middleware Overhead");
    for (id, svc) in &scenarios {
        bench_overhead(&mut overhead_group, &rt, id, svc.clone());
    }
    overhead_group.finish();

    // 4. Run Contention Group
    let mut contention_group = c.benchmark_group("High Contention (1000 Tasks)");
    for (id, svc) in &scenarios {
        bench_burst(&mut contention_group, &rt, id, svc.clone(), burst_size);
    }
    contention_group.finish();

    // 5. Run Synchronous Facade Group
    let mut execute_group = c.benchmark_group("Synchronous Execute");
    execute_group.bench_function("moat_full", |b| {
        b.iter(|| {
            black_box(keeper.execute(Context::new(full.clone()), || Ok::<_, BoxError>(())))
        });
    });
    execute_group.finish();
}

criterion_group!(benches, bench_all_scenarios);
criterion_main!(benches);
