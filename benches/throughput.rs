use circuitbreaker_facade::{
    BreakerOptions, BreakerRegistry, CircuitBreaker, FallbackMethods, Interceptor,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

struct Catalog;

impl FallbackMethods<u64, u64, io::Error> for Catalog {}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("benchmark runtime")
}

fn bench_breaker_closed(c: &mut Criterion) {
    let rt = runtime();
    let breaker = CircuitBreaker::builder()
        .name("bench")
        .build(|n: u64| async move { Ok::<_, io::Error>(n) });

    c.bench_function("breaker_fire_closed", |b| {
        b.iter(|| rt.block_on(breaker.fire(black_box(7))))
    });
}

fn bench_breaker_open(c: &mut Criterion) {
    let rt = runtime();
    let breaker = CircuitBreaker::builder()
        .name("bench_open")
        .reset_timeout(Duration::from_secs(3600))
        .build(|n: u64| async move { Ok::<_, io::Error>(n) });
    breaker.force_open();

    c.bench_function("breaker_fire_rejected", |b| {
        b.iter(|| rt.block_on(breaker.fire(black_box(7))))
    });
}

fn bench_breaker_cached(c: &mut Criterion) {
    let rt = runtime();
    let breaker = CircuitBreaker::builder()
        .name("bench_cached")
        .options(BreakerOptions::new().cache(Duration::ZERO))
        .cache_key(|n: &u64| n.to_string())
        .build(|n: u64| async move { Ok::<_, io::Error>(n) });

    c.bench_function("breaker_fire_cache_hit", |b| {
        b.iter(|| rt.block_on(breaker.fire(black_box(7))))
    });
}

fn bench_interceptor_warm(c: &mut Criterion) {
    let rt = runtime();
    let registry = Arc::new(BreakerRegistry::new());
    let lookup = Interceptor::<Catalog, u64, u64, io::Error>::builder(registry, "lookup")
        .target(|_catalog, id| async move { Ok(id) })
        .build()
        .expect("interceptor");
    let catalog = Arc::new(Catalog);

    // First call creates the breaker; the loop measures registry hits
    rt.block_on(lookup.invoke(&catalog, 1)).expect("warm-up call");

    c.bench_function("interceptor_invoke_registered", |b| {
        b.iter(|| rt.block_on(lookup.invoke(&catalog, black_box(7))))
    });
}

fn bench_interceptor_computed_options(c: &mut Criterion) {
    let rt = runtime();
    let registry = Arc::new(BreakerRegistry::new());
    let lookup = Interceptor::<Catalog, u64, u64, io::Error>::builder(registry, "lookup")
        .options_with(|_catalog| BreakerOptions::new().timeout(Duration::from_millis(250)))
        .target(|_catalog, id| async move { Ok(id) })
        .build()
        .expect("interceptor");
    let catalog = Arc::new(Catalog);

    c.bench_function("interceptor_invoke_computed_options", |b| {
        b.iter(|| rt.block_on(lookup.invoke(&catalog, black_box(7))))
    });
}

criterion_group!(
    benches,
    bench_breaker_closed,
    bench_breaker_open,
    bench_breaker_cached,
    bench_interceptor_warm,
    bench_interceptor_computed_options
);
criterion_main!(benches);
