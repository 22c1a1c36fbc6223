use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use tollgate::algorithm::token_bucket;
use tollgate::prelude::*;
use tollgate::{BucketLimits, BucketState};

fn limiter() -> RateLimiterService {
    let registry = RuleRegistry::builder()
        .rule("hot", RateLimitRule::token_bucket(u32::MAX, 1_000_000.0, Scope::Origin).unwrap())
        .rule("tight", RateLimitRule::token_bucket(1, 0.001, Scope::Origin).unwrap())
        .build()
        .unwrap();
    RateLimiterService::builder().registry(registry).build().unwrap()
}

fn bench_bucket_math(c: &mut Criterion) {
    let limits = BucketLimits::new(100, 10.0);
    let state = BucketState { tokens: 42.5, last_refill: 1_000.0 };
    c.bench_function("token_bucket_apply", |b| {
        b.iter(|| token_bucket::apply(black_box(Some(state)), limits, 1, black_box(1_000.25)))
    });
}

fn bench_admission(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    let svc = limiter();

    c.bench_function("is_allowed_admit_memory", |b| {
        b.to_async(&rt).iter(|| {
            let svc = svc.clone();
            async move { black_box(svc.is_allowed("hot", "origin:10.0.0.1", 1).await) }
        })
    });

    c.bench_function("is_allowed_deny_memory", |b| {
        b.to_async(&rt).iter(|| {
            let svc = svc.clone();
            async move { black_box(svc.is_allowed("tight", "origin:10.0.0.1", 1).await) }
        })
    });

    c.bench_function("is_allowed_unrated", |b| {
        b.to_async(&rt).iter(|| {
            let svc = svc.clone();
            async move { black_box(svc.is_allowed("unmapped", "origin:10.0.0.1", 1).await) }
        })
    });
}

fn bench_many_keys(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    let svc = limiter();
    let identities: Arc<Vec<String>> = Arc::new((0..1024).map(|i| format!("origin:10.0.{}.{}", i / 256, i % 256)).collect());
    let mut next = 0usize;

    c.bench_function("is_allowed_1024_keys", |b| {
        b.to_async(&rt).iter(|| {
            next = (next + 1) % identities.len();
            let svc = svc.clone();
            let identities = Arc::clone(&identities);
            let i = next;
            async move { black_box(svc.is_allowed("hot", &identities[i], 1).await) }
        })
    });
}

criterion_group!(benches, bench_bucket_math, bench_admission, bench_many_keys);
criterion_main!(benches);
