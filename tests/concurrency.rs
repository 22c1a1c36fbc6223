mod common;

use common::test_helpers::{limiter, rule, T0_MILLIS};
use tollgate::prelude::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_burst_on_one_key_admits_exactly_capacity() {
    let clock = ManualClock::new(T0_MILLIS);
    let svc = limiter(&clock, &[("upload", rule(25, 0.001, Scope::Principal))]);

    let mut handles = Vec::new();
    for _ in 0..500 {
        let svc = svc.clone();
        handles.push(tokio::spawn(async move { svc.is_allowed("upload", "principal:u1", 1).await }));
    }
    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap().is_allowed() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 25);

    let stats = svc.stats();
    assert_eq!(stats.admitted, 25);
    assert_eq!(stats.throttled, 475);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_bursts_on_distinct_keys_do_not_interfere() {
    let clock = ManualClock::new(T0_MILLIS);
    let svc = limiter(&clock, &[("search", rule(5, 0.001, Scope::Origin))]);

    let mut handles = Vec::new();
    for identity in 0..20 {
        for _ in 0..10 {
            let svc = svc.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("origin:10.0.0.{identity}");
                (identity, svc.is_allowed("search", &id, 1).await.is_allowed())
            }));
        }
    }
    let mut per_identity = [0u32; 20];
    for handle in handles {
        let (identity, allowed) = handle.await.unwrap();
        if allowed {
            per_identity[identity] += 1;
        }
    }
    assert!(per_identity.iter().all(|n| *n == 5), "{per_identity:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reload_during_traffic_never_sees_partial_registry() {
    let clock = ManualClock::new(T0_MILLIS);
    let svc = limiter(&clock, &[("a", rule(1_000, 1.0, Scope::Origin)), ("b", rule(1_000, 1.0, Scope::Origin))]);

    let reader = {
        let svc = svc.clone();
        tokio::spawn(async move {
            for _ in 0..2_000 {
                let a = svc.rule_for("a").map(|r| r.capacity());
                let b = svc.rule_for("b").map(|r| r.capacity());
                // Both rules are always swapped together; a snapshot never mixes.
                assert!(a.is_some() && b.is_some());
                tokio::task::yield_now().await;
            }
        })
    };

    for capacity in 1..200u32 {
        let next = RuleRegistry::builder()
            .rule("a", rule(capacity, 1.0, Scope::Origin))
            .rule("b", rule(capacity, 1.0, Scope::Origin))
            .build()
            .unwrap();
        svc.reload(next).unwrap();
        tokio::task::yield_now().await;
    }
    reader.await.unwrap();
    assert_eq!(svc.rule_for("a").unwrap().capacity(), 199);
}
