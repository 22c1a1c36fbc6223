mod common;

use common::test_helpers::{capture_logs, limiter_on, logs, rule, FailingStorage, HangingStorage};
use std::sync::Arc;
use std::time::Duration;
use tollgate::prelude::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn thousand_concurrent_calls_all_admitted_when_storage_fails() {
    let svc = limiter_on(Arc::new(FailingStorage), &[("login", rule(1, 1.0, Scope::Origin))]);

    let mut handles = Vec::with_capacity(1000);
    for i in 0..1000 {
        let svc = svc.clone();
        handles.push(tokio::spawn(async move {
            svc.is_allowed("login", &format!("origin:{}", i % 3), 1).await
        }));
    }
    for handle in handles {
        let admission = handle.await.unwrap();
        assert!(admission.is_allowed());
        assert_eq!(admission.basis, AdmissionBasis::FailedOpen);
        assert_eq!(admission.retry_after(), 0.0);
    }
    assert_eq!(svc.stats().failed_open, 1000);
}

#[tokio::test(start_paused = true)]
async fn slow_storage_times_out_and_fails_open() {
    let svc = limiter_on(Arc::new(HangingStorage), &[("login", rule(1, 1.0, Scope::Origin))]);

    let started = tokio::time::Instant::now();
    let admission = svc.is_allowed("login", "origin:A", 1).await;
    assert!(admission.is_allowed());
    assert_eq!(admission.basis, AdmissionBasis::FailedOpen);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn storage_failure_is_logged_at_error() {
    let (buffer, _guard) = capture_logs();
    let svc = limiter_on(Arc::new(FailingStorage), &[("login", rule(1, 1.0, Scope::Origin))]);

    assert!(svc.is_allowed("login", "origin:A", 1).await.is_allowed());

    let out = logs(&buffer);
    assert!(out.contains("ERROR"), "logs: {out}");
    assert!(out.contains("tollgate::service"), "logs: {out}");
    assert!(out.contains("connection refused"), "logs: {out}");
}

#[tokio::test]
async fn administrative_calls_surface_storage_errors() {
    let svc = limiter_on(Arc::new(FailingStorage), &[("login", rule(1, 1.0, Scope::Origin))]);

    let err = svc.peek("login", "origin:A").await.unwrap_err();
    assert!(matches!(err, LimiterError::StorageUnavailable(_)));
    assert!(svc.reset("login", "origin:A").await.is_err());
}

#[derive(Clone, Default)]
struct BrokenAudit;

#[async_trait::async_trait]
impl AuditSink for BrokenAudit {
    async fn record(&self, _event: ViolationEvent) -> Result<(), tollgate::audit::AuditError> {
        Err(tollgate::audit::AuditError::Sink("disk full".into()))
    }
}

#[tokio::test]
async fn failing_audit_sink_does_not_change_decision() {
    let registry = RuleRegistry::builder().rule("login", rule(1, 1.0, Scope::Origin)).build().unwrap();
    let svc = RateLimiterService::builder()
        .registry(registry)
        .clock(Arc::new(ManualClock::new(0)))
        .audit(Arc::new(BrokenAudit))
        .build()
        .unwrap();

    assert!(svc.is_allowed("login", "origin:A", 1).await.is_allowed());
    let denied = svc.is_allowed("login", "origin:A", 1).await;
    assert!(!denied.is_allowed());
    assert!(denied.is_enforced());
}

struct PanickingAudit;

#[async_trait::async_trait]
impl AuditSink for PanickingAudit {
    async fn record(&self, _event: ViolationEvent) -> Result<(), tollgate::audit::AuditError> {
        panic!("audit backend exploded");
    }
}

struct StalledAudit;

#[async_trait::async_trait]
impl AuditSink for StalledAudit {
    async fn record(&self, _event: ViolationEvent) -> Result<(), tollgate::audit::AuditError> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

fn audited_by(sink: Arc<dyn AuditSink>) -> RateLimiterService {
    let registry = RuleRegistry::builder().rule("login", rule(1, 1.0, Scope::Origin)).build().unwrap();
    RateLimiterService::builder()
        .registry(registry)
        .clock(Arc::new(ManualClock::new(0)))
        .audit(sink)
        .build()
        .unwrap()
}

#[tokio::test]
async fn panicking_audit_sink_does_not_unwind_the_request() {
    let (buffer, _guard) = capture_logs();
    let svc = audited_by(Arc::new(PanickingAudit));
    assert!(svc.is_allowed("login", "origin:A", 1).await.is_allowed());

    let task = {
        let svc = svc.clone();
        tokio::spawn(async move { svc.is_allowed("login", "origin:A", 1).await })
    };
    let denied = task.await.expect("request task must not panic");
    assert!(!denied.is_allowed());
    assert!(denied.is_enforced());
    assert_eq!(svc.stats().throttled, 1);
    assert!(logs(&buffer).contains("audit sink panicked"));
}

#[tokio::test(start_paused = true)]
async fn stalled_audit_sink_does_not_hold_the_request() {
    let svc = audited_by(Arc::new(StalledAudit));
    assert!(svc.is_allowed("login", "origin:A", 1).await.is_allowed());

    let denied = tokio::time::timeout(Duration::from_secs(60), svc.is_allowed("login", "origin:A", 1))
        .await
        .expect("denial returns once the audit bound elapses");
    assert!(!denied.is_allowed());
}
