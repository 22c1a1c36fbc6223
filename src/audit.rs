//! Violation audit trail.
//!
//! The service emits a [`ViolationEvent`] for every denied request. Sinks are
//! best-effort: a failing sink is logged and never changes the decision.

use crate::clock::{Clock, SystemClock};
use crate::rule::{RateLimitRule, RuleSpec, Scope};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Record of one denied request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ViolationEvent {
    pub endpoint_id: String,
    pub identity: String,
    pub scope: Scope,
    /// Rule in force when the request was denied.
    pub rule: RuleSpec,
    /// Seconds the caller was told to wait.
    pub retry_after: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl ViolationEvent {
    pub fn new(
        endpoint_id: impl Into<String>,
        identity: impl Into<String>,
        rule: &RateLimitRule,
        retry_after: f64,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            identity: identity.into(),
            scope: rule.scope(),
            rule: RuleSpec::from(rule),
            retry_after,
            timestamp_ms,
        }
    }

    /// Event stamped with the current wall clock.
    pub fn now(
        endpoint_id: impl Into<String>,
        identity: impl Into<String>,
        rule: &RateLimitRule,
        retry_after: f64,
    ) -> Self {
        Self::new(endpoint_id, identity, rule, retry_after, SystemClock.now_millis())
    }
}

/// Audit sink failures. Logged by the caller, never surfaced to requests.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AuditError {
    /// The sink's worker has stopped.
    #[error("audit sink closed")]
    Closed,
    /// Backend-specific failure.
    #[error("audit: {0}")]
    Sink(String),
}

/// Destination for violation events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: ViolationEvent) -> Result<(), AuditError>;
}

/// Writes violations to the `tollgate::audit` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: ViolationEvent) -> Result<(), AuditError> {
        warn!(
            target: "tollgate::audit",
            endpoint = %event.endpoint_id,
            identity = %event.identity,
            scope = %event.scope,
            capacity = event.rule.capacity,
            refill_rate = event.rule.refill_rate,
            retry_after = event.retry_after,
            timestamp_ms = event.timestamp_ms,
            "rate limit violation"
        );
        Ok(())
    }
}

/// Keeps the most recent violations in memory.
#[derive(Clone, Debug)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<VecDeque<ViolationEvent>>>,
    capacity: usize,
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::with_capacity(10_000)
    }
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain at most `capacity` events; older ones are evicted first.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { events: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))), capacity }
    }

    /// Snapshot of retained events, oldest first.
    pub async fn events(&self) -> Vec<ViolationEvent> {
        self.events.lock().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    pub async fn clear(&self) {
        self.events.lock().await.clear();
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: ViolationEvent) -> Result<(), AuditError> {
        let mut guard = self.events.lock().await;
        if guard.len() == self.capacity {
            guard.pop_front();
        }
        guard.push_back(event);
        Ok(())
    }
}

/// Moves recording off the request path onto a worker task.
///
/// `record` only enqueues. When the queue is full the event is dropped and
/// counted; the request is never made to wait on audit I/O.
#[derive(Clone)]
pub struct NonBlockingAuditSink {
    tx: mpsc::Sender<ViolationEvent>,
    dropped: Arc<AtomicU64>,
}

impl NonBlockingAuditSink {
    /// Spawn the worker on the current tokio runtime.
    pub fn with_capacity(sink: Arc<dyn AuditSink>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<ViolationEvent>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = sink.record(event).await {
                    warn!(target: "tollgate::audit", error = %e, "audit sink failed");
                }
            }
            debug!(target: "tollgate::audit", "audit worker stopped");
        });
        Self { tx, dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Events discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for NonBlockingAuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonBlockingAuditSink").field("dropped", &self.dropped()).finish()
    }
}

#[async_trait]
impl AuditSink for NonBlockingAuditSink {
    async fn record(&self, event: ViolationEvent) -> Result<(), AuditError> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(AuditError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn event(endpoint: &str) -> ViolationEvent {
        let rule = RateLimitRule::token_bucket(5, 1.0, Scope::Principal).unwrap();
        ViolationEvent::new(endpoint, "principal:u1", &rule, 1.5, 42)
    }

    #[tokio::test]
    async fn memory_sink_evicts_oldest() {
        let sink = MemoryAuditSink::with_capacity(2);
        for e in ["a", "b", "c"] {
            sink.record(event(e)).await.unwrap();
        }
        let kept: Vec<_> = sink.events().await.into_iter().map(|e| e.endpoint_id).collect();
        assert_eq!(kept, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn event_snapshots_rule() {
        let e = event("login");
        assert_eq!(e.scope, Scope::Principal);
        assert_eq!(e.rule.capacity, 5.0);
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["scope"], "principal");
        assert_eq!(json["rule"]["storage"], "memory");
    }

    #[tokio::test]
    async fn non_blocking_forwards_to_inner() {
        let inner = MemoryAuditSink::new();
        let sink = NonBlockingAuditSink::with_capacity(Arc::new(inner.clone()), 8);
        sink.record(event("login")).await.unwrap();

        for _ in 0..50 {
            if inner.len().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(inner.len().await, 1);
        assert_eq!(sink.dropped(), 0);
    }

    struct StuckSink;

    #[async_trait]
    impl AuditSink for StuckSink {
        async fn record(&self, _event: ViolationEvent) -> Result<(), AuditError> {
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn non_blocking_drops_when_full() {
        let sink = NonBlockingAuditSink::with_capacity(Arc::new(StuckSink), 1);
        for _ in 0..10 {
            sink.record(event("login")).await.unwrap();
        }
        // At most one in flight in the worker and one queued.
        assert!(sink.dropped() >= 8, "dropped {}", sink.dropped());
    }

    #[tokio::test]
    async fn tracing_sink_never_fails() {
        assert!(TracingAuditSink.record(event("login")).await.is_ok());
    }
}
