#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tollgate::prelude::*;
use tollgate::{BucketLimits, RateLimitKey};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriter};

pub const T0_MILLIS: u64 = 1_700_000_000_000;

pub fn rule(capacity: u32, refill_rate: f64, scope: Scope) -> RateLimitRule {
    RateLimitRule::token_bucket(capacity, refill_rate, scope).expect("valid rule")
}

/// Service on a manual clock with the default in-memory backend.
pub fn limiter(clock: &ManualClock, rules: &[(&str, RateLimitRule)]) -> RateLimiterService {
    let mut registry = RuleRegistry::builder();
    for (endpoint, rule) in rules {
        registry = registry.rule(*endpoint, rule.clone());
    }
    RateLimiterService::builder()
        .registry(registry.build().expect("valid registry"))
        .clock(Arc::new(clock.clone()))
        .build()
        .expect("service builds")
}

/// Backend that fails every call the way an unreachable server would.
#[derive(Debug, Default)]
pub struct FailingStorage;

#[async_trait]
impl RateLimitStorage for FailingStorage {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn check_and_consume(
        &self,
        _key: &RateLimitKey,
        _limits: BucketLimits,
        _cost: u32,
    ) -> Result<Decision, StorageError> {
        Err(StorageError::unavailable("failing", "connection refused"))
    }

    async fn peek(&self, _key: &RateLimitKey, _limits: BucketLimits) -> Result<f64, StorageError> {
        Err(StorageError::unavailable("failing", "connection refused"))
    }

    async fn reset(&self, _key: &RateLimitKey) -> Result<(), StorageError> {
        Err(StorageError::unavailable("failing", "connection refused"))
    }
}

/// Backend that never answers within any sane timeout.
#[derive(Debug, Default)]
pub struct HangingStorage;

#[async_trait]
impl RateLimitStorage for HangingStorage {
    fn name(&self) -> &'static str {
        "hanging"
    }

    async fn check_and_consume(
        &self,
        _key: &RateLimitKey,
        _limits: BucketLimits,
        _cost: u32,
    ) -> Result<Decision, StorageError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Decision::deny(3600.0, 0.0))
    }

    async fn peek(&self, _key: &RateLimitKey, _limits: BucketLimits) -> Result<f64, StorageError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(0.0)
    }

    async fn reset(&self, _key: &RateLimitKey) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Service whose `redis` kind is backed by `storage`.
pub fn limiter_on(
    storage: Arc<dyn RateLimitStorage>,
    rules: &[(&str, RateLimitRule)],
) -> RateLimiterService {
    let mut registry = RuleRegistry::builder();
    for (endpoint, rule) in rules {
        registry = registry.rule(*endpoint, rule.clone().with_storage(StorageKind::Redis));
    }
    RateLimiterService::builder()
        .registry(registry.build().expect("valid registry"))
        .storage(StorageKind::Redis, storage)
        .build()
        .expect("service builds")
}

#[derive(Clone)]
pub struct SharedWriter(pub Arc<Mutex<Vec<u8>>>);

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

pub struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Install a thread-local subscriber that records everything at DEBUG and up.
pub fn capture_logs() -> (Arc<Mutex<Vec<u8>>>, tracing::subscriber::DefaultGuard) {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::fmt()
        .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
        .with_max_level(tracing::Level::DEBUG)
        .with_target(true)
        .with_ansi(false)
        .without_time()
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (buffer, guard)
}

pub fn logs(buffer: &Arc<Mutex<Vec<u8>>>) -> String {
    String::from_utf8(buffer.lock().unwrap().clone()).unwrap()
}
