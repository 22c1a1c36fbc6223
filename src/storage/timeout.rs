//! Bounded storage calls.

use super::{BucketLimits, RateLimitStorage, StorageError};
use crate::decision::Decision;
use crate::key::RateLimitKey;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Wraps a backend so no call waits longer than `timeout`.
///
/// A slow backend becomes [`StorageError::Timeout`], which the algorithm turns
/// into an admission. The abandoned call is dropped; for the Redis backend the
/// script may still run to completion server-side.
#[derive(Debug, Clone)]
pub struct TimeoutStorage {
    inner: Arc<dyn RateLimitStorage>,
    timeout: Duration,
}

impl TimeoutStorage {
    /// Panics if `timeout` is zero.
    pub fn new(inner: Arc<dyn RateLimitStorage>, timeout: Duration) -> Self {
        assert!(timeout > Duration::ZERO, "storage timeout must be non-zero");
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn inner(&self) -> &Arc<dyn RateLimitStorage> {
        &self.inner
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout { backend: self.inner.name(), after: self.timeout }),
        }
    }
}

#[async_trait]
impl RateLimitStorage for TimeoutStorage {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn check_and_consume(
        &self,
        key: &RateLimitKey,
        limits: BucketLimits,
        cost: u32,
    ) -> Result<Decision, StorageError> {
        self.bounded(self.inner.check_and_consume(key, limits, cost)).await
    }

    async fn peek(&self, key: &RateLimitKey, limits: BucketLimits) -> Result<f64, StorageError> {
        self.bounded(self.inner.peek(key, limits)).await
    }

    async fn reset(&self, key: &RateLimitKey) -> Result<(), StorageError> {
        self.bounded(self.inner.reset(key)).await
    }
}
