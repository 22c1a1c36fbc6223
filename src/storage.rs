//! Storage backends for bucket state.
//!
//! A backend owns the one operation that matters for correctness: an atomic
//! check-and-consume per key. Read, refill, decide and write happen as one
//! indivisible step, so N concurrent attempts on a key are equivalent to some
//! serial order of those attempts.
//!
//! - [`InMemoryStorage`]: per-key critical section in a sharded map.
//! - `tollgate-redis`: one server-side script per attempt.
//! - [`TimeoutStorage`]: bounds every call of another backend.
//!
//! Backends translate every native failure into [`StorageError`]; nothing
//! else may escape toward the request path.

use crate::decision::Decision;
use crate::key::RateLimitKey;
use async_trait::async_trait;
use std::time::Duration;

pub mod memory;
pub mod timeout;

pub use memory::InMemoryStorage;
pub use timeout::TimeoutStorage;

/// Persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Tokens available, always within `[0, capacity]`.
    pub tokens: f64,
    /// Time of the last refill, seconds since the epoch.
    pub last_refill: f64,
}

impl BucketState {
    /// Fresh bucket: starts full.
    pub fn full(capacity: u32, now: f64) -> Self {
        Self { tokens: f64::from(capacity), last_refill: now }
    }
}

/// Bucket shape passed to every storage call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketLimits {
    pub capacity: u32,
    /// Tokens per second.
    pub refill_rate: f64,
}

impl BucketLimits {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self { capacity, refill_rate }
    }
}

/// The single storage failure condition.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// Connection refused, script error, malformed reply, and so on.
    #[error("{backend} backend unavailable: {reason}")]
    Unavailable {
        backend: &'static str,
        reason: String,
    },
    /// The call did not finish within its bound.
    #[error("{backend} backend timed out after {after:?}")]
    Timeout {
        backend: &'static str,
        after: Duration,
    },
}

impl StorageError {
    pub fn unavailable(backend: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Unavailable { backend, reason: reason.to_string() }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Storage backend for token bucket state.
#[async_trait]
pub trait RateLimitStorage: Send + Sync + std::fmt::Debug {
    /// Short backend name for logs and errors.
    fn name(&self) -> &'static str;

    /// Atomically refill, decide, and persist. Denials consume nothing but
    /// still persist the refilled state. Every write refreshes the key's TTL.
    async fn check_and_consume(
        &self,
        key: &RateLimitKey,
        limits: BucketLimits,
        cost: u32,
    ) -> Result<Decision, StorageError>;

    /// Tokens currently available (refill applied) without consuming or writing.
    async fn peek(&self, key: &RateLimitKey, limits: BucketLimits) -> Result<f64, StorageError>;

    /// Forget the bucket; the next access starts full.
    async fn reset(&self, key: &RateLimitKey) -> Result<(), StorageError>;
}
