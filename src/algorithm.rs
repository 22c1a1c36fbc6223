//! Admission algorithms.
//!
//! An algorithm turns a rule plus a storage backend into a [`Decision`]. It
//! never lets a storage failure escape: the caller always gets a decision, and
//! an unavailable backend yields [`Decision::fail_open`].

use crate::decision::Decision;
use crate::error::LimiterError;
use crate::key::RateLimitKey;
use crate::rule::{AlgorithmKind, RateLimitRule};
use crate::storage::RateLimitStorage;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::error;

pub mod token_bucket;

pub use token_bucket::TokenBucketAlgorithm;

/// Decision logic for one [`AlgorithmKind`].
#[async_trait]
pub trait RateLimitAlgorithm: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Consume `cost` tokens from the bucket at `key` if possible, reporting
    /// storage failures to the caller.
    async fn decide(
        &self,
        storage: &dyn RateLimitStorage,
        key: &RateLimitKey,
        rule: &RateLimitRule,
        cost: u32,
    ) -> Result<Decision, LimiterError>;

    /// Like [`decide`](Self::decide), but a failure is logged and admitted.
    async fn is_allowed(
        &self,
        storage: &dyn RateLimitStorage,
        key: &RateLimitKey,
        rule: &RateLimitRule,
        cost: u32,
    ) -> Decision {
        match self.decide(storage, key, rule, cost).await {
            Ok(decision) => decision,
            Err(e) => {
                error!(
                    target: "tollgate::algorithm",
                    algorithm = self.name(),
                    key = %key,
                    backend = storage.name(),
                    error = %e,
                    "rate limit check failed; failing open"
                );
                Decision::fail_open()
            }
        }
    }
}

/// Default implementation for an algorithm kind.
pub fn for_kind(kind: AlgorithmKind) -> Arc<dyn RateLimitAlgorithm> {
    match kind {
        AlgorithmKind::TokenBucket => Arc::new(TokenBucketAlgorithm::new()),
    }
}
