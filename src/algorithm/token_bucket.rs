//! Token bucket algorithm.
//!
//! A reservoir of `capacity` tokens refills continuously at `refill_rate`
//! tokens per second and is drained by `cost` tokens per admitted request.
//! Idle periods bank unused capacity up to the cap, which grants bounded burst
//! headroom without unbounded accumulation.
//!
//! [`apply`] is the reference math. Storage backends run it (or an exact
//! transcription of it) inside their atomic primitive.

use super::RateLimitAlgorithm;
use crate::decision::Decision;
use crate::error::LimiterError;
use crate::key::RateLimitKey;
use crate::rule::RateLimitRule;
use crate::storage::{BucketLimits, BucketState, RateLimitStorage};
use async_trait::async_trait;
use tracing::{debug, warn};

/// Tokens available at `now`, refill applied and clamped to capacity.
///
/// Negative elapsed time (clock skew between writers) counts as zero.
pub fn refilled(state: &BucketState, limits: BucketLimits, now: f64) -> f64 {
    let elapsed = (now - state.last_refill).max(0.0);
    let capacity = f64::from(limits.capacity);
    (state.tokens + elapsed * limits.refill_rate).min(capacity).max(0.0)
}

/// One check-and-consume step.
///
/// `state` is `None` for a key never seen (or expired): the bucket starts full.
/// Returns the state to persist and the decision.
pub fn apply(
    state: Option<BucketState>,
    limits: BucketLimits,
    cost: u32,
    now: f64,
) -> (BucketState, Decision) {
    let current = state.unwrap_or_else(|| BucketState::full(limits.capacity, now));
    let available = refilled(&current, limits, now);
    let cost = f64::from(cost);

    if available >= cost {
        let tokens = available - cost;
        (BucketState { tokens, last_refill: now }, Decision::allow(tokens))
    } else {
        let deficit = cost - available;
        let retry_after = deficit / limits.refill_rate;
        (BucketState { tokens: available, last_refill: now }, Decision::deny(retry_after, available))
    }
}

/// Token bucket decision logic delegating atomic execution to storage.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenBucketAlgorithm;

impl TokenBucketAlgorithm {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RateLimitAlgorithm for TokenBucketAlgorithm {
    fn name(&self) -> &'static str {
        "token_bucket"
    }

    async fn decide(
        &self,
        storage: &dyn RateLimitStorage,
        key: &RateLimitKey,
        rule: &RateLimitRule,
        cost: u32,
    ) -> Result<Decision, LimiterError> {
        if cost > rule.capacity() {
            warn!(
                target: "tollgate::algorithm",
                key = %key,
                cost,
                capacity = rule.capacity(),
                "request cost exceeds bucket capacity; denying"
            );
            return Ok(Decision::never());
        }
        let limits = BucketLimits::new(rule.capacity(), rule.refill_rate());
        let decision = storage.check_and_consume(key, limits, cost).await?;
        if !decision.allowed {
            debug!(
                target: "tollgate::algorithm",
                key = %key,
                cost,
                retry_after = decision.retry_after,
                "token bucket empty"
            );
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn limits(capacity: u32, rate: f64) -> BucketLimits {
        BucketLimits::new(capacity, rate)
    }

    #[test]
    fn new_key_starts_full() {
        let (state, decision) = apply(None, limits(10, 1.0), 1, 100.0);
        assert!(decision.allowed);
        assert!((decision.remaining - 9.0).abs() < EPS);
        assert!((state.tokens - 9.0).abs() < EPS);
        assert_eq!(state.last_refill, 100.0);
    }

    #[test]
    fn capacity_bound_then_deny_with_retry_after() {
        let l = limits(10, 1.0);
        let mut state = None;
        for i in 0..10 {
            let (next, decision) = apply(state, l, 1, 0.0);
            assert!(decision.allowed, "call {i} should be admitted");
            state = Some(next);
        }
        let (_, denied) = apply(state, l, 1, 0.0);
        assert!(!denied.allowed);
        assert!((denied.retry_after - 1.0).abs() < EPS);
        assert_eq!(denied.remaining, 0.0);
    }

    #[test]
    fn denial_consumes_nothing() {
        let l = limits(5, 2.0);
        let state = BucketState { tokens: 0.5, last_refill: 10.0 };
        let (next, decision) = apply(Some(state), l, 1, 10.0);
        assert!(!decision.allowed);
        assert!((next.tokens - 0.5).abs() < EPS);
        assert!((decision.retry_after - 0.25).abs() < EPS);
    }

    #[test]
    fn idle_refill_is_clamped_to_capacity() {
        let l = limits(5, 5.0);
        let state = BucketState { tokens: 0.0, last_refill: 0.0 };
        assert!((refilled(&state, l, 3600.0) - 5.0).abs() < EPS);
    }

    #[test]
    fn refill_is_linear_below_capacity() {
        let l = limits(100, 3.0);
        let state = BucketState { tokens: 0.0, last_refill: 50.0 };
        assert!((refilled(&state, l, 52.5) - 7.5).abs() < EPS);
    }

    #[test]
    fn negative_elapsed_is_clamped() {
        let l = limits(10, 1.0);
        let state = BucketState { tokens: 4.0, last_refill: 100.0 };
        let (next, decision) = apply(Some(state), l, 1, 90.0);
        assert!(decision.allowed);
        assert!((next.tokens - 3.0).abs() < EPS);
        assert_eq!(next.last_refill, 90.0);
    }

    #[test]
    fn weighted_cost_drains_multiple_tokens() {
        let l = limits(10, 1.0);
        let (state, decision) = apply(None, l, 7, 0.0);
        assert!(decision.allowed);
        let (_, denied) = apply(Some(state), l, 7, 0.0);
        assert!(!denied.allowed);
        assert!((denied.retry_after - 4.0).abs() < EPS);
    }

    #[test]
    fn sleeping_retry_after_then_retrying_succeeds() {
        let l = limits(3, 0.5);
        let mut state = None;
        for _ in 0..3 {
            state = Some(apply(state, l, 1, 0.0).0);
        }
        let (after_deny, denied) = apply(state, l, 1, 0.0);
        assert!(!denied.allowed);
        let (_, retried) = apply(Some(after_deny), l, 1, denied.retry_after);
        assert!(retried.allowed);
    }
}
