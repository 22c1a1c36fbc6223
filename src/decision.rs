//! Decision values returned by the engine.

use crate::rule::RateLimitRule;
use std::sync::Arc;
use std::time::Duration;

/// Result of one consume attempt. Constructed per call, never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Seconds until the request would succeed; `0.0` when allowed.
    pub retry_after: f64,
    /// Tokens left after this attempt. Informational only.
    pub remaining: f64,
}

impl Decision {
    /// Admitted with `remaining` tokens left.
    pub fn allow(remaining: f64) -> Self {
        Self { allowed: true, retry_after: 0.0, remaining }
    }

    /// Throttled; the caller should wait `retry_after` seconds.
    pub fn deny(retry_after: f64, remaining: f64) -> Self {
        Self { allowed: false, retry_after: retry_after.max(0.0), remaining }
    }

    /// Denied for good: the request costs more than the bucket can ever hold.
    ///
    /// `retry_after` is infinite; waiting does not help.
    pub fn never() -> Self {
        Self { allowed: false, retry_after: f64::INFINITY, remaining: 0.0 }
    }

    /// Admission granted because the limiter could not decide.
    ///
    /// `remaining` is unknown and reported as `0.0`.
    pub fn fail_open() -> Self {
        Self::allow(0.0)
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// False only for a denial that no amount of waiting will lift.
    pub fn is_retryable(&self) -> bool {
        self.allowed || self.retry_after.is_finite()
    }

    /// `retry_after` as a `Duration`.
    pub fn retry_after_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.retry_after).unwrap_or(Duration::MAX)
    }

    /// Whole seconds to advertise in `Retry-After`: rounded up, at least 1 on
    /// denial. `None` when the denial is not retryable.
    pub fn retry_after_header_secs(&self) -> Option<u64> {
        if self.allowed {
            return Some(0);
        }
        self.is_retryable().then(|| (self.retry_after.ceil() as u64).max(1))
    }

    /// Whole tokens left, rounded down.
    pub fn remaining_whole(&self) -> u64 {
        self.remaining.max(0.0).floor() as u64
    }
}

/// Why an admission decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionBasis {
    /// The rule was evaluated against live bucket state.
    Enforced,
    /// No rule for the endpoint.
    RuleNotConfigured,
    /// Rule present but disabled.
    RuleDisabled,
    /// Storage or internal failure; admitted without consuming.
    FailedOpen,
}

impl AdmissionBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionBasis::Enforced => "enforced",
            AdmissionBasis::RuleNotConfigured => "rule_not_configured",
            AdmissionBasis::RuleDisabled => "rule_disabled",
            AdmissionBasis::FailedOpen => "failed_open",
        }
    }
}

/// Service-level answer: the decision plus the rule that produced it.
#[derive(Debug, Clone)]
pub struct Admission {
    pub decision: Decision,
    pub basis: AdmissionBasis,
    /// Rule in force, if any.
    pub rule: Option<Arc<RateLimitRule>>,
}

impl Admission {
    pub(crate) fn unrated(basis: AdmissionBasis, rule: Option<Arc<RateLimitRule>>) -> Self {
        Self { decision: Decision::fail_open(), basis, rule }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision.allowed
    }

    pub fn retry_after(&self) -> f64 {
        self.decision.retry_after
    }

    /// True when a live rule was actually applied.
    pub fn is_enforced(&self) -> bool {
        self.basis == AdmissionBasis::Enforced
    }
}
