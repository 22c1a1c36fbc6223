//! Rate limit rules: the immutable per-endpoint configuration value.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Dimension along which buckets are isolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// One bucket per network origin.
    #[serde(rename = "origin")]
    Origin,
    /// One bucket per authenticated principal (origin when unauthenticated).
    #[serde(rename = "principal")]
    Principal,
    /// One bucket shared by every caller of the endpoint.
    #[serde(rename = "endpoint")]
    Endpoint,
    /// One bucket per principal and target resource.
    #[serde(rename = "principal+resource")]
    PrincipalAndResource,
}

impl Scope {
    /// Stable name used in keys, logs and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Origin => "origin",
            Scope::Principal => "principal",
            Scope::Endpoint => "endpoint",
            Scope::PrincipalAndResource => "principal+resource",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision algorithm selected for a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AlgorithmKind {
    #[default]
    #[serde(rename = "token_bucket")]
    TokenBucket,
}

impl AlgorithmKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlgorithmKind::TokenBucket => "token_bucket",
        }
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage backend selected for a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StorageKind {
    /// Script-capable remote key/value store.
    #[serde(rename = "redis")]
    Redis,
    /// In-process map, for single-node deployments and tests.
    #[serde(rename = "memory")]
    Memory,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Redis => "redis",
            StorageKind::Memory => "memory",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validation failures for a single rule.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    #[error("capacity must be a positive integer (got {0})")]
    InvalidCapacity(f64),
    #[error("refill_rate must be a positive, finite number of tokens per second (got {0})")]
    InvalidRefillRate(f64),
}

/// Immutable rate limit rule bound to one endpoint.
///
/// Invariant: `capacity > 0 && refill_rate > 0`. The only way to obtain a rule
/// is through a validating constructor, so every rule held by a registry
/// satisfies it.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitRule {
    algorithm: AlgorithmKind,
    storage: StorageKind,
    capacity: u32,
    refill_rate: f64,
    scope: Scope,
    enabled: bool,
}

impl RateLimitRule {
    /// Build an enabled token bucket rule backed by in-memory storage.
    ///
    /// # Examples
    /// ```
    /// use tollgate::rule::{RateLimitRule, Scope, StorageKind};
    /// let rule = RateLimitRule::token_bucket(10, 1.0, Scope::Origin)
    ///     .unwrap()
    ///     .with_storage(StorageKind::Redis);
    /// assert_eq!(rule.capacity(), 10);
    /// ```
    pub fn token_bucket(capacity: u32, refill_rate: f64, scope: Scope) -> Result<Self, RuleError> {
        if capacity == 0 {
            return Err(RuleError::InvalidCapacity(0.0));
        }
        if !(refill_rate.is_finite() && refill_rate > 0.0) {
            return Err(RuleError::InvalidRefillRate(refill_rate));
        }
        Ok(Self {
            algorithm: AlgorithmKind::TokenBucket,
            storage: StorageKind::Memory,
            capacity,
            refill_rate,
            scope,
            enabled: true,
        })
    }

    /// Select the storage backend.
    pub fn with_storage(mut self, storage: StorageKind) -> Self {
        self.storage = storage;
        self
    }

    /// Turn the rule on or off.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn algorithm(&self) -> AlgorithmKind {
        self.algorithm
    }

    pub fn storage(&self) -> StorageKind {
        self.storage
    }

    /// Maximum tokens the bucket can hold.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Seconds for an empty bucket to refill to capacity.
    pub fn full_refill_secs(&self) -> f64 {
        f64::from(self.capacity) / self.refill_rate
    }
}

/// Raw, unvalidated rule as it appears in configuration documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    #[serde(default)]
    pub algorithm: AlgorithmKind,
    pub storage: StorageKind,
    pub capacity: f64,
    pub refill_rate: f64,
    pub scope: Scope,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RuleSpec {
    /// Validate into an immutable rule.
    pub fn validate(&self) -> Result<RateLimitRule, RuleError> {
        let capacity = self.capacity;
        if !(capacity.is_finite() && capacity >= 1.0 && capacity.fract() == 0.0)
            || capacity > f64::from(u32::MAX)
        {
            return Err(RuleError::InvalidCapacity(capacity));
        }
        let rule = match self.algorithm {
            AlgorithmKind::TokenBucket => {
                RateLimitRule::token_bucket(capacity as u32, self.refill_rate, self.scope)?
            }
        };
        Ok(rule.with_storage(self.storage).with_enabled(self.enabled))
    }
}

impl From<&RateLimitRule> for RuleSpec {
    fn from(rule: &RateLimitRule) -> Self {
        Self {
            algorithm: rule.algorithm,
            storage: rule.storage,
            capacity: f64::from(rule.capacity),
            refill_rate: rule.refill_rate,
            scope: rule.scope,
            enabled: rule.enabled,
        }
    }
}
