//! Rule registry: an immutable endpoint → rule snapshot, plus a handle that
//! publishes replacement snapshots atomically.
//!
//! Readers take a cheap `Arc` snapshot per request and never observe a
//! partially updated table; reloads build a whole new [`RuleRegistry`] and
//! swap one pointer.

use crate::config::LimiterConfig;
use crate::error::LimiterError;
use crate::rule::{RateLimitRule, RuleSpec, StorageKind};
use arc_swap::ArcSwap;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Immutable mapping from endpoint identifier to rule.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    rules: HashMap<Arc<str>, Arc<RateLimitRule>>,
}

impl RuleRegistry {
    /// Empty registry: every endpoint is unrated.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builder() -> RuleRegistryBuilder {
        RuleRegistryBuilder::default()
    }

    /// Validate every rule of a parsed configuration.
    pub fn from_config(config: &LimiterConfig) -> Result<Self, LimiterError> {
        Self::from_specs(config.rules.iter().map(|(k, v)| (k.clone(), v.clone())))
    }

    /// Validate raw rule specs; the first invalid one aborts loading.
    pub fn from_specs<I>(specs: I) -> Result<Self, LimiterError>
    where
        I: IntoIterator<Item = (String, RuleSpec)>,
    {
        let mut builder = Self::builder();
        for (endpoint, spec) in specs {
            let rule =
                spec.validate().map_err(|e| LimiterError::invalid(endpoint.as_str(), e.to_string()))?;
            builder = builder.rule(endpoint, rule);
        }
        builder.build()
    }

    /// Rule for an endpoint; `None` means admission is unconditional.
    pub fn lookup(&self, endpoint_id: &str) -> Option<&Arc<RateLimitRule>> {
        self.rules.get(endpoint_id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Endpoint identifiers, sorted.
    pub fn endpoints(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.rules.keys().map(|k| k.as_ref()).collect();
        ids.sort_unstable();
        ids
    }

    /// Storage kinds referenced by at least one rule.
    pub fn storage_kinds(&self) -> BTreeSet<StorageKind> {
        self.rules.values().map(|r| r.storage()).collect()
    }
}

/// Collects rules and validates them as a whole.
#[derive(Debug, Default)]
pub struct RuleRegistryBuilder {
    rules: Vec<(String, RateLimitRule)>,
}

impl RuleRegistryBuilder {
    pub fn rule(mut self, endpoint_id: impl Into<String>, rule: RateLimitRule) -> Self {
        self.rules.push((endpoint_id.into(), rule));
        self
    }

    /// Build the snapshot. Empty or duplicate endpoint identifiers are rejected.
    pub fn build(self) -> Result<RuleRegistry, LimiterError> {
        let mut rules = HashMap::with_capacity(self.rules.len());
        for (endpoint, rule) in self.rules {
            if endpoint.trim().is_empty() {
                return Err(LimiterError::invalid(endpoint, "endpoint id cannot be empty"));
            }
            let key: Arc<str> = Arc::from(endpoint.as_str());
            if rules.insert(key, Arc::new(rule)).is_some() {
                return Err(LimiterError::invalid(endpoint, "duplicate rule for endpoint"));
            }
        }
        Ok(RuleRegistry { rules })
    }
}

/// Shared, hot-swappable reference to the current [`RuleRegistry`].
///
/// Clones share the same slot.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    inner: Arc<ArcSwap<RuleRegistry>>,
}

impl RegistryHandle {
    pub fn new(registry: RuleRegistry) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(registry)) }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<RuleRegistry> {
        self.inner.load_full()
    }

    /// Rule for an endpoint in the current snapshot.
    pub fn lookup(&self, endpoint_id: &str) -> Option<Arc<RateLimitRule>> {
        self.inner.load().lookup(endpoint_id).cloned()
    }

    /// Publish a replacement snapshot; returns the previous one.
    pub fn swap(&self, registry: RuleRegistry) -> Arc<RuleRegistry> {
        self.inner.swap(Arc::new(registry))
    }
}

impl Default for RegistryHandle {
    fn default() -> Self {
        Self::new(RuleRegistry::empty())
    }
}
