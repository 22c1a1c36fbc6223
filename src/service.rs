//! The admission orchestrator.
//!
//! [`RateLimiterService`] binds the rule registry to algorithms and storage
//! backends. Backends and algorithms are resolved once, when the service is
//! built; a request only does a registry lookup, a key format, and one storage
//! call.
//!
//! The service never returns an error from [`RateLimiterService::is_allowed`].
//! Missing rules, disabled rules, storage failures, and even panics inside a
//! backend all come back as an admitted [`Admission`] whose
//! [`AdmissionBasis`] says why.

use crate::algorithm::{self, RateLimitAlgorithm};
use crate::audit::{AuditSink, ViolationEvent};
use crate::clock::{Clock, SystemClock};
use crate::config::{LimiterConfig, Settings};
use crate::decision::{Admission, AdmissionBasis, Decision};
use crate::error::LimiterError;
use crate::key::RateLimitKey;
use crate::registry::{RegistryHandle, RuleRegistry};
use crate::rule::{AlgorithmKind, RateLimitRule, RuleSpec, StorageKind};
use crate::storage::{BucketLimits, InMemoryStorage, RateLimitStorage, TimeoutStorage};
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Running totals since the service was built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionStats {
    /// Requests a live rule admitted.
    pub admitted: u64,
    /// Requests denied.
    pub throttled: u64,
    /// Requests admitted because the check itself failed.
    pub failed_open: u64,
    /// Requests with no rule, or a disabled one.
    pub unrated: u64,
}

#[derive(Debug, Default)]
struct Counters {
    admitted: AtomicU64,
    throttled: AtomicU64,
    failed_open: AtomicU64,
    unrated: AtomicU64,
}

impl Counters {
    fn record(&self, basis: AdmissionBasis, allowed: bool) {
        let slot = match (basis, allowed) {
            (AdmissionBasis::Enforced, true) => &self.admitted,
            (AdmissionBasis::Enforced, false) => &self.throttled,
            (AdmissionBasis::FailedOpen, _) => &self.failed_open,
            (AdmissionBasis::RuleNotConfigured | AdmissionBasis::RuleDisabled, _) => &self.unrated,
        };
        slot.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> AdmissionStats {
        AdmissionStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            failed_open: self.failed_open.load(Ordering::Relaxed),
            unrated: self.unrated.load(Ordering::Relaxed),
        }
    }
}

struct Inner {
    registry: RegistryHandle,
    storages: HashMap<StorageKind, Arc<dyn RateLimitStorage>>,
    algorithms: HashMap<AlgorithmKind, Arc<dyn RateLimitAlgorithm>>,
    settings: Settings,
    clock: Arc<dyn Clock>,
    audit: Option<Arc<dyn AuditSink>>,
    counters: Counters,
}

/// Shared admission engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct RateLimiterService {
    inner: Arc<Inner>,
}

impl fmt::Debug for RateLimiterService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut storages: Vec<_> = self.inner.storages.keys().collect();
        storages.sort();
        f.debug_struct("RateLimiterService")
            .field("rules", &self.inner.registry.snapshot().len())
            .field("storages", &storages)
            .field("settings", &self.inner.settings)
            .field("audit", &self.inner.audit.is_some())
            .finish()
    }
}

impl RateLimiterService {
    pub fn builder() -> RateLimiterServiceBuilder {
        RateLimiterServiceBuilder::default()
    }

    /// Decide whether one request may proceed.
    ///
    /// `identity` is the resolved caller identity; it is ignored for
    /// endpoint-scoped rules. `cost` is the number of tokens the request uses.
    pub async fn is_allowed(&self, endpoint_id: &str, identity: &str, cost: u32) -> Admission {
        let rule = self.inner.registry.lookup(endpoint_id);
        self.admit(endpoint_id, rule, identity, cost).await
    }

    /// [`is_allowed`](Self::is_allowed) against a rule the caller already
    /// looked up with [`rule_for`](Self::rule_for).
    ///
    /// Callers that derive `identity` from the rule's scope use this so a
    /// concurrent [`reload`](Self::reload) cannot swap the rule in between.
    pub async fn admit(
        &self,
        endpoint_id: &str,
        rule: Option<Arc<RateLimitRule>>,
        identity: &str,
        cost: u32,
    ) -> Admission {
        let Some(rule) = rule else {
            debug!(target: "tollgate::service", endpoint = endpoint_id, "no rule configured; allowing");
            return self.finish(Admission::unrated(AdmissionBasis::RuleNotConfigured, None));
        };
        if !rule.enabled() {
            debug!(target: "tollgate::service", endpoint = endpoint_id, "rule disabled; allowing");
            return self.finish(Admission::unrated(AdmissionBasis::RuleDisabled, Some(rule)));
        }
        let cost = if cost == 0 {
            debug!(target: "tollgate::service", endpoint = endpoint_id, "zero cost charged as one token");
            1
        } else {
            cost
        };

        let key = self.key_for(&rule, identity, endpoint_id);
        let attempt = AssertUnwindSafe(self.evaluate(&rule, &key, cost)).catch_unwind().await;
        let decision = match attempt {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                error!(
                    target: "tollgate::service",
                    endpoint = endpoint_id,
                    key = %key,
                    storage = %rule.storage(),
                    error = %e,
                    "rate limit check failed; failing open"
                );
                return self.finish(Admission::unrated(AdmissionBasis::FailedOpen, Some(rule)));
            }
            Err(panic) => {
                let e = LimiterError::AlgorithmInternal(panic_message(panic.as_ref()));
                error!(
                    target: "tollgate::service",
                    endpoint = endpoint_id,
                    key = %key,
                    error = %e,
                    "rate limit check panicked; failing open"
                );
                return self.finish(Admission::unrated(AdmissionBasis::FailedOpen, Some(rule)));
            }
        };

        if !decision.allowed {
            debug!(
                target: "tollgate::service",
                endpoint = endpoint_id,
                identity,
                retry_after = decision.retry_after,
                "request throttled"
            );
            self.emit_violation(endpoint_id, identity, &rule, decision).await;
        }
        self.finish(Admission { decision, basis: AdmissionBasis::Enforced, rule: Some(rule) })
    }

    async fn evaluate(
        &self,
        rule: &RateLimitRule,
        key: &RateLimitKey,
        cost: u32,
    ) -> Result<Decision, LimiterError> {
        let algorithm = self.algorithm(rule)?;
        let storage = self.storage(rule)?;
        algorithm.decide(storage.as_ref(), key, rule, cost).await
    }

    async fn emit_violation(
        &self,
        endpoint_id: &str,
        identity: &str,
        rule: &RateLimitRule,
        decision: Decision,
    ) {
        let Some(sink) = &self.inner.audit else {
            return;
        };
        let event = ViolationEvent::new(
            endpoint_id,
            identity,
            rule,
            decision.retry_after,
            self.inner.clock.now_millis(),
        );
        // A sink may neither stall nor unwind the request.
        let limit = self.inner.settings.storage_timeout();
        let record = AssertUnwindSafe(sink.record(event)).catch_unwind();
        match tokio::time::timeout(limit, record).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                warn!(target: "tollgate::audit", endpoint = endpoint_id, error = %e, "failed to record violation");
            }
            Ok(Err(panic)) => {
                error!(
                    target: "tollgate::audit",
                    endpoint = endpoint_id,
                    panic = %panic_message(panic.as_ref()),
                    "audit sink panicked; violation dropped"
                );
            }
            Err(_) => {
                warn!(
                    target: "tollgate::audit",
                    endpoint = endpoint_id,
                    after = ?limit,
                    "audit sink timed out; violation dropped"
                );
            }
        }
    }

    fn finish(&self, admission: Admission) -> Admission {
        self.inner.counters.record(admission.basis, admission.decision.allowed);
        admission
    }

    fn key_for(&self, rule: &RateLimitRule, identity: &str, endpoint_id: &str) -> RateLimitKey {
        RateLimitKey::new(&self.inner.settings.key_prefix, rule.scope(), identity, endpoint_id)
    }

    fn storage(&self, rule: &RateLimitRule) -> Result<&Arc<dyn RateLimitStorage>, LimiterError> {
        self.inner.storages.get(&rule.storage()).ok_or_else(|| {
            LimiterError::AlgorithmInternal(format!("no backend for storage kind '{}'", rule.storage()))
        })
    }

    fn algorithm(&self, rule: &RateLimitRule) -> Result<&Arc<dyn RateLimitAlgorithm>, LimiterError> {
        self.inner.algorithms.get(&rule.algorithm()).ok_or_else(|| {
            LimiterError::AlgorithmInternal(format!("no algorithm for kind '{}'", rule.algorithm()))
        })
    }

    /// Rule currently in force for an endpoint.
    pub fn rule_for(&self, endpoint_id: &str) -> Option<Arc<RateLimitRule>> {
        self.inner.registry.lookup(endpoint_id)
    }

    /// Tokens currently available to `identity` on `endpoint_id`, without
    /// consuming. `Ok(None)` when the endpoint has no rule.
    ///
    /// Unlike `is_allowed`, storage failures are returned: this is an
    /// administrative path, not a request path.
    pub async fn peek(&self, endpoint_id: &str, identity: &str) -> Result<Option<f64>, LimiterError> {
        let Some(rule) = self.inner.registry.lookup(endpoint_id) else {
            return Ok(None);
        };
        let key = self.key_for(&rule, identity, endpoint_id);
        let limits = BucketLimits::new(rule.capacity(), rule.refill_rate());
        let tokens = self.storage(&rule)?.peek(&key, limits).await?;
        Ok(Some(tokens))
    }

    /// Refill the bucket of `identity` on `endpoint_id`.
    ///
    /// Returns `Ok(false)` when the endpoint has no rule.
    pub async fn reset(&self, endpoint_id: &str, identity: &str) -> Result<bool, LimiterError> {
        let Some(rule) = self.inner.registry.lookup(endpoint_id) else {
            return Ok(false);
        };
        let key = self.key_for(&rule, identity, endpoint_id);
        self.storage(&rule)?.reset(&key).await?;
        info!(target: "tollgate::service", endpoint = endpoint_id, key = %key, "bucket reset");
        Ok(true)
    }

    /// Atomically replace the rule set.
    ///
    /// The new registry is checked against the configured backends first; on
    /// error the current rules stay in force.
    pub fn reload(&self, registry: RuleRegistry) -> Result<Arc<RuleRegistry>, LimiterError> {
        check_backends(&registry, &self.inner.storages)?;
        let rules = registry.len();
        let previous = self.inner.registry.swap(registry);
        info!(target: "tollgate::service", rules, previous = previous.len(), "rate limit rules reloaded");
        Ok(previous)
    }

    /// Handle to the live registry.
    pub fn registry(&self) -> &RegistryHandle {
        &self.inner.registry
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn stats(&self) -> AdmissionStats {
        self.inner.counters.snapshot()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

fn check_backends(
    registry: &RuleRegistry,
    storages: &HashMap<StorageKind, Arc<dyn RateLimitStorage>>,
) -> Result<(), LimiterError> {
    for endpoint in registry.endpoints() {
        if let Some(rule) = registry.lookup(endpoint) {
            if !storages.contains_key(&rule.storage()) {
                return Err(LimiterError::invalid(
                    endpoint,
                    format!("storage '{}' has no configured backend", rule.storage()),
                ));
            }
        }
    }
    Ok(())
}

/// Builder for [`RateLimiterService`].
#[derive(Default)]
pub struct RateLimiterServiceBuilder {
    settings: Settings,
    registry: Option<RuleRegistry>,
    specs: Option<BTreeMap<String, RuleSpec>>,
    storages: HashMap<StorageKind, Arc<dyn RateLimitStorage>>,
    algorithms: HashMap<AlgorithmKind, Arc<dyn RateLimitAlgorithm>>,
    clock: Option<Arc<dyn Clock>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl RateLimiterServiceBuilder {
    /// Take settings and rules from a parsed configuration document.
    pub fn config(mut self, config: LimiterConfig) -> Self {
        self.settings = config.settings;
        self.specs = Some(config.rules);
        self.registry = None;
        self
    }

    /// Use an already validated registry. Replaces rules from `config`.
    pub fn registry(mut self, registry: RuleRegistry) -> Self {
        self.registry = Some(registry);
        self.specs = None;
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Backend for a storage kind.
    pub fn storage(mut self, kind: StorageKind, storage: Arc<dyn RateLimitStorage>) -> Self {
        self.storages.insert(kind, storage);
        self
    }

    /// Override the implementation for an algorithm kind.
    pub fn algorithm(mut self, kind: AlgorithmKind, algorithm: Arc<dyn RateLimitAlgorithm>) -> Self {
        self.algorithms.insert(kind, algorithm);
        self
    }

    /// Clock for violation timestamps and the default in-memory backend.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Validate and assemble the service.
    ///
    /// Fails with [`LimiterError::ConfigurationInvalid`] on bad settings, an
    /// invalid rule, or a rule whose storage kind has no backend. The `memory`
    /// kind gets an [`InMemoryStorage`] unless one was supplied.
    pub fn build(self) -> Result<RateLimiterService, LimiterError> {
        self.settings.validate()?;
        let registry = match (self.registry, self.specs) {
            (Some(registry), _) => registry,
            (None, Some(specs)) => RuleRegistry::from_specs(specs)?,
            (None, None) => RuleRegistry::empty(),
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let mut raw = self.storages;
        if !raw.contains_key(&StorageKind::Memory) {
            let memory: Arc<dyn RateLimitStorage> =
                Arc::new(InMemoryStorage::with_clock(Arc::clone(&clock), self.settings.bucket_ttl()));
            raw.insert(StorageKind::Memory, memory);
        }
        let timeout = self.settings.storage_timeout();
        let storages: HashMap<StorageKind, Arc<dyn RateLimitStorage>> = raw
            .into_iter()
            .map(|(kind, backend)| {
                let bounded: Arc<dyn RateLimitStorage> = Arc::new(TimeoutStorage::new(backend, timeout));
                (kind, bounded)
            })
            .collect();
        check_backends(&registry, &storages)?;

        let mut algorithms = self.algorithms;
        algorithms
            .entry(AlgorithmKind::TokenBucket)
            .or_insert_with(|| algorithm::for_kind(AlgorithmKind::TokenBucket));

        info!(
            target: "tollgate::service",
            rules = registry.len(),
            backends = storages.len(),
            key_prefix = %self.settings.key_prefix,
            "rate limiter ready"
        );

        Ok(RateLimiterService {
            inner: Arc::new(Inner {
                registry: RegistryHandle::new(registry),
                storages,
                algorithms,
                settings: self.settings,
                clock,
                audit: self.audit,
                counters: Counters::default(),
            }),
        })
    }
}
