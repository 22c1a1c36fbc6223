//! Configuration documents for the admission engine.
//!
//! A configuration is a JSON document with optional global `settings` and a
//! `rules` map from endpoint identifier to [`RuleSpec`]. Parsing is fail-fast:
//! the first malformed rule aborts loading with
//! [`LimiterError::ConfigurationInvalid`] naming the endpoint.

use crate::error::LimiterError;
use crate::rule::RuleSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Default prefix for storage keys.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit";
/// Default bucket expiry, refreshed on every write.
pub const DEFAULT_BUCKET_TTL: Duration = Duration::from_secs(3600);
/// Default bound on a single storage round trip.
pub const DEFAULT_STORAGE_TIMEOUT: Duration = Duration::from_millis(50);

/// Global engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Prefix prepended to every bucket key (`{prefix}:{scope}:{identity}:{endpoint}`).
    pub key_prefix: String,
    /// Bucket expiry in seconds.
    pub bucket_ttl_secs: u64,
    /// Storage call timeout in milliseconds.
    pub storage_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            bucket_ttl_secs: DEFAULT_BUCKET_TTL.as_secs(),
            storage_timeout_ms: DEFAULT_STORAGE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl Settings {
    pub fn bucket_ttl(&self) -> Duration {
        Duration::from_secs(self.bucket_ttl_secs)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), LimiterError> {
        if self.key_prefix.trim().is_empty() {
            return Err(LimiterError::invalid("*", "key_prefix cannot be empty"));
        }
        if self.key_prefix.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(LimiterError::invalid("*", "key_prefix cannot contain whitespace"));
        }
        if self.bucket_ttl_secs == 0 {
            return Err(LimiterError::invalid("*", "bucket_ttl_secs must be positive"));
        }
        if self.storage_timeout_ms == 0 {
            return Err(LimiterError::invalid("*", "storage_timeout_ms must be positive"));
        }
        Ok(())
    }
}

/// Parsed configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LimiterConfig {
    pub settings: Settings,
    pub rules: BTreeMap<String, RuleSpec>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    settings: Settings,
    #[serde(default)]
    rules: BTreeMap<String, serde_json::Value>,
}

impl LimiterConfig {
    /// Parse a configuration document.
    ///
    /// # Examples
    /// ```
    /// use tollgate::config::LimiterConfig;
    /// let cfg = LimiterConfig::from_json_str(r#"{
    ///     "rules": {
    ///         "login": { "storage": "memory", "capacity": 5, "refill_rate": 0.1, "scope": "origin" }
    ///     }
    /// }"#).unwrap();
    /// assert_eq!(cfg.rules.len(), 1);
    /// ```
    pub fn from_json_str(raw: &str) -> Result<Self, LimiterError> {
        let doc: RawConfig = serde_json::from_str(raw)?;
        doc.settings.validate()?;

        let mut rules = BTreeMap::new();
        for (endpoint, value) in doc.rules {
            if endpoint.trim().is_empty() {
                return Err(LimiterError::invalid(endpoint, "endpoint id cannot be empty"));
            }
            let spec: RuleSpec = serde_json::from_value(value)
                .map_err(|e| LimiterError::invalid(endpoint.as_str(), e.to_string()))?;
            spec.validate().map_err(|e| LimiterError::invalid(endpoint.as_str(), e.to_string()))?;
            rules.insert(endpoint, spec);
        }

        Ok(Self { settings: doc.settings, rules })
    }

    /// Read and parse a configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LimiterError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&raw)?;
        tracing::info!(
            target: "tollgate::config",
            path = %path.display(),
            rules = config.rules.len(),
            "loaded rate limit configuration"
        );
        Ok(config)
    }
}
