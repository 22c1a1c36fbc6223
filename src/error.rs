//! Error taxonomy for the admission engine.
//!
//! Only configuration problems ever reach a caller as an `Err`. Every other
//! variant is logged where it happens and converted into an admission, so the
//! limiter can never be the reason a protected service stops answering.

use crate::storage::StorageError;

/// Errors produced by the admission engine.
#[derive(thiserror::Error, Debug)]
pub enum LimiterError {
    /// No rule is registered for the endpoint. Treated as allow.
    #[error("no rate limit rule configured for endpoint '{endpoint}'")]
    RuleNotConfigured {
        /// Endpoint identifier that had no rule.
        endpoint: String,
    },
    /// The rule exists but is switched off. Treated as allow.
    #[error("rate limit rule for endpoint '{endpoint}' is disabled")]
    RuleDisabled {
        /// Endpoint identifier whose rule is disabled.
        endpoint: String,
    },
    /// The storage backend could not answer. Treated as allow.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] StorageError),
    /// A rule failed validation. Fatal at startup.
    #[error("invalid configuration for endpoint '{endpoint}': {reason}")]
    ConfigurationInvalid {
        /// Endpoint identifier of the offending rule (or `*` for global settings).
        endpoint: String,
        /// Human readable explanation.
        reason: String,
    },
    /// Unexpected failure inside the decision logic. Treated as allow.
    #[error("algorithm internal error: {0}")]
    AlgorithmInternal(String),
    /// The configuration document could not be read.
    #[error("failed to read configuration: {0}")]
    ConfigIo(#[from] std::io::Error),
    /// The configuration document is not valid JSON for the expected shape.
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

impl LimiterError {
    /// Shorthand for a `ConfigurationInvalid` error.
    pub fn invalid(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigurationInvalid { endpoint: endpoint.into(), reason: reason.into() }
    }

    /// True for every variant the engine resolves by admitting the request.
    pub fn fails_open(&self) -> bool {
        matches!(
            self,
            Self::RuleNotConfigured { .. }
                | Self::RuleDisabled { .. }
                | Self::StorageUnavailable(_)
                | Self::AlgorithmInternal(_)
        )
    }

    /// True if this error must abort startup.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConfigurationInvalid { .. } | Self::ConfigIo(_) | Self::ConfigParse(_))
    }
}
