#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Tollgate
//!
//! Request admission control for async Rust services: per-endpoint token
//! bucket rules, atomic bucket storage (in-process or Redis), and a tower
//! layer that turns decisions into `429 Too Many Requests`.
//!
//! ## Features
//!
//! - **Rule registry** loaded from JSON, validated fail-fast, hot-swappable
//! - **Token bucket** with continuous refill and weighted request cost
//! - **Scoped buckets** per origin, principal, endpoint, or principal + resource
//! - **Atomic storage**: sharded in-memory map, or one Redis script per check
//!   (see the `tollgate-redis` crate)
//! - **Fail open** everywhere: storage outages and internal errors admit traffic
//! - **Audit sinks** for violation events
//!
//! ## Quick Start
//!
//! ```rust
//! use tollgate::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), LimiterError> {
//! let config = LimiterConfig::from_json_str(r#"{
//!     "rules": {
//!         "login": { "storage": "memory", "capacity": 2, "refill_rate": 0.5, "scope": "origin" }
//!     }
//! }"#)?;
//! let limiter = RateLimiterService::builder().config(config).build()?;
//!
//! assert!(limiter.is_allowed("login", "origin:10.0.0.1", 1).await.is_allowed());
//! assert!(limiter.is_allowed("login", "origin:10.0.0.1", 1).await.is_allowed());
//! assert!(!limiter.is_allowed("login", "origin:10.0.0.1", 1).await.is_allowed());
//! # Ok(())
//! # }
//! ```

pub mod algorithm;
pub mod audit;
pub mod clock;
pub mod config;
pub mod decision;
pub mod error;
pub mod key;
pub mod middleware;
pub mod prelude;
pub mod registry;
pub mod rule;
pub mod service;
pub mod storage;

// Re-exports
pub use algorithm::{RateLimitAlgorithm, TokenBucketAlgorithm};
pub use audit::{AuditSink, MemoryAuditSink, NonBlockingAuditSink, TracingAuditSink, ViolationEvent};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{LimiterConfig, Settings};
pub use decision::{Admission, AdmissionBasis, Decision};
pub use error::LimiterError;
pub use key::RateLimitKey;
pub use middleware::{RateLimitLayer, RateLimitMiddleware, RouteTable, RouteTableHandle};
pub use registry::{RegistryHandle, RuleRegistry};
pub use rule::{AlgorithmKind, RateLimitRule, RuleSpec, Scope, StorageKind};
pub use service::{AdmissionStats, RateLimiterService, RateLimiterServiceBuilder};
pub use storage::{BucketLimits, BucketState, InMemoryStorage, RateLimitStorage, StorageError, TimeoutStorage};
