//! Convenient re-exports for common Tollgate types.
pub use crate::{
    audit::{AuditSink, MemoryAuditSink, NonBlockingAuditSink, TracingAuditSink, ViolationEvent},
    clock::{Clock, ManualClock, SystemClock},
    config::{LimiterConfig, Settings},
    decision::{Admission, AdmissionBasis, Decision},
    middleware::{
        ClientAddr, DefaultIdentityResolver, IdentityResolver, Principal, RateLimitLayer,
        RequestCost, ResourceId, RouteTable, RouteTableHandle,
    },
    registry::{RegistryHandle, RuleRegistry},
    rule::{RateLimitRule, Scope, StorageKind},
    storage::{InMemoryStorage, RateLimitStorage, StorageError},
    LimiterError, RateLimiterService,
};
