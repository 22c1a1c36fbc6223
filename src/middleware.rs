//! Tower middleware that applies the admission engine to HTTP requests.
//!
//! For each request the layer:
//!
//! 1. maps `(method, path)` to an endpoint id through a static [`RouteTable`]
//!    (unmapped requests pass straight through);
//! 2. resolves the caller identity for the rule's scope with an
//!    [`IdentityResolver`];
//! 3. asks the [`RateLimiterService`] for a decision;
//! 4. either short-circuits with `429 Too Many Requests` or forwards the
//!    request and annotates the response with `X-RateLimit-*` headers.
//!
//! The layer adds no failure modes of its own: it never returns an error that
//! did not come from the wrapped service.
//!
//! `X-RateLimit-Remaining` reuses the count returned by the consume call. It is
//! informational and may be stale under concurrent load.

use crate::decision::{Admission, AdmissionBasis};
use crate::key::escape_component;
use crate::rule::{RateLimitRule, Scope};
use crate::service::RateLimiterService;
use arc_swap::ArcSwap;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::request::Parts;
use http::{Method, Request, Response, StatusCode};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;
use tracing::{debug, trace, warn};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

// ---------------------------------------------------------------------------
// Request extensions
// ---------------------------------------------------------------------------

/// Authenticated principal, inserted by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal(pub String);

/// Peer address of the connection, inserted by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub IpAddr);

/// Target resource, for `principal+resource` scoped rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceId(pub String);

/// Per-request token cost; overrides the route's cost. Zero is charged as one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestCost(pub u32);

// ---------------------------------------------------------------------------
// Route table
// ---------------------------------------------------------------------------

/// Endpoint a route maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub endpoint_id: Arc<str>,
    /// Tokens consumed per request.
    pub cost: u32,
}

impl Route {
    pub fn new(endpoint_id: impl AsRef<str>) -> Self {
        Self { endpoint_id: Arc::from(endpoint_id.as_ref()), cost: 1 }
    }

    /// Tokens each request on this route consumes.
    ///
    /// # Panics
    ///
    /// Panics if `cost` is zero.
    pub fn with_cost(mut self, cost: u32) -> Self {
        assert!(cost > 0, "route cost must be positive");
        self.cost = cost;
        self
    }
}

#[derive(Debug, Clone, Default)]
struct PathRoutes {
    any: Option<Route>,
    by_method: Vec<(Method, Route)>,
}

/// Static mapping from request path (and optionally method) to endpoint id.
///
/// Paths match exactly; lookups hash the borrowed path and allocate nothing.
/// A method-specific route wins over a path-wide one.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    paths: HashMap<String, PathRoutes>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map every method on `path` to `endpoint_id` at cost 1.
    pub fn route(mut self, path: impl Into<String>, endpoint_id: impl AsRef<str>) -> Self {
        self.insert(None, path, Route::new(endpoint_id));
        self
    }

    /// Map one method on `path` to `endpoint_id` at cost 1.
    pub fn method_route(
        mut self,
        method: Method,
        path: impl Into<String>,
        endpoint_id: impl AsRef<str>,
    ) -> Self {
        self.insert(Some(method), path, Route::new(endpoint_id));
        self
    }

    /// Map every method on `path` to `endpoint_id`, consuming `cost` tokens.
    ///
    /// # Panics
    ///
    /// Panics if `cost` is zero.
    pub fn weighted_route(
        mut self,
        path: impl Into<String>,
        endpoint_id: impl AsRef<str>,
        cost: u32,
    ) -> Self {
        self.insert(None, path, Route::new(endpoint_id).with_cost(cost));
        self
    }

    /// Add a route, returning the one it replaced.
    ///
    /// # Panics
    ///
    /// Panics if `route.cost` is zero.
    pub fn insert(&mut self, method: Option<Method>, path: impl Into<String>, route: Route) -> Option<Route> {
        assert!(route.cost > 0, "route cost must be positive");
        let path = path.into();
        let slot = self.paths.entry(path.clone()).or_default();
        let replaced = match method {
            None => slot.any.replace(route),
            Some(method) => match slot.by_method.iter_mut().find(|(m, _)| *m == method) {
                Some((_, existing)) => Some(std::mem::replace(existing, route)),
                None => {
                    slot.by_method.push((method, route));
                    None
                }
            },
        };
        if let Some(old) = &replaced {
            warn!(target: "tollgate::middleware", path = %path, endpoint = %old.endpoint_id, "route overwritten");
        }
        replaced
    }

    /// Route for a request, if mapped.
    pub fn resolve(&self, method: &Method, path: &str) -> Option<&Route> {
        let slot = self.paths.get(path)?;
        slot.by_method
            .iter()
            .find(|(m, _)| m == method)
            .map(|(_, r)| r)
            .or(slot.any.as_ref())
    }

    pub fn len(&self) -> usize {
        self.paths.values().map(|p| p.by_method.len() + usize::from(p.any.is_some())).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared, hot-swappable reference to the current [`RouteTable`].
#[derive(Debug, Clone)]
pub struct RouteTableHandle {
    inner: Arc<ArcSwap<RouteTable>>,
}

impl RouteTableHandle {
    pub fn new(table: RouteTable) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(table)) }
    }

    pub fn snapshot(&self) -> Arc<RouteTable> {
        self.inner.load_full()
    }

    /// Publish a replacement table; returns the previous one.
    pub fn swap(&self, table: RouteTable) -> Arc<RouteTable> {
        let previous = self.inner.swap(Arc::new(table));
        debug!(target: "tollgate::middleware", routes = self.inner.load().len(), "route table swapped");
        previous
    }
}

impl Default for RouteTableHandle {
    fn default() -> Self {
        Self::new(RouteTable::default())
    }
}

// ---------------------------------------------------------------------------
// Identity resolution
// ---------------------------------------------------------------------------

/// Derives the caller identity for a request under a given scope.
///
/// Any `Fn(&Parts, Scope) -> String` closure is a resolver.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, parts: &Parts, scope: Scope) -> String;
}

impl<F> IdentityResolver for F
where
    F: Fn(&Parts, Scope) -> String + Send + Sync,
{
    fn resolve(&self, parts: &Parts, scope: Scope) -> String {
        self(parts, scope)
    }
}

/// Principal when authenticated, network origin otherwise.
///
/// Each caller-controlled part (address, principal id, resource id) is passed
/// through [`escape_component`], so the `:` separators in the result are
/// always the resolver's own.
///
/// Origin is the [`ClientAddr`] extension, then `"unknown"`. With
/// `trust_forwarded_headers(true)` the first `X-Forwarded-For` hop and then
/// `X-Real-IP` take precedence; enable it only behind a proxy that overwrites
/// those headers, since otherwise a client picks its own origin.
#[derive(Debug, Clone, Copy)]
pub struct DefaultIdentityResolver {
    trust_forwarded_headers: bool,
}

impl Default for DefaultIdentityResolver {
    fn default() -> Self {
        Self { trust_forwarded_headers: false }
    }
}

impl DefaultIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trust_forwarded_headers(mut self, trust: bool) -> Self {
        self.trust_forwarded_headers = trust;
        self
    }

    fn origin(&self, parts: &Parts) -> String {
        let forwarded = if self.trust_forwarded_headers {
            header_str(parts, X_FORWARDED_FOR)
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .or_else(|| header_str(parts, X_REAL_IP).map(str::trim).filter(|v| !v.is_empty()))
                .map(str::to_owned)
        } else {
            None
        };
        let addr = forwarded
            .or_else(|| parts.extensions.get::<ClientAddr>().map(|a| a.0.to_string()))
            .unwrap_or_else(|| "unknown".to_string());
        format!("origin:{}", escape_component(&addr))
    }

    fn principal_or_origin(&self, parts: &Parts) -> String {
        match parts.extensions.get::<Principal>() {
            Some(Principal(id)) if !id.is_empty() => format!("principal:{}", escape_component(id)),
            _ => self.origin(parts),
        }
    }
}

impl IdentityResolver for DefaultIdentityResolver {
    fn resolve(&self, parts: &Parts, scope: Scope) -> String {
        match scope {
            Scope::Origin | Scope::Endpoint => self.origin(parts),
            Scope::Principal => self.principal_or_origin(parts),
            Scope::PrincipalAndResource => {
                let base = self.principal_or_origin(parts);
                match parts.extensions.get::<ResourceId>() {
                    Some(ResourceId(id)) => format!("{base}:resource:{}", escape_component(id)),
                    None => base,
                }
            }
        }
    }
}

fn header_str<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}

// ---------------------------------------------------------------------------
// Layer / service
// ---------------------------------------------------------------------------

/// A [`Layer`] that wraps services with [`RateLimitMiddleware`].
#[derive(Clone)]
pub struct RateLimitLayer {
    service: RateLimiterService,
    routes: RouteTableHandle,
    resolver: Arc<dyn IdentityResolver>,
}

impl fmt::Debug for RateLimitLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitLayer").field("service", &self.service).finish_non_exhaustive()
    }
}

impl RateLimitLayer {
    pub fn new(service: RateLimiterService, routes: RouteTable) -> Self {
        Self::with_route_handle(service, RouteTableHandle::new(routes))
    }

    /// Share a route table that may be swapped at runtime.
    pub fn with_route_handle(service: RateLimiterService, routes: RouteTableHandle) -> Self {
        Self { service, routes, resolver: Arc::new(DefaultIdentityResolver::default()) }
    }

    /// Replace the identity resolver.
    pub fn with_resolver(mut self, resolver: impl IdentityResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn routes(&self) -> &RouteTableHandle {
        &self.routes
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitMiddleware {
            inner,
            service: self.service.clone(),
            routes: self.routes.clone(),
            resolver: Arc::clone(&self.resolver),
        }
    }
}

/// Middleware service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitMiddleware<S> {
    inner: S,
    service: RateLimiterService,
    routes: RouteTableHandle,
    resolver: Arc<dyn IdentityResolver>,
}

impl<S: fmt::Debug> fmt::Debug for RateLimitMiddleware<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitMiddleware").field("inner", &self.inner).finish_non_exhaustive()
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimitMiddleware<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // Take the service that was polled ready and leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let service = self.service.clone();
        let resolver = Arc::clone(&self.resolver);
        let routes = self.routes.snapshot();

        Box::pin(async move {
            let Some(route) = routes.resolve(req.method(), req.uri().path()).cloned() else {
                trace!(target: "tollgate::middleware", path = req.uri().path(), "unmapped route");
                return inner.call(req).await;
            };

            let (parts, body) = req.into_parts();
            let cost = parts.extensions.get::<RequestCost>().map_or(route.cost, |c| c.0);
            let rule = service.rule_for(&route.endpoint_id);
            let scope = rule.as_ref().map_or(Scope::Origin, |r| r.scope());
            let identity = resolver.resolve(&parts, scope);
            let req = Request::from_parts(parts, body);

            let admission = service.admit(&route.endpoint_id, rule, &identity, cost).await;
            let Some(rule) = admission.rule.clone().filter(|_| admission.is_enforced()) else {
                return inner.call(req).await;
            };

            if !admission.is_allowed() {
                debug!(
                    target: "tollgate::middleware",
                    endpoint = %route.endpoint_id,
                    identity = %identity,
                    retry_after = admission.retry_after(),
                    "rejecting request"
                );
                return Ok(throttled_response(&admission, &rule));
            }

            let mut response = inner.call(req).await?;
            annotate(&mut response, &admission, &rule);
            Ok(response)
        })
    }
}

/// Seconds until an admitted bucket is full again.
fn reset_after_secs(admission: &Admission, rule: &RateLimitRule) -> u64 {
    let deficit = (f64::from(rule.capacity()) - admission.decision.remaining).max(0.0);
    (deficit / rule.refill_rate()).ceil() as u64
}

fn annotate<B>(response: &mut Response<B>, admission: &Admission, rule: &RateLimitRule) {
    debug_assert_eq!(admission.basis, AdmissionBasis::Enforced);
    let headers = response.headers_mut();
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(rule.capacity()));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(admission.decision.remaining_whole()));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_after_secs(admission, rule)));
}

/// The `429` rejection: JSON body plus `Retry-After` and rate headers.
///
/// A request that costs more than the bucket holds gets no `Retry-After` or
/// `X-RateLimit-Reset`, and `"retry_after": null` in the body.
pub fn throttled_response<B: From<String>>(admission: &Admission, rule: &RateLimitRule) -> Response<B> {
    let retry_after = admission.decision.retry_after_header_secs();
    let message = match retry_after {
        Some(secs) => format!("Too many requests. Retry in {secs} seconds."),
        None => format!("Request cost exceeds the limit of {} tokens.", rule.capacity()),
    };
    let body = serde_json::json!({
        "error": "rate_limit_exceeded",
        "message": message,
        "retry_after": retry_after,
    })
    .to_string();

    let mut response = Response::new(B::from(body));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(rule.capacity()));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(0u64));
    if let Some(secs) = retry_after {
        headers.insert(RETRY_AFTER, HeaderValue::from(secs));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(secs));
    }
    response
}
