//! Bucket key derivation.
//!
//! A key is `{prefix}:{scope}:{identity}:{endpoint_id}`. Two requests share a
//! bucket iff they agree on scope, identity and endpoint; this is the only
//! isolation boundary between callers.
//!
//! Identities carry their own `:` separators (`origin:2001:db8::1`,
//! `principal:u1:resource:doc`), so the endpoint id is escaped instead: `%`
//! becomes `%25` and `:` becomes `%3A`. The endpoint is then everything after
//! the last `:`, the scope never contains one, and the key decodes back to a
//! single `(scope, identity, endpoint)` triple.

use crate::rule::Scope;
use std::borrow::Cow;
use std::fmt;

/// Identity component used by [`Scope::Endpoint`] keys: every caller shares it.
pub const SHARED_IDENTITY: &str = "*";

/// Fully qualified bucket key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    /// Derive the key for a request.
    ///
    /// `identity` is ignored for [`Scope::Endpoint`], which keys on
    /// [`SHARED_IDENTITY`] instead.
    pub fn new(prefix: &str, scope: Scope, identity: &str, endpoint_id: &str) -> Self {
        let identity = match scope {
            Scope::Endpoint => SHARED_IDENTITY,
            _ => identity,
        };
        Self(format!("{}:{}:{}:{}", prefix, scope.as_str(), identity, escape_component(endpoint_id)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Escape `%` and `:` so `raw` can sit between `:` separators unambiguously.
pub fn escape_component(raw: &str) -> Cow<'_, str> {
    if !raw.contains(|c| c == ':' || c == '%') {
        return Cow::Borrowed(raw);
    }
    let mut out = String::with_capacity(raw.len() + 8);
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RateLimitKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
