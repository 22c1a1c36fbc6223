//! Redis storage backend for tollgate.
//!
//! Each check is one `EVALSHA` of a Lua script that reads the bucket hash,
//! applies refill, decides, writes the new state, and refreshes the TTL. Redis
//! runs scripts one at a time, so no other client can interleave between the
//! read and the write.
//!
//! Wire format: the key is the engine's bucket key
//! (`ratelimit:{scope}:{identity}:{endpoint_id}` with the default prefix), a
//! hash with fields `tokens` and `last_refill` (epoch seconds).
//!
//! Time comes from the calling process and is passed to the script, so every
//! instance sharing a bucket must have a reasonably synchronized clock. Skew
//! that moves time backwards is clamped to zero elapsed time.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tollgate::{RateLimiterService, StorageKind};
//! use tollgate_redis::RedisStorage;
//!
//! let redis = RedisStorage::connect("redis://127.0.0.1/").await?;
//! let limiter = RateLimiterService::builder()
//!     .config(config)
//!     .storage(StorageKind::Redis, Arc::new(redis))
//!     .build()?;
//! ```

#![forbid(unsafe_code)]

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tollgate::algorithm::token_bucket;
use tollgate::config::DEFAULT_BUCKET_TTL;
use tollgate::{
    BucketLimits, BucketState, Clock, Decision, RateLimitKey, RateLimitStorage, StorageError,
    SystemClock,
};
use tracing::{debug, info};

const BACKEND: &str = "redis";

/// The token bucket step, executed atomically inside Redis.
///
/// KEYS[1] bucket key; ARGV: capacity, refill_rate, cost, now (epoch secs),
/// ttl (secs). Numbers are returned as strings because Redis truncates Lua
/// floats to integers in replies.
pub const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local state = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])
if tokens == nil or last_refill == nil then
  tokens = capacity
  last_refill = now
end

local elapsed = math.max(0, now - last_refill)
tokens = math.max(0, math.min(capacity, tokens + elapsed * refill_rate))

local allowed = 0
local retry_after = 0
if tokens >= cost then
  tokens = tokens - cost
  allowed = 1
else
  retry_after = (cost - tokens) / refill_rate
end

redis.call('HSET', key, 'tokens', tostring(tokens), 'last_refill', tostring(now))
redis.call('EXPIRE', key, ttl)
return {allowed, tostring(retry_after), tostring(tokens)}
"#;

/// Configuration for [`RedisStorage`].
#[derive(Debug, Clone)]
pub struct RedisStorageConfig {
    /// Expiry refreshed on every write (default: 1 hour).
    pub ttl: Duration,
}

impl Default for RedisStorageConfig {
    fn default() -> Self {
        Self { ttl: DEFAULT_BUCKET_TTL }
    }
}

/// Bucket storage shared across processes through Redis.
///
/// Clones share one multiplexed connection.
#[derive(Clone)]
pub struct RedisStorage {
    connection: ConnectionManager,
    script: Arc<Script>,
    config: RedisStorageConfig,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStorage").field("config", &self.config).finish_non_exhaustive()
    }
}

impl RedisStorage {
    /// Connect with the default configuration.
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        Self::connect_with_config(url, RedisStorageConfig::default()).await
    }

    pub async fn connect_with_config(url: &str, config: RedisStorageConfig) -> Result<Self, RedisError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!(target: "tollgate::storage", backend = BACKEND, ttl = ?config.ttl, "connected to redis");
        Ok(Self::new(connection, config))
    }

    /// Use an existing connection manager.
    pub fn new(connection: ConnectionManager, config: RedisStorageConfig) -> Self {
        Self {
            connection,
            script: Arc::new(Script::new(TOKEN_BUCKET_SCRIPT)),
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock that stamps `now` for the script.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &RedisStorageConfig {
        &self.config
    }

    fn ttl_secs(&self) -> u64 {
        self.config.ttl.as_secs().max(1)
    }
}

fn unavailable(e: RedisError) -> StorageError {
    StorageError::unavailable(BACKEND, e)
}

fn parse_number(field: &str, raw: &str) -> Result<f64, StorageError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| StorageError::unavailable(BACKEND, format!("malformed {field} in script reply: {raw:?}")))
}

/// Convert the script's `{allowed, retry_after, remaining}` reply.
pub fn parse_reply(allowed: i64, retry_after: &str, remaining: &str) -> Result<Decision, StorageError> {
    let retry_after = parse_number("retry_after", retry_after)?;
    let remaining = parse_number("remaining", remaining)?;
    match allowed {
        1 => Ok(Decision::allow(remaining)),
        0 => Ok(Decision::deny(retry_after, remaining)),
        other => Err(StorageError::unavailable(BACKEND, format!("unexpected allowed flag {other}"))),
    }
}

#[async_trait]
impl RateLimitStorage for RedisStorage {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn check_and_consume(
        &self,
        key: &RateLimitKey,
        limits: BucketLimits,
        cost: u32,
    ) -> Result<Decision, StorageError> {
        let mut conn = self.connection.clone();
        let now = self.clock.now_secs();
        let (allowed, retry_after, remaining): (i64, String, String) = self
            .script
            .key(key.as_str())
            .arg(limits.capacity)
            .arg(limits.refill_rate)
            .arg(cost)
            .arg(now)
            .arg(self.ttl_secs())
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        let decision = parse_reply(allowed, &retry_after, &remaining)?;
        debug!(
            target: "tollgate::storage",
            backend = BACKEND,
            key = %key,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "bucket checked"
        );
        Ok(decision)
    }

    async fn peek(&self, key: &RateLimitKey, limits: BucketLimits) -> Result<f64, StorageError> {
        let mut conn = self.connection.clone();
        let (tokens, last_refill): (Option<f64>, Option<f64>) = redis::cmd("HMGET")
            .arg(key.as_str())
            .arg("tokens")
            .arg("last_refill")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        let tokens = match (tokens, last_refill) {
            (Some(tokens), Some(last_refill)) => {
                token_bucket::refilled(&BucketState { tokens, last_refill }, limits, self.clock.now_secs())
            }
            _ => f64::from(limits.capacity),
        };
        Ok(tokens)
    }

    async fn reset(&self, key: &RateLimitKey) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let removed: i64 = redis::cmd("DEL").arg(key.as_str()).query_async(&mut conn).await.map_err(unavailable)?;
        debug!(target: "tollgate::storage", backend = BACKEND, key = %key, removed, "bucket reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_allow_reply() {
        let d = parse_reply(1, "0", "9").unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 9.0);
    }

    #[test]
    fn parses_deny_reply_with_fraction() {
        let d = parse_reply(0, "0.25", "0.5").unwrap();
        assert!(!d.allowed);
        assert!((d.retry_after - 0.25).abs() < 1e-12);
        assert!((d.remaining - 0.5).abs() < 1e-12);
    }

    #[test]
    fn malformed_reply_is_storage_unavailable() {
        let err = parse_reply(1, "nan", "1").unwrap_err();
        assert!(matches!(err, StorageError::Unavailable { backend: "redis", .. }));
        assert!(parse_reply(1, "0", "abc").is_err());
        assert!(parse_reply(7, "0", "1").is_err());
    }

    #[test]
    fn script_returns_numbers_as_strings() {
        assert!(TOKEN_BUCKET_SCRIPT.contains("tostring(retry_after)"));
        assert!(TOKEN_BUCKET_SCRIPT.contains("redis.call('EXPIRE', key, ttl)"));
    }

    #[test]
    fn default_ttl_is_one_hour() {
        assert_eq!(RedisStorageConfig::default().ttl, Duration::from_secs(3600));
    }
}
