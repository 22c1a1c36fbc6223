//! In-process bucket storage.
//!
//! Buckets live in a sharded [`DashMap`]. `check_and_consume` runs the whole
//! read-refill-decide-write step while holding the entry's shard lock, which
//! gives the same per-key atomicity the Redis script gives across processes.
//! Nothing is awaited while the lock is held.
//!
//! Expired buckets are dropped from the write path: at most once per TTL, the
//! first write past the deadline sweeps the whole map. A bucket therefore
//! outlives its last write by at most two TTLs, with or without a sweeper.

use super::{BucketLimits, BucketState, RateLimitStorage, StorageError};
use crate::algorithm::token_bucket;
use crate::clock::{Clock, SystemClock};
use crate::config::DEFAULT_BUCKET_TTL;
use crate::decision::Decision;
use crate::key::RateLimitKey;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: BucketState,
    expires_at_ms: u64,
}

impl Slot {
    fn live(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// Bucket storage held in process memory.
///
/// Clones share the same buckets. Each write refreshes the bucket's expiry;
/// an expired bucket reads as absent (full) and is physically dropped by the
/// periodic in-line sweep, [`purge_expired`](Self::purge_expired), or a
/// sweeper task.
#[derive(Debug, Clone)]
pub struct InMemoryStorage {
    buckets: Arc<DashMap<String, Slot>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    /// Clock millis after which the next write sweeps expired buckets.
    next_sweep_ms: Arc<AtomicU64>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKET_TTL)
    }
}

impl InMemoryStorage {
    /// Storage on the system clock.
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(Arc::new(SystemClock), ttl)
    }

    /// Storage on an injected clock.
    pub fn with_clock(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { buckets: Arc::new(DashMap::new()), clock, ttl, next_sweep_ms: Arc::new(AtomicU64::new(0)) }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Buckets currently held, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    fn expiry_from(&self, now_ms: u64) -> u64 {
        let ttl_ms = u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX);
        now_ms.saturating_add(ttl_ms)
    }

    /// Drop expired buckets. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        purge(&self.buckets, self.clock.now_millis())
    }

    /// Sweep if the deadline has passed. Only the writer that wins the
    /// deadline update sweeps; the others return immediately.
    fn sweep_if_due(&self, now_ms: u64) {
        let due = self.next_sweep_ms.load(Ordering::Relaxed);
        if now_ms < due {
            return;
        }
        let next = self.expiry_from(now_ms);
        if self.next_sweep_ms.compare_exchange(due, next, Ordering::Relaxed, Ordering::Relaxed).is_err() {
            return;
        }
        let removed = purge(&self.buckets, now_ms);
        if removed > 0 {
            debug!(target: "tollgate::storage", backend = "memory", removed, "purged expired buckets");
        }
    }

    /// Purge expired buckets every `interval` on the current tokio runtime.
    ///
    /// The task holds only a weak reference and exits once every clone of
    /// this storage is dropped.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let buckets: Weak<DashMap<String, Slot>> = Arc::downgrade(&self.buckets);
        let clock = Arc::clone(&self.clock);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(buckets) = buckets.upgrade() else {
                    break;
                };
                let removed = purge(&buckets, clock.now_millis());
                if removed > 0 {
                    debug!(target: "tollgate::storage", removed, "purged expired buckets");
                }
            }
        })
    }
}

fn purge(buckets: &DashMap<String, Slot>, now_ms: u64) -> usize {
    let before = buckets.len();
    buckets.retain(|_, slot| slot.live(now_ms));
    before.saturating_sub(buckets.len())
}

#[async_trait]
impl RateLimitStorage for InMemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn check_and_consume(
        &self,
        key: &RateLimitKey,
        limits: BucketLimits,
        cost: u32,
    ) -> Result<Decision, StorageError> {
        let now_ms = self.clock.now_millis();
        let now = now_ms as f64 / 1_000.0;
        let expires_at_ms = self.expiry_from(now_ms);

        let decision = {
            let mut entry = self.buckets.entry(key.as_str().to_owned()).or_insert(Slot {
                state: BucketState::full(limits.capacity, now),
                expires_at_ms,
            });
            let previous = entry.live(now_ms).then_some(entry.state);
            let (state, decision) = token_bucket::apply(previous, limits, cost, now);
            *entry = Slot { state, expires_at_ms };
            decision
        };
        // The entry guard is released; sweeping locks every shard.
        self.sweep_if_due(now_ms);
        Ok(decision)
    }

    async fn peek(&self, key: &RateLimitKey, limits: BucketLimits) -> Result<f64, StorageError> {
        let now_ms = self.clock.now_millis();
        let tokens = match self.buckets.get(key.as_str()) {
            Some(slot) if slot.live(now_ms) => {
                token_bucket::refilled(&slot.state, limits, now_ms as f64 / 1_000.0)
            }
            _ => f64::from(limits.capacity),
        };
        Ok(tokens)
    }

    async fn reset(&self, key: &RateLimitKey) -> Result<(), StorageError> {
        self.buckets.remove(key.as_str());
        Ok(())
    }
}
