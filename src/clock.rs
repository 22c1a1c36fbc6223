//! Clock abstractions used by the token bucket math and bucket expiry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Clock abstraction so timing can be faked in tests.
///
/// Bucket state may be shared by several processes through a remote store, so
/// readings are wall-clock milliseconds since the Unix epoch rather than a
/// process-local monotonic instant.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;

    /// Current time in fractional seconds since the epoch.
    fn now_secs(&self) -> f64 {
        self.now_millis() as f64 / 1_000.0
    }
}

/// Wall clock backed by `SystemTime::now()`.
///
/// A clock set before the epoch reads as 0; the refill math clamps negative
/// elapsed time, so a backwards jump only delays refill.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        let elapsed = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Manually advanced clock for deterministic tests and simulations.
///
/// Clones share the same reading.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Start at `millis` since the epoch.
    pub fn new(millis: u64) -> Self {
        Self { now: Arc::new(AtomicU64::new(millis)) }
    }

    /// Move time forward.
    pub fn advance_millis(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    /// Move time forward by fractional seconds (rounded to the millisecond).
    pub fn advance_secs(&self, secs: f64) {
        self.advance_millis((secs * 1_000.0).round() as u64);
    }

    /// Jump to an absolute reading; may move backwards to simulate skew.
    pub fn set_millis(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(1_000);
        let other = clock.clone();
        clock.advance_millis(500);
        assert_eq!(other.now_millis(), 1_500);
        other.advance_secs(0.25);
        assert_eq!(clock.now_millis(), 1_750);
        assert!((clock.now_secs() - 1.75).abs() < f64::EPSILON);
    }

    #[test]
    fn manual_clock_can_move_backwards() {
        let clock = ManualClock::new(10_000);
        clock.set_millis(5_000);
        assert_eq!(clock.now_millis(), 5_000);
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now_millis() > 1_577_836_800_000);
    }
}
