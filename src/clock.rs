//! Wall-clock abstraction shared by the bucket and idempotency components.
//!
//! Bucket refill and record expiry are computed from absolute timestamps that every
//! server instance writes into the shared store, so this is a wall clock (unix
//! epoch), not a monotonic one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds since the unix epoch.
    fn now_millis(&self) -> u64;

    /// Whole seconds since the unix epoch.
    fn now_secs(&self) -> u64 {
        self.now_millis() / 1_000
    }
}

/// Clock backed by `SystemTime::now()`.
///
/// Instances sharing a store should run NTP; refill is computed from whichever
/// instance touches the bucket, so skew shows up as early or late refill.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        u64::try_from(since_epoch.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Manually driven clock for deterministic tests and simulations.
///
/// Clones share the same instant.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Start at `millis` since the epoch.
    pub fn starting_at(millis: u64) -> Self {
        Self { now: Arc::new(AtomicU64::new(millis)) }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        let millis = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    /// Jump to an absolute instant.
    pub fn set_millis(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
