//! Distributed token buckets.
//!
//! - [`TokenBucketStore`]: the per-request API (`check`, `consume`, `reset`).
//! - [`BucketStorage`]: the atomic primitives a shared store must provide. The
//!   in-memory implementation lives in [`store`]; the Redis one in `tollgate-redis`.
//!
//! # Algorithm
//!
//! Refill-on-read: nothing runs in the background. Each `check` credits
//! `floor(elapsed_minutes * refill_per_minute)` tokens since the last credit, capped at
//! capacity, and persists the result. `consume` subtracts the outcome cost, floored at
//! zero. Both run as one atomic unit inside the store, so concurrent instances never
//! compute conflicting post-states from the same pre-state.

use crate::policy::{PolicyName, RateLimitPolicy};
use std::fmt;
use std::time::Duration;

pub mod bucket;
pub mod store;

pub use bucket::TokenBucketStore;
pub use store::{BucketState, BucketStorage, DeductParams, InMemoryBucketStorage, RefillParams};

/// Lower bound for the idle expiry of a bucket.
pub const MIN_BUCKET_TTL: Duration = Duration::from_secs(120);

/// Identity of one bucket: a policy applied to one caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    policy: PolicyName,
    identifier: String,
}

impl BucketKey {
    /// Bucket for `identifier` under `policy`.
    pub fn new(policy: PolicyName, identifier: impl Into<String>) -> Self {
        Self { policy, identifier: identifier.into() }
    }

    /// Policy component.
    pub fn policy(&self) -> &PolicyName {
        &self.policy
    }

    /// Caller component.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Store key holding the token count.
    pub fn tokens_key(&self) -> String {
        format!("{}:tokens", self)
    }

    /// Store key holding the last refill timestamp (ms).
    pub fn last_refill_key(&self) -> String {
        format!("{}:last_refill", self)
    }
}

/// `rate_limit:{POLICY:identifier}`; the braces keep both fields in one cluster slot.
impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rate_limit:{{{}:{}}}", self.policy, self.identifier)
    }
}

/// Result of a [`TokenBucketStore::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// `remaining > 0`.
    pub allowed: bool,
    /// Tokens in the bucket after refill, before this request is charged.
    pub remaining: u32,
    /// Bucket capacity (`X-RateLimit-Limit`).
    pub limit: u32,
    /// Unix second at which the next token is credited.
    pub reset_at: u64,
    /// Policy that produced this status.
    pub policy: PolicyName,
}

impl RateLimitStatus {
    /// Seconds a denied caller should wait, never less than one.
    pub fn retry_after_secs(&self, now_secs: u64) -> u64 {
        self.reset_at.saturating_sub(now_secs).max(1)
    }
}

/// Idle expiry for a policy's buckets.
///
/// Twice the time needed to refill an empty bucket, so an expired bucket (recreated
/// full) never hands out tokens sooner than waiting would have.
pub fn bucket_ttl(policy: &RateLimitPolicy) -> Duration {
    let full_refill_secs = (u64::from(policy.capacity()) * 60)
        .div_ceil(u64::from(policy.refill_per_minute()));
    Duration::from_secs(full_refill_secs.saturating_mul(2)).max(MIN_BUCKET_TTL)
}
