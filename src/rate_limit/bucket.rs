use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::policy::RateLimitPolicy;
use crate::rate_limit::store::{BucketStorage, DeductParams, RefillParams};
use crate::rate_limit::{bucket_ttl, BucketKey, RateLimitStatus};
use crate::timeout::StoreDeadline;
use std::sync::Arc;
use tracing::debug;

/// Token-bucket rate limiter backed by a shared [`BucketStorage`].
///
/// Cloning is cheap; clones share the storage handle and clock.
#[derive(Clone, Debug)]
pub struct TokenBucketStore {
    storage: Arc<dyn BucketStorage>,
    clock: Arc<dyn Clock>,
    deadline: StoreDeadline,
}

impl TokenBucketStore {
    /// Limiter over `storage` using wall-clock time and the default store deadline.
    pub fn new(storage: Arc<dyn BucketStorage>) -> Self {
        Self { storage, clock: Arc::new(SystemClock), deadline: StoreDeadline::default() }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the per-call store deadline.
    pub fn with_deadline(mut self, deadline: StoreDeadline) -> Self {
        self.deadline = deadline;
        self
    }

    /// Time source used for refill arithmetic.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Refill the bucket and report whether a request may proceed.
    ///
    /// The refilled state is persisted; nothing is charged. An `Err` means the store
    /// could not be consulted and the caller should allow the request.
    pub async fn check(
        &self,
        policy: &RateLimitPolicy,
        identifier: &str,
    ) -> Result<RateLimitStatus, StoreError> {
        let key = BucketKey::new(policy.name().clone(), identifier);
        let params = RefillParams {
            capacity: policy.capacity(),
            refill_per_minute: policy.refill_per_minute(),
            now_ms: self.clock.now_millis(),
            ttl: bucket_ttl(policy),
        };
        let state = self.deadline.run(self.storage.refill(&key, params)).await?;
        let remaining = state.tokens.min(policy.capacity());

        let status = RateLimitStatus {
            allowed: remaining > 0,
            remaining,
            limit: policy.capacity(),
            reset_at: state.last_refill_ms / 1_000 + policy.seconds_per_token(),
            policy: policy.name().clone(),
        };
        debug!(
            policy = %policy.name(),
            identifier,
            remaining,
            allowed = status.allowed,
            "rate limit check"
        );
        Ok(status)
    }

    /// Charge the cost of a response with `status_code` and return what was charged.
    ///
    /// Exempt outcomes (cost 0) never touch the store.
    pub async fn consume(
        &self,
        policy: &RateLimitPolicy,
        identifier: &str,
        status_code: u16,
    ) -> Result<u32, StoreError> {
        let cost = policy.cost_for_status(status_code);
        if cost == 0 {
            return Ok(0);
        }
        let key = BucketKey::new(policy.name().clone(), identifier);
        let params = DeductParams {
            capacity: policy.capacity(),
            cost,
            now_ms: self.clock.now_millis(),
            ttl: bucket_ttl(policy),
        };
        let left = self.deadline.run(self.storage.deduct(&key, params)).await?;
        debug!(policy = %policy.name(), identifier, status_code, cost, left, "rate limit charge");
        Ok(cost)
    }

    /// Refill the bucket to capacity.
    pub async fn reset(&self, policy: &RateLimitPolicy, identifier: &str) -> Result<(), StoreError> {
        let key = BucketKey::new(policy.name().clone(), identifier);
        let now_ms = self.clock.now_millis();
        self.deadline
            .run(self.storage.reset(&key, policy.capacity(), now_ms, bucket_ttl(policy)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::policy::{PolicyName, PolicyRegistry};
    use crate::rate_limit::store::InMemoryBucketStorage;
    use std::time::Duration;

    fn antiscan() -> RateLimitPolicy {
        PolicyRegistry::standard()
            .lookup("ENTRIES_READ_PARTICIPANT_ANTISCAN")
            .cloned()
            .expect("standard policy")
    }

    fn limiter(clock: &ManualClock) -> (TokenBucketStore, InMemoryBucketStorage) {
        let storage = InMemoryBucketStorage::new();
        let store = TokenBucketStore::new(Arc::new(storage.clone()))
            .with_clock(Arc::new(clock.clone()));
        (store, storage)
    }

    #[tokio::test]
    async fn first_check_creates_a_full_bucket() {
        let clock = ManualClock::starting_at(1_700_000_000_000);
        let (store, storage) = limiter(&clock);
        let policy = antiscan();

        let status = store.check(&policy, "participant-1").await.expect("check");
        assert!(status.allowed);
        assert_eq!(status.remaining, 50);
        assert_eq!(status.limit, 50);
        assert_eq!(status.reset_at, 1_700_000_000 + 30);
        assert_eq!(status.policy, PolicyName::ENTRIES_READ_PARTICIPANT_ANTISCAN);

        let key = BucketKey::new(policy.name().clone(), "participant-1");
        let stored = storage.peek(&key).expect("bucket persisted");
        assert_eq!(stored.last_refill_ms, 1_700_000_000_000);
    }

    #[tokio::test]
    async fn exempt_outcomes_are_free() {
        let clock = ManualClock::starting_at(0);
        let (store, storage) = limiter(&clock);
        let policy = antiscan();

        assert_eq!(store.consume(&policy, "p", 503).await.expect("consume"), 0);
        assert!(storage.is_empty());
        assert_eq!(store.consume(&policy, "p", 404).await.expect("consume"), 3);
        assert_eq!(store.check(&policy, "p").await.expect("check").remaining, 47);
    }

    #[tokio::test]
    async fn exhausted_bucket_is_denied_until_refill() {
        let clock = ManualClock::starting_at(0);
        let (store, _) = limiter(&clock);
        let policy = RateLimitPolicy::builder("TINY")
            .capacity(2)
            .refill_per_minute(2)
            .build()
            .expect("valid");

        store.consume(&policy, "p", 200).await.expect("consume");
        store.consume(&policy, "p", 200).await.expect("consume");
        let status = store.check(&policy, "p").await.expect("check");
        assert!(!status.allowed);
        assert_eq!(status.remaining, 0);

        clock.advance(Duration::from_secs(30));
        let status = store.check(&policy, "p").await.expect("check");
        assert!(status.allowed);
        assert_eq!(status.remaining, 1);
    }

    #[tokio::test]
    async fn reset_restores_capacity() {
        let clock = ManualClock::starting_at(0);
        let (store, _) = limiter(&clock);
        let policy = antiscan();
        for _ in 0..20 {
            store.consume(&policy, "p", 404).await.expect("consume");
        }
        assert_eq!(store.check(&policy, "p").await.expect("check").remaining, 0);
        store.reset(&policy, "p").await.expect("reset");
        assert_eq!(store.check(&policy, "p").await.expect("check").remaining, 50);
    }

    #[tokio::test]
    async fn buckets_are_isolated_per_identifier_and_policy() {
        let clock = ManualClock::starting_at(0);
        let (store, _) = limiter(&clock);
        let registry = PolicyRegistry::standard();
        let read = registry.lookup("ENTRIES_READ_PARTICIPANT_ANTISCAN").expect("read");
        let update = registry.lookup("ENTRIES_UPDATE").expect("update");

        store.consume(read, "a", 404).await.expect("consume");
        assert_eq!(store.check(read, "a").await.expect("check").remaining, 47);
        assert_eq!(store.check(read, "b").await.expect("check").remaining, 50);
        assert_eq!(store.check(update, "a").await.expect("check").remaining, 600);
    }
}
