use crate::error::StoreError;
use crate::rate_limit::BucketKey;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MILLIS_PER_MINUTE: u128 = 60_000;

/// Persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    /// Current token count, `0 ..= capacity`.
    pub tokens: u32,
    /// When tokens were last credited (unix ms).
    pub last_refill_ms: u64,
}

impl BucketState {
    /// A bucket created at `now_ms` starts full.
    pub fn full(capacity: u32, now_ms: u64) -> Self {
        Self { tokens: capacity, last_refill_ms: now_ms }
    }
}

/// Inputs of the atomic read-refill-write step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefillParams {
    /// Bucket capacity.
    pub capacity: u32,
    /// Tokens credited per minute.
    pub refill_per_minute: u32,
    /// Caller's current time (unix ms).
    pub now_ms: u64,
    /// Idle expiry re-applied on every mutation.
    pub ttl: Duration,
}

/// Inputs of the atomic subtract step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeductParams {
    /// Bucket capacity (state of an absent bucket).
    pub capacity: u32,
    /// Tokens to remove.
    pub cost: u32,
    /// Caller's current time (unix ms).
    pub now_ms: u64,
    /// Idle expiry re-applied on every mutation.
    pub ttl: Duration,
}

/// Atomic primitives a shared store must provide for token buckets.
///
/// Each method must execute as a single indivisible unit against the store (a
/// server-side script, a transaction, or a critical section). Implementations must
/// not split them into a read followed by a separate write.
#[async_trait]
pub trait BucketStorage: Send + Sync + std::fmt::Debug {
    /// Apply owed refill and return the resulting state.
    ///
    /// An absent bucket is created full at `now_ms` and persisted.
    async fn refill(&self, key: &BucketKey, params: RefillParams)
        -> Result<BucketState, StoreError>;

    /// Subtract `cost` tokens, flooring at zero. Returns the tokens left.
    async fn deduct(&self, key: &BucketKey, params: DeductParams) -> Result<u32, StoreError>;

    /// Force the bucket back to full capacity.
    async fn reset(
        &self,
        key: &BucketKey,
        capacity: u32,
        now_ms: u64,
        ttl: Duration,
    ) -> Result<(), StoreError>;
}

/// Pure refill step shared by every storage implementation.
///
/// Credits are computed from absolute timestamps. When tokens are credited without
/// hitting capacity, `last_refill_ms` advances by exactly the time those tokens
/// represent, so the fractional remainder carries over and checking more often never
/// yields fewer tokens. A bucket that reaches capacity banks no time.
pub fn refill_state(prior: Option<BucketState>, params: &RefillParams) -> BucketState {
    let Some(state) = prior else {
        return BucketState::full(params.capacity, params.now_ms);
    };
    let tokens = state.tokens.min(params.capacity);
    let rate = u128::from(params.refill_per_minute);
    let elapsed = u128::from(params.now_ms.saturating_sub(state.last_refill_ms));
    let credited = elapsed * rate / MILLIS_PER_MINUTE;

    if credited == 0 {
        return BucketState { tokens, ..state };
    }

    let total = u128::from(tokens) + credited;
    if total >= u128::from(params.capacity) {
        return BucketState::full(params.capacity, params.now_ms);
    }

    let consumed_ms = u64::try_from(credited * MILLIS_PER_MINUTE / rate).unwrap_or(u64::MAX);
    BucketState {
        // total < capacity <= u32::MAX
        tokens: total as u32,
        last_refill_ms: state.last_refill_ms.saturating_add(consumed_ms),
    }
}

/// Pure subtract step shared by every storage implementation.
pub fn deduct_state(prior: Option<BucketState>, params: &DeductParams) -> BucketState {
    let state = prior.unwrap_or_else(|| BucketState::full(params.capacity, params.now_ms));
    BucketState {
        tokens: state.tokens.min(params.capacity).saturating_sub(params.cost),
        last_refill_ms: state.last_refill_ms,
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: BucketState,
    expires_at_ms: u64,
}

/// In-process bucket storage.
///
/// Every operation is one critical section over the map, which makes it atomic for
/// all tasks sharing the instance. Expiry is evaluated against the `now_ms` the caller
/// passes in, so it follows whatever clock drives the bucket store.
#[derive(Default, Clone, Debug)]
pub struct InMemoryBucketStorage {
    data: Arc<Mutex<HashMap<String, Entry>>>,
}

impl InMemoryBucketStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored state, ignoring expiry. Intended for tests and diagnostics.
    pub fn peek(&self, key: &BucketKey) -> Option<BucketState> {
        let guard = self.data.lock().ok()?;
        guard.get(&key.to_string()).map(|e| e.state)
    }

    /// Number of stored buckets, expired or not.
    pub fn len(&self) -> usize {
        self.data.lock().map(|g| g.len()).unwrap_or(0)
    }

    /// Whether no bucket is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop buckets whose idle expiry has passed at `now_ms`.
    pub fn purge_expired(&self, now_ms: u64) {
        if let Ok(mut guard) = self.data.lock() {
            guard.retain(|_, e| e.expires_at_ms > now_ms);
        }
    }

    fn mutate<F>(
        &self,
        key: &BucketKey,
        now_ms: u64,
        ttl: Duration,
        f: F,
    ) -> Result<BucketState, StoreError>
    where
        F: FnOnce(Option<BucketState>) -> BucketState,
    {
        let mut guard =
            self.data.lock().map_err(|_| StoreError::malformed("bucket map lock poisoned"))?;
        let slot = key.to_string();
        let live = guard.get(&slot).filter(|e| e.expires_at_ms > now_ms).map(|e| e.state);
        let next = f(live);
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        guard.insert(slot, Entry { state: next, expires_at_ms: now_ms.saturating_add(ttl_ms) });
        Ok(next)
    }
}

#[async_trait]
impl BucketStorage for InMemoryBucketStorage {
    async fn refill(
        &self,
        key: &BucketKey,
        params: RefillParams,
    ) -> Result<BucketState, StoreError> {
        self.mutate(key, params.now_ms, params.ttl, |prior| refill_state(prior, &params))
    }

    async fn deduct(&self, key: &BucketKey, params: DeductParams) -> Result<u32, StoreError> {
        self.mutate(key, params.now_ms, params.ttl, |prior| deduct_state(prior, &params))
            .map(|s| s.tokens)
    }

    async fn reset(
        &self,
        key: &BucketKey,
        capacity: u32,
        now_ms: u64,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.mutate(key, now_ms, ttl, |_| BucketState::full(capacity, now_ms)).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyName;

    const MINUTE: u64 = 60_000;

    fn refill(capacity: u32, rate: u32, now_ms: u64) -> RefillParams {
        RefillParams { capacity, refill_per_minute: rate, now_ms, ttl: Duration::from_secs(120) }
    }

    #[test]
    fn absent_bucket_starts_full() {
        let state = refill_state(None, &refill(50, 2, 7));
        assert_eq!(state, BucketState { tokens: 50, last_refill_ms: 7 });
    }

    #[test]
    fn partial_minute_credits_floor() {
        let prior = Some(BucketState { tokens: 10, last_refill_ms: 0 });
        // 20s at 2/min is 0.66 tokens.
        assert_eq!(refill_state(prior, &refill(50, 2, 20_000)).tokens, 10);
        // 90s at 2/min is 3 tokens.
        let state = refill_state(prior, &refill(50, 2, 90_000));
        assert_eq!(state, BucketState { tokens: 13, last_refill_ms: 90_000 });
    }

    #[test]
    fn frequent_checks_do_not_lose_refill() {
        let start = BucketState { tokens: 0, last_refill_ms: 0 };
        let once = refill_state(Some(start), &refill(50, 2, 100_000));

        let mut stepped = Some(start);
        for now in (0..=100_000).step_by(7_000).chain(std::iter::once(100_000)) {
            stepped = Some(refill_state(stepped, &refill(50, 2, now)));
        }
        assert_eq!(stepped.map(|s| s.tokens), Some(once.tokens));
        assert_eq!(once.tokens, 3);
    }

    #[test]
    fn refill_caps_at_capacity_and_resets_clock() {
        let prior = Some(BucketState { tokens: 47, last_refill_ms: 0 });
        let state = refill_state(prior, &refill(50, 2, 10 * MINUTE));
        assert_eq!(state, BucketState { tokens: 50, last_refill_ms: 10 * MINUTE });
    }

    #[test]
    fn clock_going_backwards_credits_nothing() {
        let prior = Some(BucketState { tokens: 5, last_refill_ms: 10 * MINUTE });
        assert_eq!(refill_state(prior, &refill(50, 2, MINUTE)).tokens, 5);
    }

    #[test]
    fn deduct_floors_at_zero() {
        let params = DeductParams { capacity: 50, cost: 3, now_ms: 0, ttl: Duration::ZERO };
        let prior = Some(BucketState { tokens: 2, last_refill_ms: 0 });
        assert_eq!(deduct_state(prior, &params).tokens, 0);
        assert_eq!(deduct_state(None, &params).tokens, 47);
    }

    #[tokio::test]
    async fn in_memory_storage_expires_idle_buckets() {
        let storage = InMemoryBucketStorage::new();
        let key = BucketKey::new(PolicyName::ENTRIES_UPDATE, "p1");
        let ttl = Duration::from_secs(120);

        storage.refill(&key, refill(10, 1, 0)).await.expect("refill");
        let left = storage
            .deduct(&key, DeductParams { capacity: 10, cost: 10, now_ms: 1, ttl })
            .await
            .expect("deduct");
        assert_eq!(left, 0);

        // Past the TTL the bucket is recreated full.
        let state = storage.refill(&key, refill(10, 1, 200_000)).await.expect("refill");
        assert_eq!(state.tokens, 10);

        storage.purge_expired(10_000_000);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn reset_fills_bucket() {
        let storage = InMemoryBucketStorage::new();
        let key = BucketKey::new(PolicyName::ENTRIES_UPDATE, "p1");
        let ttl = Duration::from_secs(120);
        storage
            .deduct(&key, DeductParams { capacity: 600, cost: 599, now_ms: 0, ttl })
            .await
            .expect("deduct");
        storage.reset(&key, 600, 5, ttl).await.expect("reset");
        assert_eq!(storage.peek(&key), Some(BucketState { tokens: 600, last_refill_ms: 5 }));
    }
}
