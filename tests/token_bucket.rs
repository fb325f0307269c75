mod common;

use common::test_helpers::{HangingStorage, UnreachableStorage};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tollgate::{
    BucketKey, Clock, CoordinationError, InMemoryBucketStorage, ManualClock, PolicyName, PolicyRegistry,
    RateLimitPolicy, StoreDeadline, StoreError, TokenBucketStore,
};

const T0: u64 = 1_700_000_000_000;

fn antiscan() -> RateLimitPolicy {
    PolicyRegistry::standard()
        .require(PolicyName::ENTRIES_READ_PARTICIPANT_ANTISCAN.as_str())
        .expect("standard policy")
        .clone()
}

fn store_at(clock: &ManualClock) -> (TokenBucketStore, InMemoryBucketStorage) {
    let storage = InMemoryBucketStorage::new();
    let store = TokenBucketStore::new(Arc::new(storage.clone())).with_clock(Arc::new(clock.clone()));
    (store, storage)
}

async fn drain(store: &TokenBucketStore, policy: &RateLimitPolicy, who: &str) {
    while store.check(policy, who).await.expect("check").allowed {
        store.consume(policy, who, 404).await.expect("consume");
    }
}

#[tokio::test]
async fn antiscan_miss_costs_three_and_refills_two_per_minute() {
    let clock = ManualClock::starting_at(T0);
    let (store, _) = store_at(&clock);
    let policy = antiscan();

    let first = store.check(&policy, "bank-1").await.expect("check");
    assert!(first.allowed);
    assert_eq!((first.remaining, first.limit), (50, 50));
    assert_eq!(first.reset_at, T0 / 1_000 + 30);

    assert_eq!(store.consume(&policy, "bank-1", 404).await.expect("consume"), 3);
    assert_eq!(store.check(&policy, "bank-1").await.expect("check").remaining, 47);

    clock.advance(Duration::from_secs(29));
    assert_eq!(store.check(&policy, "bank-1").await.expect("check").remaining, 47);

    clock.advance(Duration::from_secs(1));
    assert_eq!(store.check(&policy, "bank-1").await.expect("check").remaining, 48);

    clock.advance(Duration::from_secs(60));
    assert_eq!(store.check(&policy, "bank-1").await.expect("check").remaining, 50);
}

#[tokio::test]
async fn success_costs_one_and_server_errors_are_free() {
    let clock = ManualClock::starting_at(T0);
    let (store, _) = store_at(&clock);
    let policy = antiscan();

    assert_eq!(store.consume(&policy, "bank-1", 200).await.expect("consume"), 1);
    assert_eq!(store.consume(&policy, "bank-1", 503).await.expect("consume"), 0);
    assert_eq!(store.consume(&policy, "bank-1", 400).await.expect("consume"), 1);
    assert_eq!(store.check(&policy, "bank-1").await.expect("check").remaining, 48);
}

#[tokio::test]
async fn empty_bucket_is_denied_until_a_token_is_credited() {
    let clock = ManualClock::starting_at(T0);
    let (store, _) = store_at(&clock);
    let policy = antiscan();

    drain(&store, &policy, "scanner").await;
    let denied = store.check(&policy, "scanner").await.expect("check");
    assert!(!denied.allowed);
    assert_eq!(denied.remaining, 0);
    assert_eq!(denied.retry_after_secs(clock.now_secs()), 30);

    clock.advance(Duration::from_secs(30));
    let allowed = store.check(&policy, "scanner").await.expect("check");
    assert!(allowed.allowed);
    assert_eq!(allowed.remaining, 1);
}

#[tokio::test]
async fn frequent_checks_never_lose_refill() {
    let clock = ManualClock::starting_at(T0);
    let (store, _) = store_at(&clock);
    let policy = antiscan();

    drain(&store, &policy, "polled").await;
    drain(&store, &policy, "idle").await;
    let start_polled = store.check(&policy, "polled").await.expect("check").remaining;
    let start_idle = store.check(&policy, "idle").await.expect("check").remaining;
    assert_eq!((start_polled, start_idle), (0, 0));

    for _ in 0..25 {
        clock.advance(Duration::from_secs(7));
        store.check(&policy, "polled").await.expect("check");
    }
    clock.advance(Duration::from_secs(5));

    let polled = store.check(&policy, "polled").await.expect("check").remaining;
    let idle = store.check(&policy, "idle").await.expect("check").remaining;
    // 180 seconds at two tokens per minute.
    assert_eq!((polled, idle), (6, 6));
}

#[tokio::test]
async fn concurrent_charges_are_not_lost() {
    let clock = ManualClock::starting_at(T0);
    let (store, _) = store_at(&clock);
    let policy = antiscan();

    let charges = (0..10).map(|_| {
        let store = store.clone();
        let policy = policy.clone();
        tokio::spawn(async move { store.consume(&policy, "bank-1", 200).await })
    });
    for charged in join_all(charges).await {
        assert_eq!(charged.expect("task").expect("consume"), 1);
    }
    assert_eq!(store.check(&policy, "bank-1").await.expect("check").remaining, 40);

    let floods = (0..100).map(|_| {
        let store = store.clone();
        let policy = policy.clone();
        tokio::spawn(async move { store.consume(&policy, "bank-1", 404).await })
    });
    join_all(floods).await;
    let after = store.check(&policy, "bank-1").await.expect("check");
    assert_eq!(after.remaining, 0);
    assert!(!after.allowed);
}

#[tokio::test]
async fn callers_and_policies_have_separate_buckets() {
    let clock = ManualClock::starting_at(T0);
    let (store, storage) = store_at(&clock);
    let registry = PolicyRegistry::standard();
    let antiscan = registry.require("ENTRIES_READ_PARTICIPANT_ANTISCAN").expect("policy");
    let update = registry.require("ENTRIES_UPDATE").expect("policy");

    drain(&store, antiscan, "bank-1").await;
    assert_eq!(store.check(antiscan, "bank-2").await.expect("check").remaining, 50);
    assert_eq!(store.check(update, "bank-1").await.expect("check").remaining, 600);

    let drained = storage
        .peek(&BucketKey::new(PolicyName::ENTRIES_READ_PARTICIPANT_ANTISCAN, "bank-1"))
        .expect("bucket stored");
    assert_eq!(drained.tokens, 0);
    assert_eq!(storage.len(), 3);
}

#[tokio::test]
async fn idle_buckets_expire() {
    let clock = ManualClock::starting_at(T0);
    let (store, storage) = store_at(&clock);
    let policy = antiscan();

    drain(&store, &policy, "bank-1").await;
    // Full refill takes 25 minutes; buckets live twice that while idle.
    let expiry = Duration::from_secs(50 * 60);
    storage.purge_expired(T0 + expiry.as_millis() as u64 - 1);
    assert_eq!(storage.len(), 1);

    clock.advance(expiry + Duration::from_secs(1));
    storage.purge_expired(T0 + (expiry + Duration::from_secs(1)).as_millis() as u64);
    assert!(storage.is_empty());
    assert_eq!(store.check(&policy, "bank-1").await.expect("check").remaining, 50);
}

#[tokio::test]
async fn reset_restores_capacity() {
    let clock = ManualClock::starting_at(T0);
    let (store, _) = store_at(&clock);
    let policy = antiscan();

    drain(&store, &policy, "bank-1").await;
    store.reset(&policy, "bank-1").await.expect("reset");
    assert_eq!(store.check(&policy, "bank-1").await.expect("check").remaining, 50);
}

#[tokio::test]
async fn unreachable_store_reports_fail_open_errors() {
    let store = TokenBucketStore::new(Arc::new(UnreachableStorage));
    let policy = antiscan();

    let err = store.check(&policy, "bank-1").await.expect_err("store down");
    assert!(matches!(err, StoreError::Unavailable { .. }));
    assert!(CoordinationError::from(err).is_fail_open());
    assert!(store.consume(&policy, "bank-1", 200).await.is_err());
    // Exempt outcomes never reach the store.
    assert_eq!(store.consume(&policy, "bank-1", 500).await, Ok(0));
}

#[tokio::test(start_paused = true)]
async fn hanging_store_times_out() {
    let store = TokenBucketStore::new(Arc::new(HangingStorage))
        .with_deadline(StoreDeadline::new(Duration::from_millis(250)));
    let policy = antiscan();

    let err = store.check(&policy, "bank-1").await.expect_err("deadline");
    assert!(err.is_timeout());
    assert_eq!(err, StoreError::Timeout { after: Duration::from_millis(250) });
}
