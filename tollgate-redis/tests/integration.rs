//! Runs against a live Redis. Set `TOLLGATE_TEST_REDIS_URL` and use
//! `cargo test -p tollgate-redis -- --ignored`.

use bytes::Bytes;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tollgate::clock::ManualClock;
use tollgate::idempotency::IdempotencyStorage;
use tollgate::{IdempotencyCoordinator, PolicyRegistry, RateLimitPolicy, TokenBucketStore};
use tollgate_redis::{create_pool, RedisBucketStorage, RedisConfig, RedisIdempotencyStorage};

async fn pool() -> deadpool_redis::Pool {
    let url = std::env::var("TOLLGATE_TEST_REDIS_URL")
        .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    create_pool(&RedisConfig { url, max_connections: 16 }).await.expect("redis reachable")
}

fn unique(prefix: &str) -> String {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).expect("clock").as_nanos();
    format!("{}-{}", prefix, nanos)
}

fn antiscan() -> RateLimitPolicy {
    PolicyRegistry::standard()
        .require("ENTRIES_READ_PARTICIPANT_ANTISCAN")
        .expect("standard policy")
        .clone()
}

#[tokio::test]
#[ignore]
async fn bucket_charges_and_refills() {
    let clock = ManualClock::starting_at(1_700_000_000_000);
    let store = TokenBucketStore::new(Arc::new(RedisBucketStorage::new(pool().await)))
        .with_clock(Arc::new(clock.clone()));
    let policy = antiscan();
    let caller = unique("bank");

    let first = store.check(&policy, &caller).await.expect("check");
    assert_eq!(first.remaining, 50);

    assert_eq!(store.consume(&policy, &caller, 404).await.expect("consume"), 3);
    clock.advance(Duration::from_secs(20));
    assert_eq!(store.check(&policy, &caller).await.expect("check").remaining, 47);

    clock.advance(Duration::from_secs(70));
    assert_eq!(store.check(&policy, &caller).await.expect("check").remaining, 50);

    store.consume(&policy, &caller, 200).await.expect("consume");
    store.reset(&policy, &caller).await.expect("reset");
    assert_eq!(store.check(&policy, &caller).await.expect("check").remaining, 50);
}

#[tokio::test]
#[ignore]
async fn concurrent_charges_never_go_negative() {
    let store = TokenBucketStore::new(Arc::new(RedisBucketStorage::new(pool().await)));
    let policy = antiscan();
    let caller = unique("burst");

    let charges = (0..40).map(|_| {
        let store = store.clone();
        let policy = policy.clone();
        let caller = caller.clone();
        async move { store.consume(&policy, &caller, 404).await }
    });
    for charged in join_all(charges).await {
        assert_eq!(charged.expect("consume"), 3);
    }
    assert_eq!(store.check(&policy, &caller).await.expect("check").remaining, 0);
}

#[tokio::test]
#[ignore]
async fn only_one_concurrent_claim_wins() {
    let coordinator = IdempotencyCoordinator::new(Arc::new(RedisIdempotencyStorage::new(pool().await)));
    let key = unique("claim");

    let outcomes = join_all((0..25).map(|_| {
        let coordinator = coordinator.clone();
        let key = key.clone();
        async move { coordinator.claim(&key).await }
    }))
    .await;

    assert_eq!(outcomes.iter().filter(|o| o.claimed()).count(), 1);
    assert!(outcomes
        .iter()
        .filter_map(|o| o.existing_record())
        .all(|record| record.is_processing()));
}

#[tokio::test]
#[ignore]
async fn completed_record_replays_exactly() {
    let storage = RedisIdempotencyStorage::new(pool().await);
    let key = unique("replay");
    let ttl = Duration::from_secs(60);
    let lease = Duration::from_secs(30);

    assert_eq!(storage.claim(&key, 1_000, ttl, lease).await.expect("claim"), None);
    storage
        .complete(&key, 201, Bytes::from_static(b"{\"id\":7}"), 1_005, ttl)
        .await
        .expect("complete");

    let record = storage.claim(&key, 1_010, ttl, lease).await.expect("claim").expect("record");
    assert_eq!(record.status, 201);
    assert_eq!(record.body, Bytes::from_static(b"{\"id\":7}"));
    assert_eq!(record.created_at, 1_000);

    assert!(!storage.release(&key, 1_010).await.expect("release"));
    assert!(storage.fetch(&key, 1_010).await.expect("fetch").is_some());
}

#[tokio::test]
#[ignore]
async fn release_frees_a_processing_claim() {
    let storage = RedisIdempotencyStorage::new(pool().await);
    let key = unique("release");
    let ttl = Duration::from_secs(60);
    let lease = Duration::from_secs(30);

    assert_eq!(storage.claim(&key, 1, ttl, lease).await.expect("claim"), None);
    assert!(storage.release(&key, 1).await.expect("release"));
    assert_eq!(storage.fetch(&key, 1).await.expect("fetch"), None);
    assert_eq!(storage.claim(&key, 2, ttl, lease).await.expect("claim"), None);
}

#[tokio::test]
#[ignore]
async fn abandoned_claim_is_taken_over_after_the_lease() {
    let storage = RedisIdempotencyStorage::new(pool().await);
    let key = unique("lease");
    let ttl = Duration::from_secs(60);
    let lease = Duration::from_secs(30);

    assert_eq!(storage.claim(&key, 1_000, ttl, lease).await.expect("claim"), None);
    let prior = storage.claim(&key, 1_029, ttl, lease).await.expect("claim").expect("record");
    assert!(prior.is_processing());

    assert_eq!(storage.claim(&key, 1_030, ttl, lease).await.expect("claim"), None);
    let record = storage.fetch(&key, 1_031).await.expect("fetch").expect("record");
    assert!(record.is_processing());
    assert_eq!(record.created_at, 1_030);
}
