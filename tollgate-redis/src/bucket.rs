use crate::store_error;
use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::Script;
use std::fmt;
use std::time::Duration;
use tollgate::rate_limit::{BucketKey, BucketState, BucketStorage, DeductParams, RefillParams};
use tollgate::StoreError;
use tracing::debug;

/// Token buckets in Redis, one string key per field.
pub struct RedisBucketStorage {
    pool: Pool,
    refill: Script,
    deduct: Script,
}

impl RedisBucketStorage {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            refill: Script::new(include_str!("../scripts/bucket_refill.lua")),
            deduct: Script::new(include_str!("../scripts/bucket_deduct.lua")),
        }
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, StoreError> {
        self.pool.get().await.map_err(StoreError::unavailable)
    }
}

impl fmt::Debug for RedisBucketStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBucketStorage").field("pool", &self.pool.status()).finish()
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl BucketStorage for RedisBucketStorage {
    async fn refill(
        &self,
        key: &BucketKey,
        params: RefillParams,
    ) -> Result<BucketState, StoreError> {
        let mut conn = self.connection().await?;
        let (tokens, last_refill_ms): (i64, i64) = self
            .refill
            .key(key.tokens_key())
            .key(key.last_refill_key())
            .arg(params.capacity)
            .arg(params.refill_per_minute)
            .arg(params.now_ms)
            .arg(ttl_millis(params.ttl))
            .invoke_async(&mut *conn)
            .await
            .map_err(store_error)?;

        let tokens = u32::try_from(tokens)
            .map_err(|_| StoreError::malformed(format!("{} holds {} tokens", key, tokens)))?;
        let last_refill_ms = u64::try_from(last_refill_ms).map_err(|_| {
            StoreError::malformed(format!("{} last refilled at {}", key, last_refill_ms))
        })?;
        debug!(bucket = %key, tokens, "refilled bucket");
        Ok(BucketState { tokens, last_refill_ms })
    }

    async fn deduct(&self, key: &BucketKey, params: DeductParams) -> Result<u32, StoreError> {
        let mut conn = self.connection().await?;
        let left: i64 = self
            .deduct
            .key(key.tokens_key())
            .key(key.last_refill_key())
            .arg(params.capacity)
            .arg(params.cost)
            .arg(params.now_ms)
            .arg(ttl_millis(params.ttl))
            .invoke_async(&mut *conn)
            .await
            .map_err(store_error)?;
        u32::try_from(left).map_err(|_| StoreError::malformed(format!("{} holds {} tokens", key, left)))
    }

    async fn reset(
        &self,
        key: &BucketKey,
        capacity: u32,
        now_ms: u64,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let ttl_ms = ttl_millis(ttl);
        let _: () = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(key.tokens_key())
            .arg(capacity)
            .arg("PX")
            .arg(ttl_ms)
            .ignore()
            .cmd("SET")
            .arg(key.last_refill_key())
            .arg(now_ms)
            .arg("PX")
            .arg(ttl_ms)
            .ignore()
            .query_async(&mut *conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}
