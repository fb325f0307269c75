use crate::store_error;
use async_trait::async_trait;
use bytes::Bytes;
use deadpool_redis::Pool;
use redis::Script;
use std::fmt;
use std::time::Duration;
use tollgate::idempotency::{IdempotencyRecord, IdempotencyStorage};
use tollgate::StoreError;

/// Prefix of the hash holding one idempotency record.
pub const RECORD_PREFIX: &str = "idempotency:";

type RawRecord = (Option<u16>, Option<Vec<u8>>, Option<u64>);

/// Idempotency records in Redis hashes with native expiry.
pub struct RedisIdempotencyStorage {
    pool: Pool,
    claim: Script,
    complete: Script,
    release: Script,
}

impl RedisIdempotencyStorage {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            claim: Script::new(include_str!("../scripts/idempotency_claim.lua")),
            complete: Script::new(include_str!("../scripts/idempotency_complete.lua")),
            release: Script::new(include_str!("../scripts/idempotency_release.lua")),
        }
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, StoreError> {
        self.pool.get().await.map_err(StoreError::unavailable)
    }
}

impl fmt::Debug for RedisIdempotencyStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisIdempotencyStorage").field("pool", &self.pool.status()).finish()
    }
}

fn record_key(key: &str) -> String {
    format!("{}{}", RECORD_PREFIX, key)
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn into_record(key: &str, raw: RawRecord) -> Result<Option<IdempotencyRecord>, StoreError> {
    match raw {
        (None, None, None) => Ok(None),
        (Some(status), body, Some(created_at)) => Ok(Some(IdempotencyRecord {
            key: key.to_string(),
            status,
            body: body.map(Bytes::from).unwrap_or_default(),
            created_at,
        })),
        _ => Err(StoreError::malformed(format!("idempotency record {} is incomplete", key))),
    }
}

#[async_trait]
impl IdempotencyStorage for RedisIdempotencyStorage {
    async fn claim(
        &self,
        key: &str,
        now_secs: u64,
        ttl: Duration,
        lease: Duration,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let mut conn = self.connection().await?;
        let prior: Option<RawRecord> = self
            .claim
            .key(record_key(key))
            .arg(now_secs)
            .arg(ttl_secs(ttl))
            .arg(ttl_secs(lease))
            .invoke_async(&mut *conn)
            .await
            .map_err(store_error)?;
        match prior {
            None => Ok(None),
            Some(raw) => into_record(key, raw),
        }
    }

    async fn complete(
        &self,
        key: &str,
        status: u16,
        body: Bytes,
        now_secs: u64,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: i64 = self
            .complete
            .key(record_key(key))
            .arg(status)
            .arg(body.as_ref())
            .arg(now_secs)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut *conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn fetch(
        &self,
        key: &str,
        _now_secs: u64,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: RawRecord = redis::cmd("HMGET")
            .arg(record_key(key))
            .arg("status")
            .arg("body")
            .arg("created_at")
            .query_async(&mut *conn)
            .await
            .map_err(store_error)?;
        into_record(key, raw)
    }

    async fn release(&self, key: &str, _now_secs: u64) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let deleted: i64 = self
            .release
            .key(record_key(key))
            .invoke_async(&mut *conn)
            .await
            .map_err(store_error)?;
        Ok(deleted == 1)
    }
}
