//! Redis storage backends for `tollgate`.
//!
//! Every mutating step runs as a Lua script, so it is atomic on the server no matter
//! how many service instances share the deployment. Bucket keys carry a hash tag
//! (`rate_limit:{POLICY:id}`) so both fields of a bucket live in one cluster slot.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tollgate::{IdempotencyCoordinator, TokenBucketStore};
//! use tollgate_redis::{create_pool, RedisBucketStorage, RedisConfig, RedisIdempotencyStorage};
//!
//! # async fn wire() -> Result<(), tollgate::CoordinationError> {
//! let pool = create_pool(&RedisConfig::from_env()?).await?;
//! let buckets = TokenBucketStore::new(Arc::new(RedisBucketStorage::new(pool.clone())));
//! let idempotency = IdempotencyCoordinator::new(Arc::new(RedisIdempotencyStorage::new(pool)));
//! # Ok(())
//! # }
//! ```

mod bucket;
mod idempotency;
mod pool;

pub use bucket::RedisBucketStorage;
pub use idempotency::{RedisIdempotencyStorage, RECORD_PREFIX};
pub use pool::{create_pool, mask_password, RedisConfig};

use redis::{ErrorKind, RedisError};
use tollgate::StoreError;

/// Error code raised by the scripts when a stored value is not one they wrote.
pub(crate) const MALFORMED_CODE: &str = "TOLLGATE_MALFORMED";

/// Classify a Redis failure. Unparseable state is `Malformed`; anything else means
/// the server could not be used.
pub(crate) fn store_error(err: RedisError) -> StoreError {
    if err.kind() == ErrorKind::TypeError || err.code() == Some(MALFORMED_CODE) {
        StoreError::malformed(err)
    } else {
        StoreError::unavailable(err)
    }
}
