#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Tollgate
//!
//! Distributed request coordination for stateless HTTP services: token-bucket rate
//! limiting and idempotent-request de-duplication over a shared store.
//!
//! ## Features
//!
//! - **Token buckets** refilled on read, with per-outcome costs (a 404 can cost more
//!   than a 200 to make key scanning expensive)
//! - **Idempotency keys** claimed atomically, with byte-for-byte response replay
//! - **Fail-open** on store outages and timeouts: limits and de-duplication degrade,
//!   availability does not
//! - **Tower middleware** wiring both around any `http` service
//! - **Pluggable storage**: in-memory here, Redis in `tollgate-redis`
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tollgate::{InMemoryBucketStorage, PolicyRegistry, TokenBucketStore};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let registry = PolicyRegistry::standard();
//! let read = registry.lookup("ENTRIES_READ_PARTICIPANT_ANTISCAN").expect("standard policy");
//! let buckets = TokenBucketStore::new(Arc::new(InMemoryBucketStorage::new()));
//!
//! let status = buckets.check(read, "participant-1").await.expect("in-memory store");
//! assert!(status.allowed);
//! assert_eq!(status.remaining, 50);
//!
//! // A miss costs three tokens under the antiscan policy.
//! assert_eq!(buckets.consume(read, "participant-1", 404).await.expect("charge"), 3);
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod identity;
pub mod middleware;
pub mod policy;
pub mod prelude;
pub mod rate_limit;
pub mod telemetry;
pub mod timeout;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CoordinationConfig, InFlightPolicy, SharedConfig};
pub use error::{ConfigError, CoordinationError, PolicyError, StoreError};
pub use idempotency::{
    ClaimOutcome, IdempotencyCoordinator, IdempotencyRecord, IdempotencyStorage,
    InMemoryIdempotencyStorage, PROCESSING_STATUS,
};
pub use identity::{CallerIdentity, HeaderIdentity, IdentityResolver};
pub use middleware::{CoordinationLayer, CoordinationLayerBuilder, CoordinationService};
pub use policy::{CostSchedule, OutcomeClass, PolicyName, PolicyRegistry, RateLimitPolicy, Scope};
pub use rate_limit::{
    BucketKey, BucketState, BucketStorage, InMemoryBucketStorage, RateLimitStatus,
    TokenBucketStore,
};
pub use telemetry::{CoordinationEvent, TelemetrySink};
pub use timeout::StoreDeadline;
