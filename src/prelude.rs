//! Convenient re-exports for wiring the coordination layer.
pub use crate::{
    clock::{Clock, ManualClock, SystemClock},
    config::{CoordinationConfig, InFlightPolicy, SharedConfig},
    error::{ConfigError, CoordinationError, PolicyError, StoreError},
    idempotency::{
        ClaimOutcome, IdempotencyCoordinator, IdempotencyRecord, IdempotencyStorage,
        InMemoryIdempotencyStorage,
    },
    identity::{CallerIdentity, HeaderIdentity, IdentityResolver},
    middleware::{CoordinationLayer, CoordinationService},
    policy::{CostSchedule, PolicyName, PolicyRegistry, RateLimitPolicy, Scope},
    rate_limit::{BucketStorage, InMemoryBucketStorage, RateLimitStatus, TokenBucketStore},
    timeout::StoreDeadline,
};
