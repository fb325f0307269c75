//! Telemetry for the coordination layer.
//!
//! The middleware emits a [`CoordinationEvent`] for every decision it takes: bucket
//! checks and charges, idempotency claims and replays, and every fail-open path.
//! Events flow through [`TelemetrySink`] implementations, which are plain
//! `tower::Service<CoordinationEvent>`s so they compose with standard combinators.
//!
//! ```rust
//! use tollgate::telemetry::{CoordinationEvent, RateLimitEvent};
//! use tollgate::PolicyName;
//!
//! let denied = CoordinationEvent::RateLimit(RateLimitEvent::Denied {
//!     policy: PolicyName::ENTRIES_WRITE,
//!     retry_after_secs: 3,
//! });
//! assert_eq!(denied.component(), "rate_limit");
//! assert_eq!(denied.kind(), "denied");
//! ```

pub mod events;
pub mod sinks;

pub use events::{CoordinationEvent, IdempotencyEvent, RateLimitEvent};
pub use sinks::{
    emit_best_effort, ComposedSinkError, LogSink, MemorySink, MulticastSink, NullSink,
    TelemetrySink,
};
