use crate::error::StoreError;
use crate::policy::PolicyName;
use std::fmt;

/// Events emitted by the coordination middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinationEvent {
    /// Token bucket decisions.
    RateLimit(RateLimitEvent),
    /// Idempotency decisions.
    Idempotency(IdempotencyEvent),
}

impl CoordinationEvent {
    /// Coarse component label (`rate_limit` or `idempotency`).
    pub fn component(&self) -> &'static str {
        match self {
            Self::RateLimit(_) => "rate_limit",
            Self::Idempotency(_) => "idempotency",
        }
    }

    /// Stable snake_case event label, suitable as a metric label value.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimit(e) => e.kind(),
            Self::Idempotency(e) => e.kind(),
        }
    }
}

/// Token bucket decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitEvent {
    /// The bucket had tokens; the request proceeds.
    Allowed {
        /// Policy consulted.
        policy: PolicyName,
        /// Tokens left before charging this request.
        remaining: u32,
    },
    /// The bucket was empty; the request was answered with 429.
    Denied {
        /// Policy consulted.
        policy: PolicyName,
        /// Value of the `Retry-After` header.
        retry_after_secs: u64,
    },
    /// The response outcome was charged against the bucket.
    Charged {
        /// Policy charged.
        policy: PolicyName,
        /// Tokens removed.
        cost: u32,
    },
    /// The store failed during check or charge; the limiter did not enforce.
    FailOpen {
        /// Policy affected.
        policy: PolicyName,
        /// Underlying store failure.
        error: StoreError,
    },
}

impl RateLimitEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Allowed { .. } => "allowed",
            Self::Denied { .. } => "denied",
            Self::Charged { .. } => "charged",
            Self::FailOpen { .. } => "fail_open",
        }
    }
}

/// Idempotency decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyEvent {
    /// This request became the sole processor for its key.
    Claimed,
    /// A completed record was replayed without running the handler.
    Replayed {
        /// Replayed status code.
        status: u16,
    },
    /// The key was still processing after the wait budget; answered with 409.
    InFlightConflict,
    /// The key was still processing and the handler ran again uncached.
    InFlightProceeded,
    /// The handler failed and the claim was released.
    Released,
    /// The store failed; the request ran without de-duplication or caching.
    FailOpen {
        /// Underlying store failure.
        error: StoreError,
    },
}

impl IdempotencyEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Claimed => "claimed",
            Self::Replayed { .. } => "replayed",
            Self::InFlightConflict => "in_flight_conflict",
            Self::InFlightProceeded => "in_flight_proceeded",
            Self::Released => "released",
            Self::FailOpen { .. } => "fail_open",
        }
    }
}

impl fmt::Display for CoordinationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinationEvent::RateLimit(event) => write!(f, "RateLimit::{}", event),
            CoordinationEvent::Idempotency(event) => write!(f, "Idempotency::{}", event),
        }
    }
}

impl fmt::Display for RateLimitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitEvent::Allowed { policy, remaining } => {
                write!(f, "Allowed({}, remaining={})", policy, remaining)
            }
            RateLimitEvent::Denied { policy, retry_after_secs } => {
                write!(f, "Denied({}, retry_after={}s)", policy, retry_after_secs)
            }
            RateLimitEvent::Charged { policy, cost } => write!(f, "Charged({}, cost={})", policy, cost),
            RateLimitEvent::FailOpen { policy, error } => write!(f, "FailOpen({}, {})", policy, error),
        }
    }
}

impl fmt::Display for IdempotencyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdempotencyEvent::Claimed => write!(f, "Claimed"),
            IdempotencyEvent::Replayed { status } => write!(f, "Replayed(status={})", status),
            IdempotencyEvent::InFlightConflict => write!(f, "InFlightConflict"),
            IdempotencyEvent::InFlightProceeded => write!(f, "InFlightProceeded"),
            IdempotencyEvent::Released => write!(f, "Released"),
            IdempotencyEvent::FailOpen { error } => write!(f, "FailOpen({})", error),
        }
    }
}
