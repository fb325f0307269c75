//! Error types for the coordination layer.
//!
//! Only one condition is ever meant to reach a client: an exhausted bucket, and that
//! is expressed as a response rather than an error. Everything here describes
//! infrastructure trouble, which callers degrade around (fail open).
use std::time::Duration;

/// Failure talking to (or interpreting) a shared coordination store.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Network, pool or server failure reaching the store.
    #[error("coordination store unavailable: {message}")]
    Unavailable {
        /// Backend-supplied description.
        message: String,
    },
    /// The store did not answer within the configured deadline.
    #[error("coordination store timed out after {after:?}")]
    Timeout {
        /// Deadline that elapsed.
        after: Duration,
    },
    /// The store answered with state this crate never writes.
    #[error("malformed coordination state: {message}")]
    Malformed {
        /// What could not be interpreted.
        message: String,
    },
}

impl StoreError {
    /// Build an [`StoreError::Unavailable`] from any displayable backend error.
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable { message: err.to_string() }
    }

    /// Build a [`StoreError::Malformed`] from any displayable description.
    pub fn malformed(err: impl std::fmt::Display) -> Self {
        Self::Malformed { message: err.to_string() }
    }

    /// Check if this error is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors produced when validating or loading rate-limit policies.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// Bucket capacity must be > 0.
    #[error("policy {policy}: capacity must be > 0")]
    InvalidCapacity {
        /// Offending policy name.
        policy: String,
    },
    /// Refill rate must be > 0 tokens per minute.
    #[error("policy {policy}: refill_per_minute must be > 0")]
    InvalidRefillRate {
        /// Offending policy name.
        policy: String,
    },
    /// No policy with this name is registered.
    #[error("unknown rate limit policy {policy}")]
    Unknown {
        /// Requested policy name.
        policy: String,
    },
    /// A policy catalogue could not be parsed.
    #[error("policy catalogue could not be parsed: {0}")]
    Parse(String),
}

/// Invalid coordination configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A setting was present but unusable.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Setting name (environment variable or field).
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Unified error returned by the public coordination APIs.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    /// The shared store failed; callers are expected to fail open.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A policy was invalid or missing.
    #[error(transparent)]
    Policy(#[from] PolicyError),
    /// Configuration could not be applied.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CoordinationError {
    /// Borrow the store error if this wraps one.
    pub fn as_store(&self) -> Option<&StoreError> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }

    /// Store failures let the request through; policy and config errors do not.
    pub fn is_fail_open(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn every_store_error_fails_open() {
        for store in [
            StoreError::unavailable("connection refused"),
            StoreError::Timeout { after: Duration::from_secs(2) },
            StoreError::malformed("tokens=abc"),
        ] {
            assert!(CoordinationError::from(store).is_fail_open());
        }
    }

    #[test]
    fn config_error_is_not_fail_open() {
        let err: CoordinationError = ConfigError::InvalidValue {
            field: "store_timeout_ms",
            reason: "must be > 0".into(),
        }
        .into();
        assert!(!err.is_fail_open());
    }

    #[test]
    fn timeout_display_includes_deadline() {
        let err = StoreError::Timeout { after: Duration::from_millis(1500) };
        let msg = err.to_string();
        assert!(msg.contains("timed out"));
        assert!(msg.contains("1.5"));
        assert!(err.is_timeout());
    }

    #[test]
    fn coordination_error_is_transparent_over_store() {
        let store = StoreError::unavailable("redis down");
        let err: CoordinationError = store.clone().into();
        assert_eq!(err.to_string(), store.to_string());
        assert!(err.is_fail_open());
        assert_eq!(err.as_store(), Some(&store));
        assert!(err.source().is_none());
    }

    #[test]
    fn policy_error_is_not_fail_open() {
        let err: CoordinationError =
            PolicyError::InvalidCapacity { policy: "ENTRIES_WRITE".into() }.into();
        assert!(!err.is_fail_open());
        assert!(err.to_string().contains("ENTRIES_WRITE"));
    }
}
