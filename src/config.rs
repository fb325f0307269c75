//! Coordination settings and the live-updatable handle that carries them.
//!
//! `SharedConfig` uses `ArcSwap` for lock-free reads on the request path; an operator
//! can flip rate limiting off (e.g. for benchmarks) without rebuilding the stack.

use crate::error::ConfigError;
use crate::timeout::StoreDeadline;
use arc_swap::ArcSwap;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Header carrying the client-supplied idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "X-Idempotency-Key";
/// Header carrying the participant (caller group) identifier.
pub const PARTICIPANT_HEADER: &str = "X-Participant-Id";
/// Header carrying the end-user identifier for user-scoped policies.
pub const USER_HEADER: &str = "PI-PayerId";
/// Identifier used when a request carries no identity at all.
pub const ANONYMOUS_IDENTIFIER: &str = "anonymous";
/// Idempotency records live for 24 hours from creation.
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// A processing record blocks its key for at most this long without a response.
pub const DEFAULT_PROCESSING_LEASE: Duration = Duration::from_secs(60);

/// What to do when a second request finds the key claimed but not yet completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum InFlightPolicy {
    /// Poll the record until the first claimant completes, then replay it.
    /// Gives up with 409 Conflict after `max_wait_ms`.
    Wait {
        /// Upper bound on the total wait.
        max_wait_ms: u64,
        /// Base delay between polls (jittered by ±20%).
        poll_interval_ms: u64,
    },
    /// Run the handler again without caching its response.
    Proceed,
}

impl Default for InFlightPolicy {
    fn default() -> Self {
        Self::Wait { max_wait_ms: 5_000, poll_interval_ms: 50 }
    }
}

/// Settings consulted by the coordination middleware on every request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Master switch for rate limiting. Idempotency is unaffected.
    pub rate_limit_enabled: bool,
    /// Deadline for each shared-store round-trip.
    pub store_timeout_ms: u64,
    /// Lifetime of idempotency records.
    pub idempotency_ttl_secs: u64,
    /// How long an unfinished claim holds its key before a retry may take it over.
    pub processing_lease_secs: u64,
    /// Header carrying the idempotency key.
    pub idempotency_header: String,
    /// Header carrying the participant identifier.
    pub participant_header: String,
    /// Header carrying the end-user identifier.
    pub user_header: String,
    /// Identifier used when nothing else identifies the caller.
    pub anonymous_identifier: String,
    /// Behavior on an in-flight idempotency race.
    pub in_flight: InFlightPolicy,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            rate_limit_enabled: true,
            store_timeout_ms: 2_000,
            idempotency_ttl_secs: DEFAULT_IDEMPOTENCY_TTL.as_secs(),
            processing_lease_secs: DEFAULT_PROCESSING_LEASE.as_secs(),
            idempotency_header: IDEMPOTENCY_KEY_HEADER.to_string(),
            participant_header: PARTICIPANT_HEADER.to_string(),
            user_header: USER_HEADER.to_string(),
            anonymous_identifier: ANONYMOUS_IDENTIFIER.to_string(),
            in_flight: InFlightPolicy::default(),
        }
    }
}

impl CoordinationConfig {
    /// Load settings from the environment, falling back to defaults.
    ///
    /// Recognised variables: `RATE_LIMIT_ENABLED`, `COORDINATION_STORE_TIMEOUT_MS`,
    /// `IDEMPOTENCY_TTL_SECS`, `IDEMPOTENCY_PROCESSING_LEASE_SECS`,
    /// `IDEMPOTENCY_IN_FLIGHT` (`wait` | `proceed`) and `IDEMPOTENCY_MAX_WAIT_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(raw) = lookup("RATE_LIMIT_ENABLED") {
            cfg.rate_limit_enabled = !matches!(raw.trim(), "false" | "0");
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "COORDINATION_STORE_TIMEOUT_MS")? {
            cfg.store_timeout_ms = ms;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "IDEMPOTENCY_TTL_SECS")? {
            cfg.idempotency_ttl_secs = secs;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "IDEMPOTENCY_PROCESSING_LEASE_SECS")? {
            cfg.processing_lease_secs = secs;
        }
        let max_wait = parse_var::<u64, _>(&lookup, "IDEMPOTENCY_MAX_WAIT_MS")?;
        match lookup("IDEMPOTENCY_IN_FLIGHT").as_deref().map(str::trim) {
            None | Some("wait") => {
                if let (Some(ms), InFlightPolicy::Wait { max_wait_ms, .. }) =
                    (max_wait, &mut cfg.in_flight)
                {
                    *max_wait_ms = ms;
                }
            }
            Some("proceed") => cfg.in_flight = InFlightPolicy::Proceed,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    field: "IDEMPOTENCY_IN_FLIGHT",
                    reason: format!("expected `wait` or `proceed`, got `{}`", other),
                })
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings that would make every store call fail or never expire.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "store_timeout_ms",
                reason: "must be > 0".into(),
            });
        }
        if self.idempotency_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "idempotency_ttl_secs",
                reason: "must be > 0".into(),
            });
        }
        if self.processing_lease_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "processing_lease_secs",
                reason: "must be > 0".into(),
            });
        }
        if let InFlightPolicy::Wait { poll_interval_ms: 0, .. } = self.in_flight {
            return Err(ConfigError::InvalidValue {
                field: "in_flight.poll_interval_ms",
                reason: "must be > 0".into(),
            });
        }
        Ok(())
    }

    /// Store deadline as a `Duration`.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Per-call deadline the middleware gives both stores.
    pub fn store_deadline(&self) -> StoreDeadline {
        StoreDeadline::new(self.store_timeout().max(Duration::from_millis(1)))
    }

    /// Idempotency record lifetime as a `Duration`.
    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    /// Processing lease as a `Duration`.
    pub fn processing_lease(&self) -> Duration {
        Duration::from_secs(self.processing_lease_secs)
    }
}

fn parse_var<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue { field: name, reason: e.to_string() }),
    }
}

/// `SharedConfig<T>` gives cheap reads and controlled updates for shared config.
#[derive(Debug)]
pub struct SharedConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for SharedConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Default> Default for SharedConfig<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> SharedConfig<T> {
    /// Create a handle with the given initial value.
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value (cheap clone of Arc).
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Update via closure.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let cur = self.inner.load_full();
        self.inner.store(Arc::new(f(&cur)));
    }
}
