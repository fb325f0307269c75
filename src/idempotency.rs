//! Idempotent-request de-duplication.
//!
//! The first request carrying a key claims it by inserting a processing record
//! (status [`PROCESSING_STATUS`]); the handler's final status and body are then
//! written back with [`IdempotencyCoordinator::save`]. Later requests with the same key
//! observe the record and replay it instead of running the handler again.
//!
//! A processing record is leased: if its claimant disappears without saving or
//! releasing (crash, dropped request), the key can be claimed again once the lease
//! runs out instead of staying blocked for the whole record lifetime.
//!
//! Claims are fail-open: if the store cannot be reached the request proceeds without
//! de-duplication ([`ClaimOutcome::Degraded`]).

use crate::clock::{Clock, SystemClock};
use crate::config::{DEFAULT_IDEMPOTENCY_TTL, DEFAULT_PROCESSING_LEASE};
use crate::error::StoreError;
use crate::timeout::StoreDeadline;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub mod store;

pub use store::{IdempotencyStorage, InMemoryIdempotencyStorage};

/// Status stored while the first claimant is still running the handler.
pub const PROCESSING_STATUS: u16 = 0;

/// A claimed or completed request, as persisted in the shared store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    /// Client-supplied idempotency key.
    pub key: String,
    /// Final HTTP status, or [`PROCESSING_STATUS`].
    pub status: u16,
    /// Serialized response body, replayed byte-for-byte.
    pub body: Bytes,
    /// Unix second of the first claim.
    pub created_at: u64,
}

impl IdempotencyRecord {
    /// The sentinel written by a successful claim.
    pub fn processing(key: impl Into<String>, created_at: u64) -> Self {
        Self { key: key.into(), status: PROCESSING_STATUS, body: Bytes::new(), created_at }
    }

    /// Still waiting for the first claimant's response.
    pub fn is_processing(&self) -> bool {
        self.status == PROCESSING_STATUS
    }
}

/// Result of [`IdempotencyCoordinator::claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller inserted the record and must eventually `save` (or `release`).
    Claimed,
    /// A record already existed; the before-image is attached.
    AlreadyClaimed(IdempotencyRecord),
    /// The store failed; the caller proceeds as if it had claimed, without caching.
    Degraded(StoreError),
}

impl ClaimOutcome {
    /// Whether the caller should run the handler.
    pub fn claimed(&self) -> bool {
        matches!(self, Self::Claimed | Self::Degraded(_))
    }

    /// The record found by the claim, if any.
    pub fn existing_record(&self) -> Option<&IdempotencyRecord> {
        match self {
            Self::AlreadyClaimed(record) => Some(record),
            _ => None,
        }
    }
}

/// Claim/save protocol over a shared [`IdempotencyStorage`].
#[derive(Clone, Debug)]
pub struct IdempotencyCoordinator {
    storage: Arc<dyn IdempotencyStorage>,
    clock: Arc<dyn Clock>,
    deadline: StoreDeadline,
    ttl: Duration,
    lease: Duration,
}

impl IdempotencyCoordinator {
    /// Coordinator over `storage` with wall-clock time, the default deadline, a
    /// 24 hour record lifetime and a one minute processing lease.
    pub fn new(storage: Arc<dyn IdempotencyStorage>) -> Self {
        Self {
            storage,
            clock: Arc::new(SystemClock),
            deadline: StoreDeadline::default(),
            ttl: DEFAULT_IDEMPOTENCY_TTL,
            lease: DEFAULT_PROCESSING_LEASE,
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the per-call store deadline.
    pub fn with_deadline(mut self, deadline: StoreDeadline) -> Self {
        self.deadline = deadline;
        self
    }

    /// Replace the record lifetime.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Replace how long a processing record holds its key.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Record lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Processing lease.
    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Try to become the sole processor for `key`.
    pub async fn claim(&self, key: &str) -> ClaimOutcome {
        let now = self.clock.now_secs();
        match self.deadline.run(self.storage.claim(key, now, self.ttl, self.lease)).await {
            Ok(None) => {
                debug!(key, "idempotency key claimed");
                ClaimOutcome::Claimed
            }
            Ok(Some(record)) => {
                debug!(key, status = record.status, "idempotency key already claimed");
                ClaimOutcome::AlreadyClaimed(record)
            }
            Err(error) => {
                warn!(key, %error, "idempotency claim failed, proceeding without de-duplication");
                ClaimOutcome::Degraded(error)
            }
        }
    }

    /// Store the final response for `key`, replacing the processing sentinel.
    pub async fn save(&self, key: &str, body: Bytes, status: u16) -> Result<(), StoreError> {
        let now = self.clock.now_secs();
        self.deadline.run(self.storage.complete(key, status, body, now, self.ttl)).await
    }

    /// Read the record for `key` without claiming it.
    pub async fn fetch(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        let now = self.clock.now_secs();
        self.deadline.run(self.storage.fetch(key, now)).await
    }

    /// Give up a claim whose handler produced no response, so a retry can claim again.
    pub async fn release(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_secs();
        self.deadline.run(self.storage.release(key, now)).await
    }
}
