//! Per-call deadline for shared-store round-trips.

use crate::error::StoreError;
use std::future::Future;
use std::time::Duration;

/// Default deadline applied to every store call.
pub const DEFAULT_STORE_DEADLINE: Duration = Duration::from_secs(2);

/// Deadline wrapper for store operations.
///
/// An elapsed deadline is reported as [`StoreError::Timeout`], which callers treat
/// exactly like a connectivity failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreDeadline {
    duration: Duration,
}

impl Default for StoreDeadline {
    fn default() -> Self {
        Self { duration: DEFAULT_STORE_DEADLINE }
    }
}

impl StoreDeadline {
    /// Create a deadline. Panics if duration is zero or `Duration::MAX`.
    pub fn new(duration: Duration) -> Self {
        assert!(
            duration > Duration::ZERO && duration < Duration::MAX,
            "store deadline must be non-zero and finite",
        );
        Self { duration }
    }

    /// Inspect the configured deadline.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Run `operation` under the deadline.
    pub async fn run<T, Fut>(&self, operation: Fut) -> Result<T, StoreError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.duration, operation).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout { after: self.duration }),
        }
    }
}
