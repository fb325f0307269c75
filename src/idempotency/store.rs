use crate::error::StoreError;
use crate::idempotency::{IdempotencyRecord, PROCESSING_STATUS};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Atomic primitives a shared document store must provide for idempotency records.
#[async_trait]
pub trait IdempotencyStorage: Send + Sync + std::fmt::Debug {
    /// Insert a processing record for `key` unless a live one exists.
    ///
    /// Returns `None` when this call inserted the record, otherwise the record that was
    /// already there (the before-image). Must be a single atomic insert-if-absent; a
    /// find followed by an insert lets two callers both win.
    ///
    /// The processing record holds the key for `lease`. A processing record whose lease
    /// ran out belongs to a claimant that never finished and is taken over as if absent.
    async fn claim(
        &self,
        key: &str,
        now_secs: u64,
        ttl: Duration,
        lease: Duration,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Write the final status and body.
    ///
    /// Keeps `created_at` and the remaining lifetime of an existing record; recreates
    /// the record with a fresh lifetime if it expired meanwhile.
    async fn complete(
        &self,
        key: &str,
        status: u16,
        body: Bytes,
        now_secs: u64,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Read the current record without modifying it.
    async fn fetch(&self, key: &str, now_secs: u64)
        -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Delete the record if it is still processing. Returns whether it was deleted.
    async fn release(&self, key: &str, now_secs: u64) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone)]
struct Entry {
    record: IdempotencyRecord,
    expires_at: u64,
    lease_until: u64,
}

impl Entry {
    fn live_at(&self, now_secs: u64) -> bool {
        self.expires_at > now_secs
    }

    fn held_at(&self, now_secs: u64) -> bool {
        self.live_at(now_secs) && (!self.record.is_processing() || self.lease_until > now_secs)
    }
}

/// In-process idempotency storage keyed by the raw idempotency key.
#[derive(Default, Clone, Debug)]
pub struct InMemoryIdempotencyStorage {
    data: Arc<Mutex<HashMap<String, Entry>>>,
}

impl InMemoryIdempotencyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records, expired or not.
    pub fn len(&self) -> usize {
        self.data.lock().map(|g| g.len()).unwrap_or(0)
    }

    /// Whether no record is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop records whose lifetime ended at or before `now_secs`. Returns how many went.
    pub fn purge_expired(&self, now_secs: u64) -> usize {
        self.with_map(|map| {
            let before = map.len();
            map.retain(|_, entry| entry.live_at(now_secs));
            before - map.len()
        })
        .unwrap_or(0)
    }

    fn with_map<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Entry>) -> T,
    ) -> Result<T, StoreError> {
        let mut guard = self
            .data
            .lock()
            .map_err(|_| StoreError::malformed("idempotency map lock poisoned"))?;
        Ok(f(&mut guard))
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl IdempotencyStorage for InMemoryIdempotencyStorage {
    async fn claim(
        &self,
        key: &str,
        now_secs: u64,
        ttl: Duration,
        lease: Duration,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        self.with_map(|map| {
            if let Some(existing) = map.get(key).filter(|e| e.held_at(now_secs)) {
                return Some(existing.record.clone());
            }
            map.insert(
                key.to_string(),
                Entry {
                    record: IdempotencyRecord::processing(key, now_secs),
                    expires_at: now_secs.saturating_add(ttl_secs(ttl)),
                    lease_until: now_secs.saturating_add(ttl_secs(lease)),
                },
            );
            None
        })
    }

    async fn complete(
        &self,
        key: &str,
        status: u16,
        body: Bytes,
        now_secs: u64,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.with_map(|map| match map.get_mut(key).filter(|e| e.live_at(now_secs)) {
            Some(entry) => {
                entry.record.status = status;
                entry.record.body = body;
            }
            None => {
                let record = IdempotencyRecord {
                    key: key.to_string(),
                    status,
                    body,
                    created_at: now_secs,
                };
                map.insert(
                    key.to_string(),
                    Entry {
                        record,
                        expires_at: now_secs.saturating_add(ttl_secs(ttl)),
                        lease_until: now_secs,
                    },
                );
            }
        })
    }

    async fn fetch(
        &self,
        key: &str,
        now_secs: u64,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        self.with_map(|map| {
            map.get(key).filter(|e| e.live_at(now_secs)).map(|e| e.record.clone())
        })
    }

    async fn release(&self, key: &str, now_secs: u64) -> Result<bool, StoreError> {
        self.with_map(|map| {
            let processing = map
                .get(key)
                .is_some_and(|e| e.live_at(now_secs) && e.record.status == PROCESSING_STATUS);
            if processing {
                map.remove(key);
            }
            processing
        })
    }
}
