use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tollgate::idempotency::{IdempotencyRecord, IdempotencyStorage};
use tollgate::rate_limit::{BucketKey, BucketState, BucketStorage, DeductParams, RefillParams};
use tollgate::StoreError;
use tower::util::BoxCloneService;

/// Storage whose every call fails as if the server were down.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnreachableStorage;

fn down() -> StoreError {
    StoreError::unavailable("connection refused")
}

#[async_trait]
impl BucketStorage for UnreachableStorage {
    async fn refill(&self, _: &BucketKey, _: RefillParams) -> Result<BucketState, StoreError> {
        Err(down())
    }

    async fn deduct(&self, _: &BucketKey, _: DeductParams) -> Result<u32, StoreError> {
        Err(down())
    }

    async fn reset(&self, _: &BucketKey, _: u32, _: u64, _: Duration) -> Result<(), StoreError> {
        Err(down())
    }
}

#[async_trait]
impl IdempotencyStorage for UnreachableStorage {
    async fn claim(
        &self,
        _: &str,
        _: u64,
        _: Duration,
        _: Duration,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        Err(down())
    }

    async fn complete(&self, _: &str, _: u16, _: Bytes, _: u64, _: Duration) -> Result<(), StoreError> {
        Err(down())
    }

    async fn fetch(&self, _: &str, _: u64) -> Result<Option<IdempotencyRecord>, StoreError> {
        Err(down())
    }

    async fn release(&self, _: &str, _: u64) -> Result<bool, StoreError> {
        Err(down())
    }
}

/// Storage that never answers; only a deadline gets the caller out.
#[derive(Debug, Default, Clone, Copy)]
pub struct HangingStorage;

#[async_trait]
impl BucketStorage for HangingStorage {
    async fn refill(&self, _: &BucketKey, _: RefillParams) -> Result<BucketState, StoreError> {
        futures::future::pending().await
    }

    async fn deduct(&self, _: &BucketKey, _: DeductParams) -> Result<u32, StoreError> {
        futures::future::pending().await
    }

    async fn reset(&self, _: &BucketKey, _: u32, _: u64, _: Duration) -> Result<(), StoreError> {
        futures::future::pending().await
    }
}

/// Counts invocations and answers with a fixed status and JSON body.
#[derive(Debug, Clone)]
pub struct CountingHandler {
    calls: Arc<AtomicUsize>,
    status: StatusCode,
    body: &'static str,
}

impl CountingHandler {
    pub fn new(status: StatusCode, body: &'static str) -> Self {
        Self { calls: Arc::new(AtomicUsize::new(0)), status, body }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn service(&self) -> BoxCloneService<Request<()>, Response<Bytes>, Infallible> {
        let handler = self.clone();
        BoxCloneService::new(tower::service_fn(move |_req: Request<()>| {
            let handler = handler.clone();
            async move {
                handler.calls.fetch_add(1, Ordering::SeqCst);
                let mut response = Response::new(Bytes::from_static(handler.body.as_bytes()));
                *response.status_mut() = handler.status;
                Ok::<_, Infallible>(response)
            }
        }))
    }
}

/// Request from `participant` with an optional idempotency key.
pub fn request(participant: &str, key: Option<&str>) -> Request<()> {
    let mut builder = Request::builder().uri("/entries").header("X-Participant-Id", participant);
    if let Some(key) = key {
        builder = builder.header("X-Idempotency-Key", key);
    }
    builder.body(()).expect("valid request")
}
