//! Tower middleware that runs rate limiting and idempotency around a handler.
//!
//! Per request, in order:
//!
//! 1. **Rate check.** Resolve the caller, refill and inspect the bucket. An empty
//!    bucket answers 429 without charging. A store failure lets the request through.
//! 2. **Idempotency claim.** With a non-empty `X-Idempotency-Key`, claim the key. A
//!    completed record is replayed verbatim and the handler is not invoked. A record
//!    that is still processing is handled by [`InFlightPolicy`].
//! 3. **Dispatch** to the inner service.
//! 4. **Accounting.** Charge the bucket with the final status and store the response
//!    for the key. Both are best-effort and never change the response.
//!
//! A claim whose request ends without a stored response (handler error, dropped
//! future, panic) is released so the key can be retried. If even that cannot happen,
//! the processing lease frees the key.
//!
//! The store deadline, record lifetime and processing lease come from the live
//! [`CoordinationConfig`] and are applied to the components on every request.
//!
//! The inner service returns `http::Response<Bytes>`, which is how the final status
//! and body are observed.
//!
//! ```rust
//! use bytes::Bytes;
//! use http::{Request, Response};
//! use std::sync::Arc;
//! use tollgate::prelude::*;
//! use tower::{service_fn, Layer, ServiceExt};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = PolicyRegistry::standard();
//! let policy = registry.require("ENTRIES_WRITE")?.clone();
//! let limiter = TokenBucketStore::new(Arc::new(InMemoryBucketStorage::new()));
//! let idempotency = IdempotencyCoordinator::new(Arc::new(InMemoryIdempotencyStorage::new()));
//!
//! let layer = CoordinationLayer::builder()
//!     .rate_limit(limiter, policy)
//!     .idempotency(idempotency)
//!     .build()?;
//! let service = layer.layer(service_fn(|_req: Request<()>| async {
//!     Ok::<_, std::convert::Infallible>(Response::new(Bytes::from_static(b"{}")))
//! }));
//!
//! let response = service
//!     .oneshot(Request::builder().header("X-Participant-Id", "bank-1").body(())?)
//!     .await?;
//! assert_eq!(response.headers()["X-RateLimit-Limit"], "36000");
//! # Ok(())
//! # }
//! ```

use crate::config::{CoordinationConfig, InFlightPolicy, SharedConfig};
use crate::error::{CoordinationError, StoreError};
use crate::idempotency::{ClaimOutcome, IdempotencyCoordinator, IdempotencyRecord};
use crate::identity::{HeaderIdentity, IdentityResolver};
use crate::policy::RateLimitPolicy;
use crate::rate_limit::{RateLimitStatus, TokenBucketStore};
use crate::telemetry::{
    emit_best_effort, CoordinationEvent, IdempotencyEvent, NullSink, RateLimitEvent,
    TelemetrySink,
};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::{Request, Response, StatusCode};
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;
use tracing::{debug, warn};

/// `X-RateLimit-Limit`: bucket capacity.
pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// `X-RateLimit-Remaining`: tokens left before this request was charged.
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// `X-RateLimit-Reset`: unix second of the next refill.
pub const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
/// `X-RateLimit-Policy`: name of the applied policy.
pub const RATE_LIMIT_POLICY: HeaderName = HeaderName::from_static("x-ratelimit-policy");
/// `X-Idempotency-Replayed`: set on responses served from an idempotency record.
pub const IDEMPOTENCY_REPLAYED: HeaderName = HeaderName::from_static("x-idempotency-replayed");

const POLL_JITTER: f64 = 0.2;

#[derive(Debug, Clone)]
struct Limiter {
    store: TokenBucketStore,
    policy: RateLimitPolicy,
}

#[derive(Debug)]
struct Shared {
    limiter: Option<Limiter>,
    idempotency: Option<IdempotencyCoordinator>,
    config: SharedConfig<CoordinationConfig>,
    identity: Arc<dyn IdentityResolver>,
}

impl Shared {
    fn configured(
        &self,
        config: &CoordinationConfig,
    ) -> (Option<Limiter>, Option<IdempotencyCoordinator>) {
        let deadline = config.store_deadline();
        let limiter = self.limiter.as_ref().map(|l| Limiter {
            store: l.store.clone().with_deadline(deadline),
            policy: l.policy.clone(),
        });
        let idempotency = self.idempotency.as_ref().map(|c| {
            c.clone()
                .with_deadline(deadline)
                .with_ttl(config.idempotency_ttl())
                .with_lease(config.processing_lease())
        });
        (limiter, idempotency)
    }
}

/// Builder for [`CoordinationLayer`].
#[derive(Debug)]
pub struct CoordinationLayerBuilder<T> {
    limiter: Option<Limiter>,
    idempotency: Option<IdempotencyCoordinator>,
    config: SharedConfig<CoordinationConfig>,
    identity: Arc<dyn IdentityResolver>,
    sink: T,
}

impl CoordinationLayerBuilder<NullSink> {
    fn new() -> Self {
        Self {
            limiter: None,
            idempotency: None,
            config: SharedConfig::default(),
            identity: Arc::new(HeaderIdentity),
            sink: NullSink,
        }
    }
}

impl<T> CoordinationLayerBuilder<T> {
    /// Enforce `policy` using buckets in `store`. The store deadline is taken from the
    /// config.
    pub fn rate_limit(mut self, store: TokenBucketStore, policy: RateLimitPolicy) -> Self {
        self.limiter = Some(Limiter { store, policy });
        self
    }

    /// De-duplicate requests carrying an idempotency key. The store deadline, record
    /// lifetime and processing lease are taken from the config.
    pub fn idempotency(mut self, coordinator: IdempotencyCoordinator) -> Self {
        self.idempotency = Some(coordinator);
        self
    }

    /// Live settings. Keep a clone of the handle to toggle limiting at runtime.
    pub fn config(mut self, config: SharedConfig<CoordinationConfig>) -> Self {
        self.config = config;
        self
    }

    /// Replace the caller identification strategy.
    pub fn identity<R>(mut self, resolver: R) -> Self
    where
        R: IdentityResolver + 'static,
    {
        self.identity = Arc::new(resolver);
        self
    }

    /// Send coordination events to `sink`.
    pub fn telemetry<U>(self, sink: U) -> CoordinationLayerBuilder<U>
    where
        U: TelemetrySink,
    {
        CoordinationLayerBuilder {
            limiter: self.limiter,
            idempotency: self.idempotency,
            config: self.config,
            identity: self.identity,
            sink,
        }
    }

    /// Validate the current settings and build the layer.
    pub fn build(self) -> Result<CoordinationLayer<T>, CoordinationError> {
        self.config.get().validate()?;
        Ok(CoordinationLayer {
            shared: Arc::new(Shared {
                limiter: self.limiter,
                idempotency: self.idempotency,
                config: self.config,
                identity: self.identity,
            }),
            sink: self.sink,
        })
    }
}

/// Layer applying rate limiting and idempotency to an HTTP service.
#[derive(Debug, Clone)]
pub struct CoordinationLayer<T = NullSink> {
    shared: Arc<Shared>,
    sink: T,
}

impl CoordinationLayer<NullSink> {
    /// Start configuring a layer. Nothing is enforced until a component is added.
    pub fn builder() -> CoordinationLayerBuilder<NullSink> {
        CoordinationLayerBuilder::new()
    }
}

impl<T> CoordinationLayer<T> {
    /// Handle to the live settings.
    pub fn config(&self) -> &SharedConfig<CoordinationConfig> {
        &self.shared.config
    }
}

impl<S, T: Clone> Layer<S> for CoordinationLayer<T> {
    type Service = CoordinationService<S, T>;

    fn layer(&self, inner: S) -> Self::Service {
        CoordinationService { inner, shared: self.shared.clone(), sink: self.sink.clone() }
    }
}

/// Service produced by [`CoordinationLayer`].
#[derive(Debug, Clone)]
pub struct CoordinationService<S, T = NullSink> {
    inner: S,
    shared: Arc<Shared>,
    sink: T,
}

impl<S, T, B> Service<Request<B>> for CoordinationService<S, T>
where
    S: Service<Request<B>, Response = Response<Bytes>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    T: TelemetrySink + Sync,
    T::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response<Bytes>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        // Take the service that was driven to readiness and leave a fresh clone behind.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let sink = self.sink.clone();
        let config = self.shared.config.get();
        let (limiter, idempotency) = self.shared.configured(&config);

        let caller = limiter.as_ref().filter(|_| config.rate_limit_enabled).map(|l| {
            self.shared.identity.resolve(req.headers(), req.extensions(), l.policy.scope(), &config)
        });
        let key = idempotency.as_ref().and_then(|_| idempotency_key(&req, &config));

        Box::pin(async move {
            let run = Run { limiter, idempotency, sink, config: &config };
            run.execute(inner, req, caller, key).await
        })
    }
}

fn idempotency_key<B>(req: &Request<B>, config: &CoordinationConfig) -> Option<String> {
    req.headers()
        .get(config.idempotency_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

/// Per-request state of the coordination pipeline.
struct Run<'a, T> {
    limiter: Option<Limiter>,
    idempotency: Option<IdempotencyCoordinator>,
    sink: T,
    config: &'a CoordinationConfig,
}

/// Limiter context carried from the check to the charge.
struct Admitted<'a> {
    limiter: &'a Limiter,
    identifier: String,
    status: Option<RateLimitStatus>,
}

enum Claim {
    /// Run the handler and save its response under the guarded key.
    Owner(ClaimGuard),
    /// Run the handler without caching.
    Uncached,
    /// Answer without running the handler.
    Respond(Response<Bytes>),
}

/// An owned claim. Dropped while still armed, it releases the key in the background.
struct ClaimGuard {
    coordinator: IdempotencyCoordinator,
    key: Option<String>,
}

impl ClaimGuard {
    fn new(coordinator: IdempotencyCoordinator, key: String) -> Self {
        Self { coordinator, key: Some(key) }
    }

    fn key(&self) -> &str {
        self.key.as_deref().unwrap_or_default()
    }

    fn disarm(mut self) {
        self.key = None;
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else { return };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let coordinator = self.coordinator.clone();
                handle.spawn(async move {
                    match coordinator.release(&key).await {
                        Ok(released) => {
                            debug!(key = %key, released, "abandoned idempotency claim released")
                        }
                        Err(error) => {
                            warn!(key = %key, %error, "failed to release abandoned idempotency claim")
                        }
                    }
                });
            }
            Err(_) => {
                warn!(key = %key, "no runtime to release abandoned idempotency claim, lease will expire")
            }
        }
    }
}

impl<T> Run<'_, T>
where
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    async fn execute<S, B>(
        &self,
        mut inner: S,
        req: Request<B>,
        caller: Option<String>,
        key: Option<String>,
    ) -> Result<Response<Bytes>, S::Error>
    where
        S: Service<Request<B>, Response = Response<Bytes>>,
    {
        let admitted = match (self.limiter.as_ref(), caller) {
            (Some(limiter), Some(identifier)) => match self.check(limiter, identifier).await {
                Ok(admitted) => Some(admitted),
                Err(denied) => return Ok(denied),
            },
            _ => None,
        };

        let claim = match (self.idempotency.as_ref(), key) {
            (Some(coordinator), Some(key)) => self.claim(coordinator, key).await,
            _ => Claim::Uncached,
        };

        let owned = match claim {
            Claim::Respond(mut response) => {
                if let Some(admitted) = &admitted {
                    self.charge(admitted, response.status().as_u16()).await;
                    if let Some(limit) = &admitted.status {
                        set_rate_limit_headers(&mut response, limit, limit.remaining);
                    }
                }
                return Ok(response);
            }
            Claim::Owner(guard) => Some(guard),
            Claim::Uncached => None,
        };

        let mut response = match inner.call(req).await {
            Ok(response) => response,
            Err(err) => {
                if let Some(guard) = owned {
                    self.release(guard).await;
                }
                return Err(err);
            }
        };

        let status = response.status().as_u16();
        if let Some(guard) = owned {
            let saved = guard.coordinator.save(guard.key(), response.body().clone(), status).await;
            match saved {
                Ok(()) => guard.disarm(),
                Err(error) => {
                    warn!(key = %guard.key(), %error, "failed to store idempotent response");
                    self.release(guard).await;
                }
            }
        }
        if let Some(admitted) = &admitted {
            self.charge(admitted, status).await;
            if let Some(limit) = &admitted.status {
                set_rate_limit_headers(&mut response, limit, limit.remaining);
            }
        }
        Ok(response)
    }

    /// `Err` carries the 429 response.
    async fn check<'l>(
        &self,
        limiter: &'l Limiter,
        identifier: String,
    ) -> Result<Admitted<'l>, Response<Bytes>> {
        let policy = &limiter.policy;
        match limiter.store.check(policy, &identifier).await {
            Ok(status) if !status.allowed => {
                let retry_after = status.retry_after_secs(limiter.store.clock().now_secs());
                debug!(policy = %policy.name(), identifier = %identifier, retry_after, "rate limited");
                self.emit(CoordinationEvent::RateLimit(RateLimitEvent::Denied {
                    policy: policy.name().clone(),
                    retry_after_secs: retry_after,
                }))
                .await;
                Err(too_many_requests(&status, retry_after))
            }
            Ok(status) => {
                self.emit(CoordinationEvent::RateLimit(RateLimitEvent::Allowed {
                    policy: policy.name().clone(),
                    remaining: status.remaining,
                }))
                .await;
                Ok(Admitted { limiter, identifier, status: Some(status) })
            }
            Err(error) => {
                warn!(policy = %policy.name(), identifier = %identifier, %error, "rate limit check failed, allowing request");
                self.emit(CoordinationEvent::RateLimit(RateLimitEvent::FailOpen {
                    policy: policy.name().clone(),
                    error,
                }))
                .await;
                Ok(Admitted { limiter, identifier, status: None })
            }
        }
    }

    async fn charge(&self, admitted: &Admitted<'_>, status: u16) {
        let Admitted { limiter, identifier, .. } = admitted;
        let policy = &limiter.policy;
        match limiter.store.consume(policy, identifier, status).await {
            Ok(0) => {}
            Ok(cost) => {
                self.emit(CoordinationEvent::RateLimit(RateLimitEvent::Charged {
                    policy: policy.name().clone(),
                    cost,
                }))
                .await
            }
            Err(error) => {
                warn!(policy = %policy.name(), identifier = %identifier, %error, "failed to charge rate limit");
                self.emit(CoordinationEvent::RateLimit(RateLimitEvent::FailOpen {
                    policy: policy.name().clone(),
                    error,
                }))
                .await
            }
        }
    }

    async fn claim(&self, coordinator: &IdempotencyCoordinator, key: String) -> Claim {
        match coordinator.claim(&key).await {
            ClaimOutcome::Claimed => {
                self.emit(CoordinationEvent::Idempotency(IdempotencyEvent::Claimed)).await;
                Claim::Owner(ClaimGuard::new(coordinator.clone(), key))
            }
            ClaimOutcome::Degraded(error) => self.degraded(error).await,
            ClaimOutcome::AlreadyClaimed(record) if !record.is_processing() => {
                self.replay(record).await
            }
            ClaimOutcome::AlreadyClaimed(_) => match self.config.in_flight {
                InFlightPolicy::Proceed => {
                    debug!(key = %key, "idempotency key in flight, proceeding uncached");
                    self.emit(CoordinationEvent::Idempotency(IdempotencyEvent::InFlightProceeded))
                        .await;
                    Claim::Uncached
                }
                InFlightPolicy::Wait { max_wait_ms, poll_interval_ms } => {
                    let waited = await_completion(
                        coordinator,
                        &key,
                        Duration::from_millis(max_wait_ms),
                        Duration::from_millis(poll_interval_ms),
                    )
                    .await;
                    match waited {
                        Ok(Some(record)) => self.replay(record).await,
                        Ok(None) => {
                            debug!(key = %key, "idempotency key still in flight");
                            self.emit(CoordinationEvent::Idempotency(
                                IdempotencyEvent::InFlightConflict,
                            ))
                            .await;
                            Claim::Respond(in_progress())
                        }
                        Err(error) => self.degraded(error).await,
                    }
                }
            },
        }
    }

    async fn replay(&self, record: IdempotencyRecord) -> Claim {
        match replayed(&record) {
            Ok(response) => {
                debug!(key = %record.key, status = record.status, "replaying idempotent response");
                self.emit(CoordinationEvent::Idempotency(IdempotencyEvent::Replayed {
                    status: record.status,
                }))
                .await;
                Claim::Respond(response)
            }
            Err(error) => self.degraded(error).await,
        }
    }

    async fn degraded(&self, error: StoreError) -> Claim {
        warn!(%error, "idempotency unavailable, running handler without de-duplication");
        self.emit(CoordinationEvent::Idempotency(IdempotencyEvent::FailOpen { error })).await;
        Claim::Uncached
    }

    async fn release(&self, guard: ClaimGuard) {
        match guard.coordinator.release(guard.key()).await {
            Ok(true) => {
                self.emit(CoordinationEvent::Idempotency(IdempotencyEvent::Released)).await
            }
            Ok(false) => {}
            Err(error) => warn!(key = %guard.key(), %error, "failed to release idempotency claim"),
        }
        guard.disarm();
    }

    async fn emit(&self, event: CoordinationEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }
}

/// Poll until the record completes. `Ok(None)` when the wait budget runs out or the
/// record disappears.
async fn await_completion(
    coordinator: &IdempotencyCoordinator,
    key: &str,
    max_wait: Duration,
    poll_interval: Duration,
) -> Result<Option<IdempotencyRecord>, StoreError> {
    let deadline = tokio::time::Instant::now() + max_wait;
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(jittered(poll_interval).min(deadline - now)).await;
        match coordinator.fetch(key).await? {
            Some(record) if !record.is_processing() => return Ok(Some(record)),
            Some(_) => continue,
            None => return Ok(None),
        }
    }
}

fn jittered(base: Duration) -> Duration {
    let factor = rand::rng().random_range(1.0 - POLL_JITTER..=1.0 + POLL_JITTER);
    base.mul_f64(factor)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn set_rate_limit_headers<B>(response: &mut Response<B>, status: &RateLimitStatus, remaining: u32) {
    let headers = response.headers_mut();
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(status.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(status.reset_at));
    if let Ok(policy) = HeaderValue::from_str(status.policy.as_str()) {
        headers.insert(RATE_LIMIT_POLICY, policy);
    }
}

fn too_many_requests(status: &RateLimitStatus, retry_after_secs: u64) -> Response<Bytes> {
    let mut response = json_response(
        StatusCode::TOO_MANY_REQUESTS,
        serde_json::json!({
            "error": "TOO_MANY_REQUESTS",
            "message": "Rate limit exceeded. Please try again later.",
        }),
    );
    set_rate_limit_headers(&mut response, status, 0);
    response.headers_mut().insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
    response
}

fn in_progress() -> Response<Bytes> {
    json_response(
        StatusCode::CONFLICT,
        serde_json::json!({
            "error": "IDEMPOTENCY_KEY_IN_PROGRESS",
            "message": "A request with this idempotency key is still being processed.",
        }),
    )
}

fn replayed(record: &IdempotencyRecord) -> Result<Response<Bytes>, StoreError> {
    let status = StatusCode::from_u16(record.status).map_err(|_| {
        StoreError::malformed(format!("idempotency record {} has status {}", record.key, record.status))
    })?;
    let mut response = Response::new(record.body.clone());
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(IDEMPOTENCY_REPLAYED, HeaderValue::from_static("true"));
    Ok(response)
}
