use super::events::CoordinationEvent;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service;

type SinkFuture<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send>>;

/// A telemetry sink that consumes coordination events.
pub trait TelemetrySink:
    tower::Service<CoordinationEvent, Response = (), Error = Self::SinkError>
    + Clone
    + Send
    + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
///
/// Telemetry never changes a response: if a sink is not ready or fails, the event is
/// dropped.
pub async fn emit_best_effort<S>(sink: S, event: CoordinationEvent)
where
    S: tower::Service<CoordinationEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Discards every event.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<CoordinationEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: CoordinationEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Logs events at INFO through `tracing`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<CoordinationEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: CoordinationEvent) -> Self::Future {
        tracing::info!(
            component = event.component(),
            kind = event.kind(),
            event = %event,
            "coordination_event"
        );
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps the most recent events in memory.
///
/// Bounded: once `capacity` events are held, the oldest is evicted for each new one.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<CoordinationEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Bounded sink holding up to 10,000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Bounded sink with explicit capacity (at least 1).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Snapshot of the held events, oldest first.
    pub fn events(&self) -> Vec<CoordinationEvent> {
        self.events.lock().map(|g| g.iter().cloned().collect()).unwrap_or_default()
    }

    /// Drop all held events.
    pub fn clear(&self) {
        if let Ok(mut guard) = self.events.lock() {
            guard.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of events evicted to respect the capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<CoordinationEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: CoordinationEvent) -> Self::Future {
        if let Ok(mut guard) = self.events.lock() {
            if guard.len() >= self.capacity {
                guard.pop_front();
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
            guard.push_back(event);
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Error from a composed sink, wrapping the first failing sink's error.
#[derive(Debug)]
pub struct ComposedSinkError(Box<dyn std::error::Error + Send + Sync>);

impl std::fmt::Display for ComposedSinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "telemetry sink failed: {}", self.0)
    }
}

impl std::error::Error for ComposedSinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

/// Sends each event to two sinks concurrently.
///
/// ```rust
/// use tollgate::telemetry::{LogSink, MemorySink, MulticastSink};
///
/// let memory = MemorySink::new();
/// let sink = MulticastSink::new(LogSink, memory.clone());
/// ```
#[derive(Clone, Debug)]
pub struct MulticastSink<A, B> {
    sink_a: A,
    sink_b: B,
}

impl<A, B> MulticastSink<A, B> {
    pub fn new(sink_a: A, sink_b: B) -> Self {
        Self { sink_a, sink_b }
    }
}

impl<A, B> Service<CoordinationEvent> for MulticastSink<A, B>
where
    A: tower::Service<CoordinationEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: tower::Service<CoordinationEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type Response = ();
    type Error = ComposedSinkError;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: CoordinationEvent) -> Self::Future {
        let mut sink_a = self.sink_a.clone();
        let mut sink_b = self.sink_b.clone();
        let event_b = event.clone();

        Box::pin(async move {
            let (res_a, res_b) = tokio::join!(sink_a.call(event), sink_b.call(event_b));
            res_a.map_err(|e| ComposedSinkError(Box::new(e)))?;
            res_b.map_err(|e| ComposedSinkError(Box::new(e)))?;
            Ok(())
        })
    }
}

impl<A, B> TelemetrySink for MulticastSink<A, B>
where
    A: tower::Service<CoordinationEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: tower::Service<CoordinationEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type SinkError = ComposedSinkError;
}
