//! Prometheus metrics sink for `tollgate`.
//! Bring your own `prometheus::Registry`; counters are registered and incremented.

use prometheus::{IntCounterVec, Opts, Registry};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};
use tollgate::telemetry::{CoordinationEvent, RateLimitEvent, TelemetrySink};

/// Name of the per-event counter.
pub const EVENTS_TOTAL: &str = "tollgate_events_total";
/// Name of the per-policy charged-token counter.
pub const TOKENS_CHARGED_TOTAL: &str = "tollgate_tokens_charged_total";

#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    events: IntCounterVec,
    tokens_charged: IntCounterVec,
}

impl PrometheusSink {
    /// Create a sink and register its counters into the provided registry.
    ///
    /// # Errors
    /// Returns an error if a metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let events = IntCounterVec::new(
            Opts::new(EVENTS_TOTAL, "Coordination events by component and kind"),
            &["component", "event"],
        )?;
        let tokens_charged = IntCounterVec::new(
            Opts::new(TOKENS_CHARGED_TOTAL, "Tokens removed from rate-limit buckets"),
            &["policy"],
        )?;
        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(tokens_charged.clone()))?;
        Ok(Self { registry, events, tokens_charged })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl tower_service::Service<CoordinationEvent> for PrometheusSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: CoordinationEvent) -> Self::Future {
        self.events.with_label_values(&[event.component(), event.kind()]).inc();
        if let CoordinationEvent::RateLimit(RateLimitEvent::Charged { policy, cost }) = &event {
            self.tokens_charged.with_label_values(&[policy.as_str()]).inc_by(u64::from(*cost));
        }
        tracing::trace!(event = %event, "recorded coordination event");
        ready(Ok(()))
    }
}

impl TelemetrySink for PrometheusSink {
    type SinkError = Infallible;
}
