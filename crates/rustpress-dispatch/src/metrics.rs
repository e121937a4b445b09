//! Prometheus metrics for the dispatcher and pull transport.
//!
//! One [`Metrics`] instance is constructed per process (see
//! `factory.rs`) and shared, cheaply cloned, between the [`crate::
//! dispatcher::Dispatcher`] and any [`crate::transport::pull::
//! PullConsumer`] built from the same configuration, so totals
//! aggregate across both.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
struct EventTypeLabel {
    event_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
struct HandlerLabel {
    event_type: String,
    handler: String,
}

struct Inner {
    dispatched_total: Family<EventTypeLabel, Counter>,
    handler_attempts_total: Family<HandlerLabel, Counter>,
    handler_retries_total: Family<HandlerLabel, Counter>,
    handler_duration_seconds: Family<HandlerLabel, Histogram>,
    dlq_sends_total: Family<EventTypeLabel, Counter>,
    poll_errors_total: Counter,
}

/// Cheaply-`Clone`-able handle onto a fixed set of counters/histograms.
/// Cloning shares the same underlying metrics, it does not reset them.
#[derive(Clone)]
pub struct Metrics(Arc<Inner>);

impl Metrics {
    pub fn new() -> Self {
        let handler_duration_seconds =
            Family::<HandlerLabel, Histogram>::new_with_constructor(|| Histogram::new(exponential_buckets(0.01, 2.0, 12)));

        Self(Arc::new(Inner {
            dispatched_total: Family::default(),
            handler_attempts_total: Family::default(),
            handler_retries_total: Family::default(),
            handler_duration_seconds,
            dlq_sends_total: Family::default(),
            poll_errors_total: Counter::default(),
        }))
    }

    /// Registers every metric under `registry`. Call once per process,
    /// on whichever `Metrics` instance is shared with the dispatcher and
    /// consumer(s).
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "dispatched",
            "Messages handed to the dispatcher, by event type",
            self.0.dispatched_total.clone(),
        );
        registry.register(
            "handler_attempts",
            "Handler invocation attempts",
            self.0.handler_attempts_total.clone(),
        );
        registry.register(
            "handler_retries",
            "Handler retries after a failed attempt",
            self.0.handler_retries_total.clone(),
        );
        registry.register(
            "handler_duration_seconds",
            "Time spent in a single handler attempt",
            self.0.handler_duration_seconds.clone(),
        );
        registry.register(
            "dlq_sends",
            "Messages forwarded to a dead-letter queue",
            self.0.dlq_sends_total.clone(),
        );
        registry.register(
            "poll_errors",
            "Errors raised while polling a pull transport",
            self.0.poll_errors_total.clone(),
        );
    }

    pub fn record_dispatch(&self, event_type: &str) {
        self.0
            .dispatched_total
            .get_or_create(&EventTypeLabel {
                event_type: event_type.to_string(),
            })
            .inc();
    }

    pub fn record_handler_attempt(&self, event_type: &str, handler: &str) {
        self.0
            .handler_attempts_total
            .get_or_create(&HandlerLabel {
                event_type: event_type.to_string(),
                handler: handler.to_string(),
            })
            .inc();
    }

    pub fn record_handler_retry(&self, event_type: &str, handler: &str) {
        self.0
            .handler_retries_total
            .get_or_create(&HandlerLabel {
                event_type: event_type.to_string(),
                handler: handler.to_string(),
            })
            .inc();
    }

    pub fn observe_handler_duration(&self, event_type: &str, handler: &str, seconds: f64) {
        self.0
            .handler_duration_seconds
            .get_or_create(&HandlerLabel {
                event_type: event_type.to_string(),
                handler: handler.to_string(),
            })
            .observe(seconds);
    }

    pub fn record_dlq_send(&self, event_type: &str) {
        self.0
            .dlq_sends_total
            .get_or_create(&EventTypeLabel {
                event_type: event_type.to_string(),
            })
            .inc();
    }

    pub fn record_poll_error(&self) {
        self.0.poll_errors_total.inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_record() {
        let metrics = Metrics::new();
        let mut registry = Registry::default();
        metrics.register(&mut registry);

        metrics.record_dispatch("checkout.complete");
        metrics.record_handler_attempt("checkout.complete", "validate");
        metrics.record_handler_retry("checkout.complete", "validate");
        metrics.observe_handler_duration("checkout.complete", "validate", 0.05);
        metrics.record_dlq_send("checkout.complete");
        metrics.record_poll_error();

        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &registry).unwrap();
        assert!(buf.contains("dispatched_total"));
        assert!(buf.contains("handler_attempts_total"));
        assert!(buf.contains("poll_errors_total"));
    }

    #[test]
    fn test_metrics_clone_shares_state() {
        let metrics = Metrics::new();
        let clone = metrics.clone();
        clone.record_dispatch("checkout.complete");

        let mut registry = Registry::default();
        metrics.register(&mut registry);
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &registry).unwrap();
        assert!(buf.contains("dispatched_total"));
    }
}
