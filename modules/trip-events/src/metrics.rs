use crate::error::EventError;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::{Arc, PoisonError, RwLock};

/// Prometheus instruments for publishing, subscriptions and routing
pub struct EventMetrics {
    registry: Registry,

    // Histograms
    pub publish_duration_seconds: Histogram,
    pub subscribe_duration_seconds: Histogram,
    pub handler_duration_seconds: Histogram,

    // Counters
    pub errors_total: IntCounterVec,
    pub events_total: IntCounterVec,
    pub events_routed_total: IntCounterVec,
    pub events_discarded_total: IntCounterVec,
    pub handler_errors_total: IntCounterVec,

    // Gauges
    pub active_subscribers: IntGauge,
    pub handlers_total: IntGauge,
}

impl EventMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let publish_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "event_publish_duration_seconds",
            "Time spent publishing events to the broker",
        ))
        .expect("metric");

        let subscribe_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "event_subscribe_duration_seconds",
            "Time spent opening trip subscriptions",
        ))
        .expect("metric");

        let handler_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "event_handler_duration_seconds",
            "Time spent inside in-process event handlers",
        ))
        .expect("metric");

        let errors_total = IntCounterVec::new(
            Opts::new("event_errors_total", "Event subsystem failures"),
            &["operation", "type"], // operation: publish|publish_batch|subscribe|process
        )
        .expect("metric");

        let events_total = IntCounterVec::new(
            Opts::new("events_total", "Events published and delivered"),
            &["operation", "type"], // operation: publish|receive, type: event type
        )
        .expect("metric");

        let events_routed_total = IntCounterVec::new(
            Opts::new("events_routed_total", "Events routed to in-process handlers"),
            &["event_type"],
        )
        .expect("metric");

        let events_discarded_total = IntCounterVec::new(
            Opts::new("events_discarded_total", "Events discarded by the router"),
            &["reason"], // no_handlers
        )
        .expect("metric");

        let handler_errors_total = IntCounterVec::new(
            Opts::new("event_handler_errors_total", "In-process handler failures"),
            &["event_type"],
        )
        .expect("metric");

        let active_subscribers =
            IntGauge::new("event_active_subscribers", "Subscriptions currently ready")
                .expect("metric");

        let handlers_total =
            IntGauge::new("event_handlers_total", "Distinct registered event handlers")
                .expect("metric");

        registry
            .register(Box::new(publish_duration_seconds.clone()))
            .expect("register");
        registry
            .register(Box::new(subscribe_duration_seconds.clone()))
            .expect("register");
        registry
            .register(Box::new(handler_duration_seconds.clone()))
            .expect("register");
        registry.register(Box::new(errors_total.clone())).expect("register");
        registry.register(Box::new(events_total.clone())).expect("register");
        registry
            .register(Box::new(events_routed_total.clone()))
            .expect("register");
        registry
            .register(Box::new(events_discarded_total.clone()))
            .expect("register");
        registry
            .register(Box::new(handler_errors_total.clone()))
            .expect("register");
        registry
            .register(Box::new(active_subscribers.clone()))
            .expect("register");
        registry.register(Box::new(handlers_total.clone())).expect("register");

        Self {
            registry,
            publish_duration_seconds,
            subscribe_duration_seconds,
            handler_duration_seconds,
            errors_total,
            events_total,
            events_routed_total,
            events_discarded_total,
            handler_errors_total,
            active_subscribers,
            handlers_total,
        }
    }

    /// Count a failure of `operation` under the error's cause label
    pub fn record_error(&self, operation: &str, err: &EventError) {
        self.errors_total
            .with_label_values(&[operation, err.metric_label()])
            .inc();
    }

    pub fn error_count(&self, operation: &str, kind: &str) -> u64 {
        self.errors_total.with_label_values(&[operation, kind]).get()
    }

    pub fn event_count(&self, operation: &str, event_type: &str) -> u64 {
        self.events_total
            .with_label_values(&[operation, event_type])
            .get()
    }

    /// Text exposition of every instrument
    pub fn render(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&metric_families, &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for EventMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: Lazy<RwLock<Arc<EventMetrics>>> =
    Lazy::new(|| RwLock::new(Arc::new(EventMetrics::new())));

/// Process-wide metrics, created on first use
pub fn global() -> Arc<EventMetrics> {
    GLOBAL
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Rebind the process-wide metrics to a fresh registry
///
/// Components built before the reset keep reporting to the old binding.
pub fn reset_for_testing() -> Arc<EventMetrics> {
    let fresh = Arc::new(EventMetrics::new());
    *GLOBAL.write().unwrap_or_else(PoisonError::into_inner) = fresh.clone();
    fresh
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn render_exposes_stable_names() {
        let metrics = EventMetrics::new();
        metrics.record_error("publish", &EventError::Cancelled);
        metrics
            .events_total
            .with_label_values(&["publish", "trip.created"])
            .inc();
        metrics
            .events_routed_total
            .with_label_values(&["trip.created"])
            .inc();
        metrics
            .events_discarded_total
            .with_label_values(&["no_handlers"])
            .inc();
        metrics
            .handler_errors_total
            .with_label_values(&["trip.created"])
            .inc();
        metrics.publish_duration_seconds.observe(0.01);

        let text = metrics.render();
        for name in [
            "event_publish_duration_seconds",
            "event_subscribe_duration_seconds",
            "event_handler_duration_seconds",
            "event_errors_total",
            "events_total",
            "events_routed_total",
            "events_discarded_total",
            "event_handler_errors_total",
            "event_active_subscribers",
            "event_handlers_total",
        ] {
            assert!(text.contains(name), "missing metric {name}");
        }
        assert!(text.contains(r#"event_errors_total{operation="publish",type="cancelled"} 1"#));
    }

    #[test]
    #[serial]
    fn reset_rebinds_without_carrying_counts() {
        let before = global();
        before.active_subscribers.set(7);

        let fresh = reset_for_testing();
        assert_eq!(fresh.active_subscribers.get(), 0);
        assert!(Arc::ptr_eq(&fresh, &global()));
        assert!(!Arc::ptr_eq(&fresh, &before));
    }
}
