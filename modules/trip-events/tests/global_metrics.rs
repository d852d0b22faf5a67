//! Components built without injected metrics report to the process-wide binding

use event_bus::InMemoryBus;
use serial_test::serial;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use trip_events::{metrics, ActivityLogHandler, Event, EventPublisher, EventService, EventType, EventsConfig};

#[tokio::test]
#[serial]
async fn service_reports_to_global_registry() {
    let fresh = metrics::reset_for_testing();
    let service = EventService::new(Arc::new(InMemoryBus::new()), EventsConfig::default());
    service
        .register_handler("activity-log", Arc::new(ActivityLogHandler::new()))
        .unwrap();
    let cancel = CancellationToken::new();

    let _stream = service.subscribe(&cancel, "t1", "u1", &[]).await.unwrap();
    service
        .publish(&cancel, "t1", Event::new(EventType::TripCreated, "t1", "u1", "test"))
        .await
        .unwrap();

    assert_eq!(fresh.active_subscribers.get(), 1);
    assert_eq!(fresh.handlers_total.get(), 1);
    assert_eq!(fresh.event_count("publish", "trip.created"), 1);
    assert_eq!(
        fresh
            .events_routed_total
            .with_label_values(&["trip.created"])
            .get(),
        1
    );

    service.shutdown(&cancel).await.unwrap();
    assert_eq!(fresh.active_subscribers.get(), 0);
    assert_eq!(fresh.handlers_total.get(), 0);
}

#[tokio::test]
#[serial]
async fn reset_starts_from_zero() {
    let first = metrics::reset_for_testing();
    first
        .events_discarded_total
        .with_label_values(&["no_handlers"])
        .inc();

    let second = metrics::reset_for_testing();
    assert!(!second.render().contains("events_discarded_total{"));
    assert!(second.render().contains("event_active_subscribers 0"));
}
