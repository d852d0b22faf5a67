use crate::envelope::{Event, EventType};
use crate::error::{EventError, EventResult};
use crate::publisher::EventPublisher;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Build a stamped envelope around `data` and publish it
///
/// The event gets a fresh id, the current time and version 1. A payload
/// that cannot be serialized fails with [`EventError::Serialization`];
/// publish errors are returned unchanged.
///
/// # Example
/// ```rust,no_run
/// use std::sync::Arc;
/// use event_bus::InMemoryBus;
/// use serde_json::json;
/// use tokio_util::sync::CancellationToken;
/// use trip_events::{publish_event, EventType, EventsConfig, Publisher};
///
/// # async fn example() -> Result<(), trip_events::EventError> {
/// let publisher = Publisher::new(Arc::new(InMemoryBus::new()), EventsConfig::default());
/// publish_event(
///     &publisher,
///     &CancellationToken::new(),
///     EventType::MemberAdded,
///     "trip-42",
///     "user-7",
///     &json!({"member_id": "user-9", "role": "member"}),
///     "member-service",
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn publish_event<P, T>(
    publisher: &P,
    cancel: &CancellationToken,
    event_type: EventType,
    trip_id: &str,
    user_id: &str,
    data: &T,
    source: &str,
) -> EventResult<()>
where
    P: EventPublisher + ?Sized,
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_value(data).map_err(EventError::Serialization)?;
    let event = Event::new(event_type, trip_id, user_id, source)
        .with_payload(payload)
        .stamped();

    publisher.publish(cancel, trip_id, event).await
}
