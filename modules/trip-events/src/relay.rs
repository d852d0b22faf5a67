//! Broker-to-handler relay
//!
//! Subscribes to a fixed set of trips and feeds every event that arrives on
//! the broker through the service's local handlers, so a process that never
//! publishes still sees other processes' traffic.

use crate::error::EventResult;
use crate::publisher::EventPublisher;
use crate::service::EventService;
use crate::subscription::EventStream;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// User id the relay subscribes under
pub const RELAY_USER_ID: &str = "trip-events-relay";

/// Open one relay subscription per trip and spawn a task draining each
///
/// The returned tracker is already closed: `wait()` resolves once every
/// relay stream has ended, which happens on service shutdown or when
/// `cancel` fires. If any subscribe fails, the subscriptions opened so far
/// are released and the error is returned.
pub async fn relay_trips(
    service: Arc<EventService>,
    cancel: &CancellationToken,
    trip_ids: &[String],
) -> EventResult<TaskTracker> {
    let mut streams = Vec::with_capacity(trip_ids.len());
    for trip_id in trip_ids {
        match service.subscribe(cancel, trip_id, RELAY_USER_ID, &[]).await {
            Ok(stream) => streams.push(stream),
            Err(err) => {
                for opened in &streams {
                    if let Err(cleanup) = service
                        .unsubscribe(cancel, opened.trip_id(), RELAY_USER_ID)
                        .await
                    {
                        warn!(trip_id = %opened.trip_id(), error = %cleanup, "Relay cleanup failed");
                    }
                }
                return Err(err);
            }
        }
    }

    let tasks = TaskTracker::new();
    for stream in streams {
        info!(trip_id = %stream.trip_id(), "Relaying trip events");
        tasks.spawn(relay_stream(service.clone(), cancel.clone(), stream));
    }
    tasks.close();
    Ok(tasks)
}

async fn relay_stream(
    service: Arc<EventService>,
    cancel: CancellationToken,
    mut stream: EventStream,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = stream.recv() => match next {
                Some(event) => event,
                None => break,
            },
        };

        if let Err(err) = service.router().handle_event(&cancel, &event).await {
            warn!(
                trip_id = %event.trip_id,
                event_id = %event.id,
                event_type = %event.event_type,
                error = %err,
                "Relayed event failed in local handlers"
            );
        }
    }
    debug!(trip_id = %stream.trip_id(), "Relay stream ended");
}
