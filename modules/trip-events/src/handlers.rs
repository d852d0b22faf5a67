use crate::envelope::{Event, EventType};
use crate::router::EventHandler;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

/// Logs every trip event it receives
///
/// Registered by the relay as its local consumer so each event that passes
/// through the process leaves one structured log line.
#[derive(Debug, Default)]
pub struct ActivityLogHandler {
    handled: AtomicU64,
}

impl ActivityLogHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events logged so far
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventHandler for ActivityLogHandler {
    fn supported_events(&self) -> Vec<EventType> {
        EventType::ALL.to_vec()
    }

    async fn handle(&self, _cancel: &CancellationToken, event: &Event) -> anyhow::Result<()> {
        self.handled.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            trip_id = %event.trip_id,
            user_id = %event.user_id,
            source = %event.metadata.source,
            correlation_id = ?event.metadata.correlation_id,
            "Trip activity"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "activity-log"
    }
}
