//! Service facade composing local routing and remote publishing

use crate::config::EventsConfig;
use crate::envelope::{Event, EventType};
use crate::error::{EventError, EventResult};
use crate::metrics::{self, EventMetrics};
use crate::publisher::{EventPublisher, Publisher};
use crate::router::{EventHandler, Router};
use crate::subscription::EventStream;
use async_trait::async_trait;
use event_bus::EventBus;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Entry point for producers and consumers of trip events
///
/// Publishing delivers to local handlers first and then to the broker. A
/// local handler failure is logged and never fails the publish; a broker
/// failure is returned to the caller.
pub struct EventService {
    publisher: Publisher,
    router: Router,
    handlers: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
}

impl EventService {
    pub fn new(bus: Arc<dyn EventBus>, config: EventsConfig) -> Self {
        Self::with_metrics(bus, config, metrics::global())
    }

    pub fn with_metrics(
        bus: Arc<dyn EventBus>,
        config: EventsConfig,
        metrics: Arc<EventMetrics>,
    ) -> Self {
        Self {
            publisher: Publisher::with_metrics(bus, config, metrics.clone()),
            router: Router::with_metrics(metrics),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    fn write_handlers(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<dyn EventHandler>>> {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_handler(&self, name: &str, handler: Arc<dyn EventHandler>) -> EventResult<()> {
        let mut handlers = self.write_handlers();
        if handlers.contains_key(name) {
            return Err(EventError::DuplicateName(name.to_string()));
        }

        self.router.register_handler(handler.clone());
        handlers.insert(name.to_string(), handler);
        info!(handler = %name, "Event handler registered");
        Ok(())
    }

    pub fn unregister_handler(&self, name: &str) -> EventResult<()> {
        let handler = self
            .write_handlers()
            .remove(name)
            .ok_or_else(|| EventError::NotFound(format!("handler {name}")))?;

        self.router.unregister_handler(&handler);
        info!(handler = %name, "Event handler unregistered");
        Ok(())
    }

    /// Registered handler names, sorted
    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    async fn route_locally(&self, cancel: &CancellationToken, event: &Event) {
        if let Err(err) = self.router.handle_event(cancel, event).await {
            error!(
                trip_id = %event.trip_id,
                event_id = %event.id,
                event_type = %event.event_type,
                error = %err,
                "Local event routing failed"
            );
        }
    }
}

#[async_trait]
impl EventPublisher for EventService {
    async fn publish(
        &self,
        cancel: &CancellationToken,
        trip_id: &str,
        event: Event,
    ) -> EventResult<()> {
        // Stamp once so local handlers and subscribers see the same identity
        let event = event.stamped();
        self.route_locally(cancel, &event).await;
        self.publisher.publish(cancel, trip_id, event).await
    }

    async fn publish_batch(
        &self,
        cancel: &CancellationToken,
        trip_id: &str,
        events: Vec<Event>,
    ) -> EventResult<()> {
        let events: Vec<Event> = events.into_iter().map(Event::stamped).collect();
        for event in &events {
            self.route_locally(cancel, event).await;
        }
        self.publisher.publish_batch(cancel, trip_id, events).await
    }

    async fn subscribe(
        &self,
        cancel: &CancellationToken,
        trip_id: &str,
        user_id: &str,
        filters: &[EventType],
    ) -> EventResult<EventStream> {
        self.publisher
            .subscribe(cancel, trip_id, user_id, filters)
            .await
    }

    async fn unsubscribe(
        &self,
        cancel: &CancellationToken,
        trip_id: &str,
        user_id: &str,
    ) -> EventResult<()> {
        self.publisher.unsubscribe(cancel, trip_id, user_id).await
    }

    async fn shutdown(&self, cancel: &CancellationToken) -> EventResult<()> {
        let publisher_result = self.publisher.shutdown(cancel).await;
        if let Err(err) = &publisher_result {
            warn!(error = %err, "Publisher shutdown incomplete");
        }

        for name in self.handler_names() {
            if let Err(err) = self.unregister_handler(&name) {
                warn!(handler = %name, error = %err, "Failed to unregister handler during shutdown");
            }
        }
        self.write_handlers().clear();

        info!("Event service shut down");
        publisher_result
    }
}
