//! In-process event routing
//!
//! Handlers register for the event types they support. `handle_event` runs
//! every handler for the event's type concurrently and reports all failures
//! together once the last one finishes.

use crate::envelope::{Event, EventType};
use crate::error::{EventError, EventResult, HandlerFailure};
use crate::metrics::{self, EventMetrics};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// An in-process consumer of trip events
///
/// Handlers may be invoked concurrently and should return promptly once
/// `cancel` fires.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Event types this handler wants to see
    fn supported_events(&self) -> Vec<EventType>;

    async fn handle(&self, cancel: &CancellationToken, event: &Event) -> anyhow::Result<()>;

    /// Name used in logs and aggregated errors
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

type HandlerMap = HashMap<EventType, Vec<Arc<dyn EventHandler>>>;

pub struct Router {
    handlers: RwLock<HandlerMap>,
    metrics: Arc<EventMetrics>,
}

impl Router {
    pub fn new() -> Self {
        Self::with_metrics(metrics::global())
    }

    pub fn with_metrics(metrics: Arc<EventMetrics>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    fn read_handlers(&self) -> RwLockReadGuard<'_, HandlerMap> {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_handlers(&self) -> RwLockWriteGuard<'_, HandlerMap> {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        let supported = handler.supported_events();
        if supported.is_empty() {
            warn!(handler = %handler.name(), "Handler supports no event types, not registering");
            return;
        }

        let mut handlers = self.write_handlers();
        for event_type in supported {
            handlers
                .entry(event_type)
                .or_default()
                .push(handler.clone());
        }
        self.metrics
            .handlers_total
            .set(distinct_handlers(&handlers) as i64);
        debug!(handler = %handler.name(), "Handler registered");
    }

    pub fn unregister_handler(&self, handler: &Arc<dyn EventHandler>) {
        let mut handlers = self.write_handlers();
        for event_type in handler.supported_events() {
            if let Some(list) = handlers.get_mut(&event_type) {
                list.retain(|h| !Arc::ptr_eq(h, handler));
                if list.is_empty() {
                    handlers.remove(&event_type);
                }
            }
        }
        self.metrics
            .handlers_total
            .set(distinct_handlers(&handlers) as i64);
        debug!(handler = %handler.name(), "Handler unregistered");
    }

    /// Handlers currently registered for `event_type`, in registration order
    pub fn handlers_for(&self, event_type: EventType) -> Vec<Arc<dyn EventHandler>> {
        self.read_handlers()
            .get(&event_type)
            .cloned()
            .unwrap_or_default()
    }

    pub fn handler_count(&self) -> usize {
        distinct_handlers(&self.read_handlers())
    }

    /// Run every handler registered for the event's type
    ///
    /// Returns `HandlerFailures` naming each failing (or panicking) handler
    /// once; success only if all of them succeeded. An event with no
    /// handlers is counted as discarded and succeeds.
    pub async fn handle_event(&self, cancel: &CancellationToken, event: &Event) -> EventResult<()> {
        if cancel.is_cancelled() {
            return Err(EventError::Cancelled);
        }

        let event_type = event.event_type;
        let handlers = self.handlers_for(event_type);
        if handlers.is_empty() {
            self.metrics
                .events_discarded_total
                .with_label_values(&["no_handlers"])
                .inc();
            debug!(event_type = %event_type, event_id = %event.id, "No handlers for event");
            return Ok(());
        }

        self.metrics
            .events_routed_total
            .with_label_values(&[event_type.as_str()])
            .inc();

        let shared = Arc::new(event.clone());
        let mut tasks = JoinSet::new();

        for handler in handlers {
            let event = shared.clone();
            let cancel = cancel.clone();
            let metrics = self.metrics.clone();

            tasks.spawn(async move {
                let name = handler.name().to_string();
                let start = Instant::now();
                let outcome = AssertUnwindSafe(handler.handle(&cancel, &event))
                    .catch_unwind()
                    .await;
                metrics
                    .handler_duration_seconds
                    .observe(start.elapsed().as_secs_f64());

                let result = outcome.unwrap_or_else(|panic| {
                    Err(anyhow::anyhow!("handler panicked: {}", panic_message(&*panic)))
                });
                (name, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (handler, error) = match joined {
                Ok((_, Ok(()))) => continue,
                Ok((name, Err(err))) => (name, err),
                Err(join_err) => ("unknown".to_string(), anyhow::anyhow!(join_err)),
            };

            self.metrics
                .handler_errors_total
                .with_label_values(&[event_type.as_str()])
                .inc();
            error!(
                handler = %handler,
                event_type = %event_type,
                event_id = %event.id,
                trip_id = %event.trip_id,
                error = %format!("{error:#}"),
                "Event handler failed"
            );
            failures.push(HandlerFailure {
                handler,
                event_type,
                error,
            });
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(EventError::HandlerFailures(failures))
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

fn distinct_handlers(handlers: &HandlerMap) -> usize {
    handlers
        .values()
        .flatten()
        .map(|h| Arc::as_ptr(h) as *const () as usize)
        .collect::<HashSet<_>>()
        .len()
}
