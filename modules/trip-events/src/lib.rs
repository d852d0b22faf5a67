//! # Trip Events
//!
//! Distribution of trip-scoped domain events between backend processes and
//! connected clients.
//!
//! - [`Publisher`] validates, stamps and publishes events on the broker
//!   channel `trip:<trip_id>` and owns one subscription per (trip, user).
//! - [`Router`] fans events out to in-process [`EventHandler`]s
//!   concurrently and aggregates their failures.
//! - [`EventService`] composes both: local routing first, then remote
//!   publishing, plus a registry of uniquely named handlers.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use event_bus::InMemoryBus;
//! use tokio_util::sync::CancellationToken;
//! use trip_events::{Event, EventPublisher, EventService, EventType, EventsConfig};
//!
//! # async fn example() -> Result<(), trip_events::EventError> {
//! let service = EventService::new(Arc::new(InMemoryBus::new()), EventsConfig::default());
//! let cancel = CancellationToken::new();
//!
//! let mut stream = service
//!     .subscribe(&cancel, "trip-1", "user-1", &[EventType::ChatMessageSent])
//!     .await?;
//!
//! service
//!     .publish(
//!         &cancel,
//!         "trip-1",
//!         Event::new(EventType::ChatMessageSent, "trip-1", "user-2", "chat-service"),
//!     )
//!     .await?;
//!
//! if let Some(event) = stream.recv().await {
//!     println!("{} from {}", event.event_type, event.user_id);
//! }
//!
//! service.shutdown(&cancel).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod envelope;
pub mod error;
pub mod handlers;
pub mod helper;
pub mod metrics;
pub mod publisher;
pub mod relay;
pub mod router;
pub mod service;
pub mod subscription;

pub use config::{BusType, Config, EventsConfig, RedisConfig};
pub use envelope::{Event, EventMetadata, EventType, UnknownEventType, SYSTEM_USER_ID};
pub use error::{EventError, EventResult, HandlerFailure};
pub use handlers::ActivityLogHandler;
pub use helper::publish_event;
pub use metrics::EventMetrics;
pub use publisher::{EventPublisher, Publisher};
pub use relay::{relay_trips, RELAY_USER_ID};
pub use router::{EventHandler, Router};
pub use service::EventService;
pub use subscription::{EventStream, SubscriptionState};
