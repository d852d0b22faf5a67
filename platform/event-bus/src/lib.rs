//! # EventBus Abstraction
//!
//! The broker port used by the trip event subsystem to move serialized
//! events between backend processes.
//!
//! ## Implementations
//!
//! - **RedisBus**: Production implementation using Redis Pub/Sub
//! - **InMemoryBus**: Test/dev implementation using bounded in-memory sinks
//!
//! Both implementations address channels by plain strings; callers derive
//! the channel for a trip with [`trip_channel`] so every process agrees on
//! the naming (`trip:<trip_id>`).
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{trip_channel, EventBus, InMemoryBus, RedisBus};
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Production: Redis
//! let bus: Arc<dyn EventBus> = Arc::new(RedisBus::connect("redis://localhost:6379").await?);
//!
//! // Dev/Test: In-Memory
//! let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
//!
//! let channel = trip_channel("trip-42");
//! let mut sub = bus.subscribe(&channel).await?;
//!
//! bus.publish(&channel, b"{}".to_vec()).await?;
//!
//! while let Some(msg) = sub.next().await {
//!     println!("Received: {} bytes on {}", msg.payload.len(), msg.channel);
//! }
//! sub.close();
//! # Ok(())
//! # }
//! ```

pub mod retry;
mod inmemory_bus;
mod redis_bus;
mod subscription;

pub use inmemory_bus::InMemoryBus;
pub use redis_bus::RedisBus;
pub use subscription::{BusSubscription, CloseHandle};

use async_trait::async_trait;
use std::fmt;

/// Prefix shared by every trip channel.
pub const TRIP_CHANNEL_PREFIX: &str = "trip:";

/// Derive the broker channel for a trip.
///
/// The mapping is total and injective: distinct trip ids always yield
/// distinct channels.
pub fn trip_channel(trip_id: &str) -> String {
    format!("{TRIP_CHANNEL_PREFIX}{trip_id}")
}

/// A message received from the event bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// The channel this message was published to
    pub channel: String,
    /// The message payload (raw bytes)
    pub payload: Vec<u8>,
}

impl BusMessage {
    /// Create a new bus message
    pub fn new(channel: String, payload: Vec<u8>) -> Self {
        Self { channel, payload }
    }
}

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe to channel: {0}")]
    SubscribeError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("invalid channel: {0}")]
    InvalidChannel(String),
}

impl BusError {
    /// Whether retrying the same call could succeed
    pub fn is_transient(&self) -> bool {
        !matches!(self, BusError::InvalidChannel(_))
    }
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Core broker abstraction for publish-subscribe messaging
///
/// Delivery is at-most-once. Within a single channel each subscriber sees
/// messages in publish order; nothing is promised across channels.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a message to a channel
    ///
    /// # Returns
    /// * `Ok(())` if the broker accepted the message
    /// * `Err(BusError)` if publishing failed
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Publish several messages to one channel in a single round-trip
    ///
    /// Messages are enqueued contiguously and in order. The broker does not
    /// make them atomically visible to subscribers, and a failure reports
    /// the whole batch as failed.
    async fn publish_batch(&self, channel: &str, payloads: Vec<Vec<u8>>) -> BusResult<()>;

    /// Subscribe to a single channel
    ///
    /// The returned handle is a lazy stream of messages that ends when the
    /// handle is closed or the broker drops the subscription.
    async fn subscribe(&self, channel: &str) -> BusResult<BusSubscription>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}

pub(crate) fn validate_channel(channel: &str) -> BusResult<()> {
    if channel.is_empty() {
        return Err(BusError::InvalidChannel("channel cannot be empty".to_string()));
    }
    Ok(())
}
