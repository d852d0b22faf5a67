//! In-memory implementation of the EventBus trait for testing and development

use crate::subscription::{BusSubscription, CloseHandle};
use crate::{validate_channel, BusError, BusMessage, BusResult, EventBus};
use async_trait::async_trait;
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Default per-subscription sink capacity
pub const DEFAULT_SINK_CAPACITY: usize = 1000;

struct Sink {
    id: u64,
    tx: mpsc::Sender<BusMessage>,
}

struct Inner {
    channels: Mutex<HashMap<String, Vec<Sink>>>,
    capacity: usize,
    next_id: AtomicU64,
    unavailable: AtomicBool,
    dropped: AtomicU64,
}

impl Inner {
    fn channels(&self) -> MutexGuard<'_, HashMap<String, Vec<Sink>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_available(&self) -> BusResult<()> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(BusError::PublishError("broker unavailable".to_string()));
        }
        Ok(())
    }

    /// Hand a message to every sink on the channel without blocking.
    ///
    /// Caller holds the channel lock, so consecutive calls stay contiguous.
    fn deliver(&self, channels: &mut HashMap<String, Vec<Sink>>, channel: &str, payload: Vec<u8>) {
        let Some(sinks) = channels.get_mut(channel) else {
            return;
        };

        let msg = BusMessage::new(channel.to_string(), payload);
        sinks.retain(|sink| match sink.tx.try_send(msg.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(channel = %channel, sink = sink.id, "InMemoryBus: sink full, dropping message");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });

        if sinks.is_empty() {
            channels.remove(channel);
        }
    }

    fn remove_sink(&self, channel: &str, id: u64) {
        let mut channels = self.channels();
        if let Some(sinks) = channels.get_mut(channel) {
            sinks.retain(|sink| sink.id != id);
            if sinks.is_empty() {
                channels.remove(channel);
            }
        }
    }
}

/// EventBus implementation using in-memory channels
///
/// This implementation is suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without a Redis server
/// - Integration tests that need fast, isolated message buses
///
/// Each subscription owns a bounded sink. Publishing never blocks: when a
/// sink is full the message is dropped for that subscriber only. Messages
/// on one channel reach each sink in publish order.
///
/// # Example
/// ```rust
/// use event_bus::{EventBus, InMemoryBus};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
///
/// // Subscribe before publishing
/// let mut sub = bus.subscribe("trip:t1").await?;
///
/// bus.publish("trip:t1", b"hello".to_vec()).await?;
///
/// let msg = sub.next().await.unwrap();
/// assert_eq!(msg.channel, "trip:t1");
/// assert_eq!(msg.payload, b"hello");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

impl InMemoryBus {
    /// Create a new in-memory event bus
    ///
    /// Each subscription buffers up to 1000 messages before dropping.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SINK_CAPACITY)
    }

    /// Create a new in-memory event bus with a custom per-subscription buffer
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                channels: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
                next_id: AtomicU64::new(1),
                unavailable: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Drop every subscription and clear test controls
    ///
    /// Open subscription streams end as if the broker went away.
    pub fn reset(&self) {
        self.inner.channels().clear();
        self.inner.unavailable.store(false, Ordering::Release);
        self.inner.dropped.store(0, Ordering::Relaxed);
    }

    /// Number of live subscriptions on a channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels()
            .get(channel)
            .map(|sinks| sinks.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Simulate a broker outage; publishes and new subscriptions fail while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::Release);
    }

    /// Messages dropped because a subscriber sink was full
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> BusResult<()> {
        validate_channel(channel)?;
        self.inner.ensure_available()?;

        let mut channels = self.inner.channels();
        self.inner.deliver(&mut channels, channel, payload);

        Ok(())
    }

    async fn publish_batch(&self, channel: &str, payloads: Vec<Vec<u8>>) -> BusResult<()> {
        validate_channel(channel)?;
        if payloads.is_empty() {
            return Ok(());
        }
        self.inner.ensure_available()?;

        let mut channels = self.inner.channels();
        for payload in payloads {
            self.inner.deliver(&mut channels, channel, payload);
        }

        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> BusResult<BusSubscription> {
        validate_channel(channel)?;
        if self.inner.unavailable.load(Ordering::Acquire) {
            return Err(BusError::SubscribeError("broker unavailable".to_string()));
        }

        let (tx, mut rx) = mpsc::channel(self.inner.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        self.inner
            .channels()
            .entry(channel.to_string())
            .or_default()
            .push(Sink { id, tx });

        let inner = self.inner.clone();
        let owned_channel = channel.to_string();
        let handle = CloseHandle::new(move || inner.remove_sink(&owned_channel, id));

        let signal = handle.signal();
        let stream = async_stream::stream! {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = signal.cancelled() => None,
                    msg = rx.recv() => msg,
                };
                match next {
                    Some(msg) => yield msg,
                    None => break,
                }
            }
        };

        Ok(BusSubscription::new(channel.to_string(), stream.boxed(), handle))
    }
}
