//! Publisher: validated publishing and per-(trip, user) subscriptions
//!
//! Every subscription owns one dispatch task that reads the broker channel
//! `trip:<trip_id>`, decodes and filters events, and hands them to a bounded
//! delivery channel with `try_send`. A full channel drops the event and
//! counts it; the dispatcher never blocks on a slow consumer.

use crate::config::EventsConfig;
use crate::envelope::{Event, EventType};
use crate::error::{EventError, EventResult};
use crate::metrics::{self, EventMetrics};
use crate::subscription::{EventStream, SubscriptionKey, SubscriptionRecord, SubscriptionState};
use async_trait::async_trait;
use event_bus::{trip_channel, BusMessage, BusResult, EventBus};
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Publishing and subscription operations shared by [`Publisher`] and the
/// service facade
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Validate, stamp and publish one event on its trip channel
    async fn publish(&self, cancel: &CancellationToken, trip_id: &str, event: Event)
        -> EventResult<()>;

    /// Publish several events for one trip in a single broker round-trip
    async fn publish_batch(
        &self,
        cancel: &CancellationToken,
        trip_id: &str,
        events: Vec<Event>,
    ) -> EventResult<()>;

    /// Open the subscription for `(trip_id, user_id)`
    ///
    /// An empty `filters` slice admits every event type.
    async fn subscribe(
        &self,
        cancel: &CancellationToken,
        trip_id: &str,
        user_id: &str,
        filters: &[EventType],
    ) -> EventResult<EventStream>;

    async fn unsubscribe(
        &self,
        cancel: &CancellationToken,
        trip_id: &str,
        user_id: &str,
    ) -> EventResult<()>;

    /// Close every subscription and wait for their dispatch tasks
    async fn shutdown(&self, cancel: &CancellationToken) -> EventResult<()>;
}

type Registry = HashMap<SubscriptionKey, Arc<SubscriptionRecord>>;

/// Broker-backed publisher that owns every active subscription
pub struct Publisher {
    bus: Arc<dyn EventBus>,
    config: EventsConfig,
    metrics: Arc<EventMetrics>,
    subscriptions: RwLock<Registry>,
    /// Signalled whenever a subscription is registered
    registered: Notify,
    tasks: TaskTracker,
}

impl Publisher {
    /// Create a publisher reporting to the process-wide metrics
    pub fn new(bus: Arc<dyn EventBus>, config: EventsConfig) -> Self {
        Self::with_metrics(bus, config, metrics::global())
    }

    pub fn with_metrics(
        bus: Arc<dyn EventBus>,
        config: EventsConfig,
        metrics: Arc<EventMetrics>,
    ) -> Self {
        Self {
            bus,
            config,
            metrics,
            subscriptions: RwLock::new(HashMap::new()),
            registered: Notify::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &EventsConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<EventMetrics> {
        &self.metrics
    }

    /// Number of subscriptions currently registered
    pub fn active_subscriptions(&self) -> usize {
        self.read_subscriptions().len()
    }

    /// Lifecycle position of the registered subscription, if any
    pub fn subscription_state(&self, trip_id: &str, user_id: &str) -> Option<SubscriptionState> {
        self.read_subscriptions()
            .get(&SubscriptionKey::new(trip_id, user_id))
            .map(|record| record.state())
    }

    fn read_subscriptions(&self) -> RwLockReadGuard<'_, Registry> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_subscriptions(&self) -> RwLockWriteGuard<'_, Registry> {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove `key` only if it still maps to `record`
    fn forget(&self, key: &SubscriptionKey, record: &Arc<SubscriptionRecord>) {
        let mut subs = self.write_subscriptions();
        if subs
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, record))
        {
            subs.remove(key);
        }
    }

    async fn publish_one(
        &self,
        cancel: &CancellationToken,
        trip_id: &str,
        event: Event,
    ) -> EventResult<()> {
        if cancel.is_cancelled() {
            return Err(EventError::Cancelled);
        }

        event.validate(trip_id)?;
        let event = event.stamped();
        let payload = event.encode()?;
        let channel = trip_channel(trip_id);

        bounded(cancel, self.config.publish_timeout, self.bus.publish(&channel, payload)).await?;

        self.metrics
            .events_total
            .with_label_values(&["publish", event.event_type.as_str()])
            .inc();
        debug!(
            trip_id = %trip_id,
            event_id = %event.id,
            event_type = %event.event_type,
            "Event published"
        );
        Ok(())
    }

    async fn publish_many(
        &self,
        cancel: &CancellationToken,
        trip_id: &str,
        events: Vec<Event>,
    ) -> EventResult<()> {
        if cancel.is_cancelled() {
            return Err(EventError::Cancelled);
        }

        for event in &events {
            event.validate(trip_id)?;
        }
        let events: Vec<Event> = events.into_iter().map(Event::stamped).collect();
        let payloads = events
            .iter()
            .map(Event::encode)
            .collect::<EventResult<Vec<_>>>()?;
        let channel = trip_channel(trip_id);

        bounded(
            cancel,
            self.config.publish_timeout,
            self.bus.publish_batch(&channel, payloads),
        )
        .await?;

        for event in &events {
            self.metrics
                .events_total
                .with_label_values(&["publish", event.event_type.as_str()])
                .inc();
        }
        debug!(trip_id = %trip_id, count = events.len(), "Event batch published");
        Ok(())
    }

    async fn open_subscription(
        &self,
        cancel: &CancellationToken,
        trip_id: &str,
        user_id: &str,
        filters: &[EventType],
    ) -> EventResult<EventStream> {
        if cancel.is_cancelled() {
            return Err(EventError::Cancelled);
        }

        let key = SubscriptionKey::new(trip_id, user_id);
        let record = Arc::new(SubscriptionRecord::new(trip_id, user_id, filters));
        {
            let mut subs = self.write_subscriptions();
            if subs.contains_key(&key) {
                return Err(EventError::DuplicateSubscription {
                    trip_id: trip_id.to_string(),
                    user_id: user_id.to_string(),
                });
            }
            subs.insert(key.clone(), record.clone());
        }
        self.registered.notify_waiters();

        let channel = trip_channel(trip_id);
        let broker_sub = match bounded(
            cancel,
            self.config.subscribe_timeout,
            self.bus.subscribe(&channel),
        )
        .await
        {
            Ok(sub) => sub,
            Err(err) => {
                self.forget(&key, &record);
                return Err(err);
            }
        };

        let (messages, close_handle) = broker_sub.into_parts();
        record.attach_broker(close_handle);

        let (delivery, rx) = mpsc::channel(self.config.event_buffer_size.max(1));
        let (ready_tx, ready_rx) = oneshot::channel();
        self.tasks.spawn(dispatch(
            record.clone(),
            messages,
            delivery,
            ready_tx,
            self.metrics.clone(),
        ));

        match await_ready(cancel, self.config.subscribe_timeout, ready_rx).await {
            Readiness::Ready => {}
            Readiness::TimedOut => warn!(
                trip_id = %trip_id,
                user_id = %user_id,
                timeout_ms = self.config.subscribe_timeout.as_millis() as u64,
                "Subscription readiness timed out, returning stream anyway"
            ),
            Readiness::Cancelled => {
                record.cancel(&self.metrics);
                self.forget(&key, &record);
                return Err(EventError::Cancelled);
            }
        }

        info!(
            trip_id = %trip_id,
            user_id = %user_id,
            channel = %channel,
            filters = filters.len(),
            "Subscription opened"
        );
        Ok(EventStream::new(trip_id, user_id, rx))
    }
}

#[async_trait]
impl EventPublisher for Publisher {
    async fn publish(
        &self,
        cancel: &CancellationToken,
        trip_id: &str,
        event: Event,
    ) -> EventResult<()> {
        let start = Instant::now();
        let event_type = event.event_type;
        let result = self.publish_one(cancel, trip_id, event).await;
        self.metrics
            .publish_duration_seconds
            .observe(start.elapsed().as_secs_f64());

        if let Err(err) = &result {
            self.metrics.record_error("publish", err);
            warn!(
                trip_id = %trip_id,
                event_type = %event_type,
                error = %err,
                "Event publish failed"
            );
        }
        result
    }

    async fn publish_batch(
        &self,
        cancel: &CancellationToken,
        trip_id: &str,
        events: Vec<Event>,
    ) -> EventResult<()> {
        if events.is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        let count = events.len();
        let result = self.publish_many(cancel, trip_id, events).await;
        self.metrics
            .publish_duration_seconds
            .observe(start.elapsed().as_secs_f64());

        if let Err(err) = &result {
            self.metrics.record_error("publish_batch", err);
            warn!(trip_id = %trip_id, count, error = %err, "Event batch publish failed");
        }
        result
    }

    async fn subscribe(
        &self,
        cancel: &CancellationToken,
        trip_id: &str,
        user_id: &str,
        filters: &[EventType],
    ) -> EventResult<EventStream> {
        let start = Instant::now();
        let result = self
            .open_subscription(cancel, trip_id, user_id, filters)
            .await;
        self.metrics
            .subscribe_duration_seconds
            .observe(start.elapsed().as_secs_f64());

        if let Err(err) = &result {
            self.metrics.record_error("subscribe", err);
            warn!(trip_id = %trip_id, user_id = %user_id, error = %err, "Subscribe failed");
        }
        result
    }

    async fn unsubscribe(
        &self,
        cancel: &CancellationToken,
        trip_id: &str,
        user_id: &str,
    ) -> EventResult<()> {
        if cancel.is_cancelled() {
            return Err(EventError::Cancelled);
        }

        let key = SubscriptionKey::new(trip_id, user_id);
        let record = self.write_subscriptions().remove(&key).ok_or_else(|| {
            EventError::NotFound(format!(
                "subscription for trip {} user {}",
                key.trip_id, key.user_id
            ))
        })?;

        record.cancel(&self.metrics);
        info!(trip_id = %trip_id, user_id = %user_id, "Subscription closed");
        Ok(())
    }

    async fn shutdown(&self, cancel: &CancellationToken) -> EventResult<()> {
        info!(subscriptions = self.active_subscriptions(), "Shutting down publisher");

        // A Subscribe racing this call can register after a sweep; sweep
        // again until the tracker empties with nothing new registered.
        let joined = loop {
            let registered = self.registered.notified();
            let records: Vec<Arc<SubscriptionRecord>> = self
                .write_subscriptions()
                .drain()
                .map(|(_, record)| record)
                .collect();
            for record in &records {
                record.cancel(&self.metrics);
            }

            self.tasks.close();
            let swept = tokio::select! {
                biased;
                _ = cancel.cancelled() => Some(Err(EventError::Cancelled)),
                _ = registered => None,
                _ = self.tasks.wait() => Some(Ok(())),
            };
            self.tasks.reopen();

            if let Some(joined) = swept {
                break joined;
            }
            debug!("Subscription registered during shutdown, sweeping again");
        };

        if joined.is_ok() {
            info!("Publisher shutdown complete");
        }
        joined
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Ready,
    TimedOut,
    Cancelled,
}

/// Wait for the dispatch task's readiness signal under the caller's token
async fn await_ready(
    cancel: &CancellationToken,
    deadline: Duration,
    ready: oneshot::Receiver<()>,
) -> Readiness {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Readiness::Cancelled,
        outcome = tokio::time::timeout(deadline, ready) => match outcome {
            Ok(_) => Readiness::Ready,
            Err(_) => Readiness::TimedOut,
        },
    }
}

/// Run a broker call under the caller's token and a deadline
async fn bounded<T>(
    cancel: &CancellationToken,
    deadline: Duration,
    call: impl Future<Output = BusResult<T>>,
) -> EventResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EventError::Cancelled),
        outcome = tokio::time::timeout(deadline, call) => match outcome {
            Ok(result) => result.map_err(EventError::Transport),
            Err(_) => Err(EventError::Timeout(deadline)),
        },
    }
}

async fn dispatch(
    record: Arc<SubscriptionRecord>,
    mut messages: BoxStream<'static, BusMessage>,
    delivery: mpsc::Sender<Event>,
    ready: oneshot::Sender<()>,
    metrics: Arc<EventMetrics>,
) {
    let cancel = record.token();
    if !cancel.is_cancelled() {
        record.mark_ready(&metrics);
    }
    let _ = ready.send(());

    let exit = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break SubscriptionState::Cancelled,
            msg = messages.next() => msg,
        };
        let Some(msg) = next else {
            break SubscriptionState::BrokerClosed;
        };

        let event = match Event::decode(&msg.payload) {
            Ok(event) => event,
            Err(err) => {
                metrics
                    .errors_total
                    .with_label_values(&["process", "unmarshal"])
                    .inc();
                warn!(
                    trip_id = %record.trip_id,
                    user_id = %record.user_id,
                    channel = %msg.channel,
                    error = %err,
                    "Dropping malformed event"
                );
                continue;
            }
        };

        if !record.admits(event.event_type) {
            continue;
        }
        // Unsubscribed while decoding; the stream must not see further events
        if cancel.is_cancelled() {
            break SubscriptionState::Cancelled;
        }

        let event_type = event.event_type;
        let event_id = event.id.clone();
        match delivery.try_send(event) {
            Ok(()) => {
                metrics
                    .events_total
                    .with_label_values(&["receive", event_type.as_str()])
                    .inc();
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics
                    .errors_total
                    .with_label_values(&["process", "channel_full"])
                    .inc();
                warn!(
                    trip_id = %record.trip_id,
                    user_id = %record.user_id,
                    event_id = %event_id,
                    event_type = %event_type,
                    "Delivery buffer full, dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(
                    trip_id = %record.trip_id,
                    user_id = %record.user_id,
                    "Consumer dropped its stream"
                );
                break SubscriptionState::Cancelled;
            }
        }
    };

    if exit == SubscriptionState::BrokerClosed {
        warn!(
            trip_id = %record.trip_id,
            user_id = %record.user_id,
            "Broker closed subscription"
        );
    }
    record.drain(exit, delivery, &metrics);
    debug!(trip_id = %record.trip_id, user_id = %record.user_id, "Subscription drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_bus::InMemoryBus;
    use serde_json::json;

    fn publisher_with(bus: &InMemoryBus, config: EventsConfig) -> (Publisher, Arc<EventMetrics>) {
        let metrics = Arc::new(EventMetrics::new());
        let publisher = Publisher::with_metrics(Arc::new(bus.clone()), config, metrics.clone());
        (publisher, metrics)
    }

    fn trip_event(kind: EventType) -> Event {
        Event::new(kind, "t1", "u1", "test").with_payload(json!({"k": 1}))
    }

    async fn next(stream: &mut EventStream) -> Option<Event> {
        tokio::time::timeout(Duration::from_secs(2), stream.recv())
            .await
            .expect("timed out waiting for stream")
    }

    #[tokio::test]
    async fn publish_stamps_before_the_wire() {
        let bus = InMemoryBus::new();
        let (publisher, metrics) = publisher_with(&bus, EventsConfig::default());
        let cancel = CancellationToken::new();

        let mut raw = bus.subscribe(&trip_channel("t1")).await.unwrap();
        publisher
            .publish(&cancel, "t1", trip_event(EventType::TripCreated))
            .await
            .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), raw.next())
            .await
            .unwrap()
            .unwrap();
        let wire = Event::decode(&msg.payload).unwrap();
        assert!(wire.is_stamped());
        assert_eq!(wire.metadata.source, "test");
        assert_eq!(metrics.event_count("publish", "trip.created"), 1);
    }

    #[tokio::test]
    async fn invalid_event_is_never_transmitted() {
        let bus = InMemoryBus::new();
        let (publisher, metrics) = publisher_with(&bus, EventsConfig::default());
        let cancel = CancellationToken::new();
        let mut raw = bus.subscribe(&trip_channel("t2")).await.unwrap();

        let err = publisher
            .publish(&cancel, "t2", trip_event(EventType::TripCreated))
            .await
            .unwrap_err();

        assert!(matches!(err, EventError::Validation(_)));
        assert_eq!(metrics.error_count("publish", "validation"), 1);
        assert_eq!(metrics.publish_duration_seconds.get_sample_count(), 1);
        let nothing = tokio::time::timeout(Duration::from_millis(50), raw.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn broker_outage_surfaces_as_transport_error() {
        let bus = InMemoryBus::new();
        let (publisher, metrics) = publisher_with(&bus, EventsConfig::default());
        bus.set_unavailable(true);

        let err = publisher
            .publish(&CancellationToken::new(), "t1", trip_event(EventType::TripCreated))
            .await
            .unwrap_err();

        assert!(matches!(err, EventError::Transport(_)));
        assert!(err.is_retryable());
        assert_eq!(metrics.error_count("publish", "transport"), 1);
    }

    #[tokio::test]
    async fn cancelled_token_rejects_every_operation() {
        let bus = InMemoryBus::new();
        let (publisher, metrics) = publisher_with(&bus, EventsConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = publisher
            .publish(&cancel, "t1", trip_event(EventType::TripCreated))
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::Cancelled));
        assert!(matches!(
            publisher.subscribe(&cancel, "t1", "u1", &[]).await,
            Err(EventError::Cancelled)
        ));
        assert_eq!(publisher.active_subscriptions(), 0);
        assert_eq!(metrics.error_count("publish", "cancelled"), 1);
        assert_eq!(metrics.error_count("subscribe", "cancelled"), 1);
    }

    #[tokio::test]
    async fn batch_validation_failure_sends_nothing() {
        let bus = InMemoryBus::new();
        let (publisher, metrics) = publisher_with(&bus, EventsConfig::default());
        let cancel = CancellationToken::new();
        let mut stream = publisher.subscribe(&cancel, "t1", "u1", &[]).await.unwrap();

        let err = publisher
            .publish_batch(
                &cancel,
                "t1",
                vec![
                    trip_event(EventType::TripCreated),
                    Event::new(EventType::TripUpdated, "t1", "", "test"),
                ],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EventError::Validation(_)));
        assert_eq!(metrics.error_count("publish_batch", "validation"), 1);
        let nothing = tokio::time::timeout(Duration::from_millis(50), stream.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn malformed_messages_are_skipped() {
        let bus = InMemoryBus::new();
        let (publisher, metrics) = publisher_with(&bus, EventsConfig::default());
        let cancel = CancellationToken::new();
        let mut stream = publisher.subscribe(&cancel, "t1", "u1", &[]).await.unwrap();

        let channel = trip_channel("t1");
        bus.publish(&channel, b"not json".to_vec()).await.unwrap();
        bus.publish(&channel, br#"{"type":"trip.exploded","trip_id":"t1"}"#.to_vec())
            .await
            .unwrap();
        publisher
            .publish(&cancel, "t1", trip_event(EventType::TripUpdated).with_id("good"))
            .await
            .unwrap();

        let event = next(&mut stream).await.unwrap();
        assert_eq!(event.id, "good");
        assert_eq!(metrics.error_count("process", "unmarshal"), 2);
    }

    #[tokio::test]
    async fn state_and_gauge_follow_the_lifecycle() {
        let bus = InMemoryBus::new();
        let (publisher, metrics) = publisher_with(&bus, EventsConfig::default());
        let cancel = CancellationToken::new();

        let mut stream = publisher.subscribe(&cancel, "t1", "u1", &[]).await.unwrap();
        assert_eq!(
            publisher.subscription_state("t1", "u1"),
            Some(SubscriptionState::Ready)
        );
        assert_eq!(metrics.active_subscribers.get(), 1);

        publisher.unsubscribe(&cancel, "t1", "u1").await.unwrap();
        assert_eq!(publisher.subscription_state("t1", "u1"), None);
        assert_eq!(metrics.active_subscribers.get(), 0);
        assert!(next(&mut stream).await.is_none());
        assert_eq!(bus.subscriber_count(&trip_channel("t1")), 0);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_is_not_found() {
        let bus = InMemoryBus::new();
        let (publisher, _) = publisher_with(&bus, EventsConfig::default());

        let err = publisher
            .unsubscribe(&CancellationToken::new(), "t9", "u9")
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::NotFound(_)));
    }

    #[tokio::test]
    async fn failed_broker_subscribe_frees_the_slot() {
        let bus = InMemoryBus::new();
        let (publisher, metrics) = publisher_with(&bus, EventsConfig::default());
        let cancel = CancellationToken::new();

        bus.set_unavailable(true);
        let err = publisher.subscribe(&cancel, "t1", "u1", &[]).await.unwrap_err();
        assert!(matches!(err, EventError::Transport(_)));
        assert_eq!(metrics.error_count("subscribe", "transport"), 1);
        assert_eq!(publisher.active_subscriptions(), 0);

        bus.set_unavailable(false);
        assert!(publisher.subscribe(&cancel, "t1", "u1", &[]).await.is_ok());
        assert_eq!(metrics.active_subscribers.get(), 1);
    }

    #[tokio::test]
    async fn consumer_drop_ends_dispatch() {
        let bus = InMemoryBus::new();
        let (publisher, metrics) = publisher_with(&bus, EventsConfig::default());
        let cancel = CancellationToken::new();

        let stream = publisher.subscribe(&cancel, "t1", "u1", &[]).await.unwrap();
        drop(stream);
        publisher
            .publish(&cancel, "t1", trip_event(EventType::TripCreated))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while publisher.subscription_state("t1", "u1") != Some(SubscriptionState::Drained) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("dispatch task did not drain");
        assert_eq!(metrics.active_subscribers.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_wait_gives_up_after_the_deadline() {
        let (_held, ready) = oneshot::channel::<()>();
        let outcome = await_ready(&CancellationToken::new(), Duration::from_secs(5), ready).await;
        assert_eq!(outcome, Readiness::TimedOut);
    }

    #[tokio::test]
    async fn readiness_wait_prefers_the_callers_token() {
        let cancel = CancellationToken::new();
        let (tx, ready) = oneshot::channel();
        tx.send(()).unwrap();
        cancel.cancel();

        assert_eq!(
            await_ready(&cancel, Duration::from_secs(5), ready).await,
            Readiness::Cancelled
        );
    }

    #[tokio::test]
    async fn readiness_signal_completes_the_wait() {
        let (tx, ready) = oneshot::channel();
        tx.send(()).unwrap();

        assert_eq!(
            await_ready(&CancellationToken::new(), Duration::from_secs(5), ready).await,
            Readiness::Ready
        );
    }

    #[tokio::test]
    async fn shutdown_sweeps_a_subscription_registered_mid_join() {
        let bus = InMemoryBus::new();
        let (publisher, metrics) = publisher_with(&bus, EventsConfig::default());
        let cancel = CancellationToken::new();
        let _first = publisher.subscribe(&cancel, "t1", "u1", &[]).await.unwrap();

        // The first poll of shutdown drains t1 and parks on the tracker; the
        // subscribe then registers t2 and spawns its dispatch task.
        let (shutdown, late) = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(
                publisher.shutdown(&cancel),
                publisher.subscribe(&cancel, "t2", "u1", &[])
            )
        })
        .await
        .expect("shutdown waited on a live dispatch task");

        shutdown.unwrap();
        let mut late = late.unwrap();
        assert!(next(&mut late).await.is_none());
        assert_eq!(publisher.active_subscriptions(), 0);
        assert_eq!(metrics.active_subscribers.get(), 0);
        assert_eq!(bus.subscriber_count(&trip_channel("t2")), 0);
    }
}
