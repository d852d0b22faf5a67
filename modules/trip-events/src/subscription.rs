//! Subscription records and the consumer-facing event stream

use crate::envelope::{Event, EventType};
use crate::metrics::EventMetrics;
use event_bus::CloseHandle;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

/// Position of a subscription in its lifecycle
///
/// `Pending -> Ready -> (Cancelled | BrokerClosed) -> Drained`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Registered, dispatch task not yet running
    Pending,
    /// Dispatch task is forwarding events
    Ready,
    /// Unsubscribed or shut down
    Cancelled,
    /// The broker ended the subscription
    BrokerClosed,
    /// Resources released; terminal
    Drained,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct SubscriptionKey {
    pub trip_id: String,
    pub user_id: String,
}

impl SubscriptionKey {
    pub fn new(trip_id: &str, user_id: &str) -> Self {
        Self {
            trip_id: trip_id.to_string(),
            user_id: user_id.to_string(),
        }
    }
}

/// State shared between the publisher's registry and one dispatch task
pub(crate) struct SubscriptionRecord {
    pub trip_id: String,
    pub user_id: String,
    filters: Vec<EventType>,
    cancel: CancellationToken,
    state: Mutex<SubscriptionState>,
    broker: Mutex<Option<CloseHandle>>,
    drained: AtomicBool,
}

impl SubscriptionRecord {
    pub fn new(trip_id: &str, user_id: &str, filters: &[EventType]) -> Self {
        Self {
            trip_id: trip_id.to_string(),
            user_id: user_id.to_string(),
            filters: filters.to_vec(),
            cancel: CancellationToken::new(),
            state: Mutex::new(SubscriptionState::Pending),
            broker: Mutex::new(None),
            drained: AtomicBool::new(false),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SubscriptionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SubscriptionState {
        *self.lock_state()
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// An empty filter list admits every type; otherwise any match admits
    pub fn admits(&self, event_type: EventType) -> bool {
        self.filters.is_empty() || self.filters.contains(&event_type)
    }

    pub fn attach_broker(&self, handle: CloseHandle) {
        *self.broker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        // Cancelled while the broker subscription was being opened
        if self.cancel.is_cancelled() {
            self.close_broker();
        }
    }

    fn close_broker(&self) {
        let handle = self
            .broker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handle) = handle {
            handle.close();
        }
    }

    /// Pending -> Ready; returns false if the record already left Pending
    pub fn mark_ready(&self, metrics: &EventMetrics) -> bool {
        let mut state = self.lock_state();
        if *state != SubscriptionState::Pending {
            return false;
        }
        *state = SubscriptionState::Ready;
        metrics.active_subscribers.inc();
        true
    }

    /// Move a live record to a terminal cause, releasing its gauge slot
    fn leave_live_state(&self, next: SubscriptionState, metrics: &EventMetrics) {
        let mut state = self.lock_state();
        match *state {
            SubscriptionState::Ready => {
                metrics.active_subscribers.dec();
                *state = next;
            }
            SubscriptionState::Pending => *state = next,
            _ => {}
        }
    }

    /// Cancel from outside the dispatch task (unsubscribe, shutdown)
    pub fn cancel(&self, metrics: &EventMetrics) {
        self.leave_live_state(SubscriptionState::Cancelled, metrics);
        self.cancel.cancel();
        self.close_broker();
    }

    /// Release everything exactly once; called by the dispatch task on exit
    ///
    /// Consumes the delivery sender, which closes the consumer's stream.
    /// Returns false if the record was already drained.
    pub fn drain(
        &self,
        exit: SubscriptionState,
        delivery: mpsc::Sender<Event>,
        metrics: &EventMetrics,
    ) -> bool {
        if self.drained.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.close_broker();
        self.leave_live_state(exit, metrics);
        *self.lock_state() = SubscriptionState::Drained;
        drop(delivery);
        true
    }
}

/// Read end of one subscription
///
/// Yields events in broker-receive order and ends once the subscription is
/// unsubscribed, shut down, or closed by the broker.
#[derive(Debug)]
pub struct EventStream {
    trip_id: String,
    user_id: String,
    rx: mpsc::Receiver<Event>,
}

impl EventStream {
    pub(crate) fn new(trip_id: &str, user_id: &str, rx: mpsc::Receiver<Event>) -> Self {
        Self {
            trip_id: trip_id.to_string(),
            user_id: user_id.to_string(),
            rx,
        }
    }

    pub fn trip_id(&self) -> &str {
        &self.trip_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Next event, or `None` once the subscription has ended
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Next buffered event without waiting
    ///
    /// `Empty` means nothing is buffered yet; `Disconnected` means the
    /// subscription has ended and the buffer is exhausted.
    pub fn try_recv(&mut self) -> Result<Event, TryRecvError> {
        self.rx.try_recv()
    }

    /// Number of events waiting in the delivery buffer
    pub fn buffered(&self) -> usize {
        self.rx.len()
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn event() -> Event {
        Event::new(EventType::TripCreated, "t1", "u1", "test").stamped()
    }

    #[test]
    fn filters_are_disjunctive() {
        let open = SubscriptionRecord::new("t1", "u1", &[]);
        assert!(open.admits(EventType::WeatherUpdated));

        let filtered =
            SubscriptionRecord::new("t1", "u1", &[EventType::TripCreated, EventType::TripUpdated]);
        assert!(filtered.admits(EventType::TripCreated));
        assert!(filtered.admits(EventType::TripUpdated));
        assert!(!filtered.admits(EventType::TripDeleted));
    }

    #[tokio::test]
    async fn drain_runs_once_and_closes_the_stream() {
        let metrics = EventMetrics::new();
        let record = SubscriptionRecord::new("t1", "u1", &[]);
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        let (tx, rx) = mpsc::channel(4);
        let mut stream = EventStream::new("t1", "u1", rx);

        record.attach_broker(CloseHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(record.mark_ready(&metrics));
        assert_eq!(metrics.active_subscribers.get(), 1);

        tx.try_send(event()).unwrap();
        let spare = tx.clone();
        assert!(record.drain(SubscriptionState::Cancelled, tx, &metrics));
        assert!(!record.drain(SubscriptionState::Cancelled, spare, &metrics));

        assert_eq!(record.state(), SubscriptionState::Drained);
        assert_eq!(metrics.active_subscribers.get(), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        assert!(stream.recv().await.is_some());
        assert!(stream.recv().await.is_none());
    }

    #[test]
    fn cancel_before_ready_never_touches_the_gauge() {
        let metrics = EventMetrics::new();
        let record = SubscriptionRecord::new("t1", "u1", &[]);

        record.cancel(&metrics);
        assert_eq!(record.state(), SubscriptionState::Cancelled);
        assert!(!record.mark_ready(&metrics));
        assert_eq!(metrics.active_subscribers.get(), 0);
        assert!(record.token().is_cancelled());
    }

    #[test]
    fn cancel_after_ready_releases_the_gauge_once() {
        let metrics = EventMetrics::new();
        let record = SubscriptionRecord::new("t1", "u1", &[]);
        let (tx, _rx) = mpsc::channel(1);

        record.mark_ready(&metrics);
        record.cancel(&metrics);
        assert_eq!(metrics.active_subscribers.get(), 0);

        record.drain(SubscriptionState::Cancelled, tx, &metrics);
        assert_eq!(metrics.active_subscribers.get(), 0);
        assert_eq!(record.state(), SubscriptionState::Drained);
    }

    #[test]
    fn try_recv_tells_empty_from_ended() {
        let (tx, rx) = mpsc::channel(2);
        let mut stream = EventStream::new("t1", "u1", rx);

        assert_eq!(stream.try_recv().unwrap_err(), TryRecvError::Empty);
        tx.try_send(event()).unwrap();
        drop(tx);

        assert_eq!(stream.try_recv().unwrap().trip_id, "t1");
        assert_eq!(stream.try_recv().unwrap_err(), TryRecvError::Disconnected);
    }
}
