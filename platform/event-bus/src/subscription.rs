//! Broker subscription handles shared by every transport

use crate::BusMessage;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;

type CloseFn = Box<dyn FnOnce() + Send>;

struct CloseInner {
    closed: AtomicBool,
    signal: CancellationToken,
    on_close: Mutex<Option<CloseFn>>,
}

/// Cloneable handle that closes a broker subscription exactly once
///
/// Any clone may call [`close`](CloseHandle::close); only the first call
/// releases the transport resources, later calls are no-ops.
#[derive(Clone)]
pub struct CloseHandle {
    inner: Arc<CloseInner>,
}

impl CloseHandle {
    /// Create a handle that runs `on_close` on the first close
    pub fn new(on_close: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(CloseInner {
                closed: AtomicBool::new(false),
                signal: CancellationToken::new(),
                on_close: Mutex::new(Some(Box::new(on_close))),
            }),
        }
    }

    /// Close the subscription
    ///
    /// Returns `true` if this call performed the close.
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.inner.signal.cancel();

        let on_close = self
            .inner
            .on_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(release) = on_close {
            release();
        }

        true
    }

    /// Whether the subscription has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Token cancelled when the handle closes; message streams end on it
    pub(crate) fn signal(&self) -> CancellationToken {
        self.inner.signal.clone()
    }
}

impl std::fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A live subscription to one broker channel
///
/// Implements [`Stream`] over the received [`BusMessage`]s. The stream ends
/// after [`close`](BusSubscription::close) or when the broker drops the
/// subscription.
pub struct BusSubscription {
    channel: String,
    messages: BoxStream<'static, BusMessage>,
    handle: CloseHandle,
}

impl BusSubscription {
    pub(crate) fn new(
        channel: String,
        messages: BoxStream<'static, BusMessage>,
        handle: CloseHandle,
    ) -> Self {
        Self {
            channel,
            messages,
            handle,
        }
    }

    /// Channel this subscription listens on
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// A handle that can close this subscription from another task
    pub fn close_handle(&self) -> CloseHandle {
        self.handle.clone()
    }

    /// Close the subscription; idempotent
    pub fn close(&self) -> bool {
        self.handle.close()
    }

    /// Split into the message stream and its close handle
    pub fn into_parts(self) -> (BoxStream<'static, BusMessage>, CloseHandle) {
        (self.messages, self.handle)
    }
}

impl Stream for BusSubscription {
    type Item = BusMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.messages.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for BusSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusSubscription")
            .field("channel", &self.channel)
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn close_runs_release_exactly_once() {
        let releases = Arc::new(AtomicUsize::new(0));
        let counter = releases.clone();
        let handle = CloseHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let other = handle.clone();

        assert!(handle.close());
        assert!(!other.close());
        assert!(!handle.close());

        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert!(other.is_closed());
        assert!(handle.signal().is_cancelled());
    }

    #[tokio::test]
    async fn stream_delegates_to_inner_messages() {
        let messages = futures::stream::iter(vec![
            BusMessage::new("trip:a".to_string(), b"1".to_vec()),
            BusMessage::new("trip:a".to_string(), b"2".to_vec()),
        ])
        .boxed();
        let mut sub = BusSubscription::new("trip:a".to_string(), messages, CloseHandle::new(|| {}));

        assert_eq!(sub.channel(), "trip:a");
        assert_eq!(sub.next().await.map(|m| m.payload), Some(b"1".to_vec()));
        assert_eq!(sub.next().await.map(|m| m.payload), Some(b"2".to_vec()));
        assert!(sub.next().await.is_none());
    }
}
