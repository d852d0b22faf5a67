//! Redis Pub/Sub implementation of the EventBus trait

use crate::subscription::{BusSubscription, CloseHandle};
use crate::{validate_channel, BusError, BusMessage, BusResult, EventBus};
use async_trait::async_trait;
use futures::stream::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};

/// EventBus implementation using Redis Pub/Sub
///
/// This is the production implementation. Publishing goes through one
/// shared multiplexed connection, which is safe to use from many tasks.
/// Every subscription opens its own dedicated pub/sub connection, as Redis
/// requires.
///
/// # Example
/// ```rust,no_run
/// use event_bus::{EventBus, RedisBus};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = RedisBus::connect("redis://localhost:6379").await?;
///
/// bus.publish("trip:t1", b"hello".to_vec()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisBus {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisBus {
    /// Connect to a Redis server by URL (`redis://` or `rediss://`)
    pub async fn connect(url: &str) -> BusResult<Self> {
        let client = Client::open(url).map_err(|e| BusError::ConnectionError(e.to_string()))?;
        Self::from_client(client).await
    }

    /// Create a RedisBus from an existing client
    ///
    /// Opens the shared publishing connection eagerly so configuration
    /// errors surface here rather than on the first publish.
    pub async fn from_client(client: Client) -> BusResult<Self> {
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;

        Ok(Self { client, conn })
    }

    /// Get a reference to the underlying Redis client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Round-trip a PING to check the server is reachable
    pub async fn ping(&self) -> BusResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> BusResult<()> {
        validate_channel(channel)?;

        let mut conn = self.conn.clone();
        let _receivers: i64 = conn
            .publish(channel, payload)
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn publish_batch(&self, channel: &str, payloads: Vec<Vec<u8>>) -> BusResult<()> {
        validate_channel(channel)?;
        if payloads.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for payload in payloads {
            pipe.publish(channel, payload).ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> BusResult<BusSubscription> {
        validate_channel(channel)?;

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        // The pub/sub connection lives inside the stream; it is released
        // when the stream ends on close and its owner drops it.
        let handle = CloseHandle::new(|| {});
        let signal = handle.signal();
        let mut messages = Box::pin(pubsub.into_on_message());

        let stream = async_stream::stream! {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = signal.cancelled() => None,
                    msg = messages.next() => msg,
                };
                match next {
                    Some(msg) => {
                        yield BusMessage::new(
                            msg.get_channel_name().to_string(),
                            msg.get_payload_bytes().to_vec(),
                        );
                    }
                    None => break,
                }
            }
        };

        Ok(BusSubscription::new(channel.to_string(), stream.boxed(), handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    // Note: These tests require a running Redis server
    // For CI, use InMemoryBus tests instead
    // For manual testing: docker run -p 6379:6379 redis:7-alpine

    #[tokio::test]
    #[ignore] // Requires Redis server
    async fn test_redis_bus_publish_subscribe() {
        let bus = RedisBus::connect("redis://localhost:6379")
            .await
            .expect("Redis server must be running on localhost:6379");
        bus.ping().await.unwrap();

        let mut sub = bus.subscribe("trip:redis-test").await.unwrap();

        let payload = b"test message".to_vec();
        bus.publish("trip:redis-test", payload.clone()).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended");

        assert_eq!(msg.channel, "trip:redis-test");
        assert_eq!(msg.payload, payload);
    }

    #[tokio::test]
    #[ignore] // Requires Redis server
    async fn test_redis_bus_pipeline_order_and_close() {
        let bus = RedisBus::connect("redis://localhost:6379")
            .await
            .expect("Redis server must be running on localhost:6379");

        let mut sub = bus.subscribe("trip:redis-batch").await.unwrap();
        bus.publish_batch(
            "trip:redis-batch",
            vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()],
        )
        .await
        .unwrap();

        for expected in [b"1", b"2", b"3"] {
            let msg = tokio::time::timeout(Duration::from_secs(2), sub.next())
                .await
                .expect("timeout waiting for message")
                .expect("stream ended");
            assert_eq!(msg.payload, expected.to_vec());
        }

        assert!(sub.close());
        let next = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("timeout waiting for stream end");
        assert!(next.is_none());
    }
}
