//! Change Bus (C1): the cross-process pub/sub channel that carries [`ChangeEvent`]s
//! between API nodes. Ships an in-process implementation (what every test in this
//! crate runs against) and an optional Redis-backed one behind the `redis-bus`
//! feature, matching the reference deployment's broker choice.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::CoreError;
use crate::model::ChangeEvent;

/// Cross-process pub/sub contract. `subscribe` produces events from the moment of
/// the call, no replay; dropping the returned stream (or cancelling the task
/// driving it) is how a consumer stops listening.
#[async_trait]
pub trait ChangeBus: Send + Sync {
    async fn publish(&self, event: ChangeEvent) -> Result<(), CoreError>;

    async fn subscribe(&self) -> Result<BoxStream<'static, ChangeEvent>, CoreError>;

    async fn close(&self);
}

/// `tokio::sync::broadcast`-backed bus for a single process. Lagging subscribers
/// silently skip missed events rather than erroring the whole stream. A slow
/// subscriber is recovered by the next client poll's fast-path compare, same as a
/// dropped cross-process message.
pub struct InMemoryChangeBus {
    tx: broadcast::Sender<ChangeEvent>,
}

impl InMemoryChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for InMemoryChangeBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl ChangeBus for InMemoryChangeBus {
    async fn publish(&self, event: ChangeEvent) -> Result<(), CoreError> {
        // No receivers yet is not an error: a bus with nobody subscribed has
        // nothing to notify, same as an event matching no subscribers.
        let _ = self.tx.send(event);
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, ChangeEvent>, CoreError> {
        let rx = self.tx.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(|item| async move { item.ok() });
        Ok(stream.boxed())
    }

    async fn close(&self) {}
}

#[cfg(feature = "redis-bus")]
pub mod redis_bus {
    use super::*;
    use redis::AsyncCommands;

    const DEFAULT_TOPIC: &str = "config:change";

    /// Publishes/subscribes JSON-encoded [`ChangeEvent`]s over a single Redis
    /// pub/sub channel, matching the wire envelope.
    pub struct RedisChangeBus {
        client: redis::Client,
        topic: String,
    }

    impl RedisChangeBus {
        pub fn new(client: redis::Client) -> Self {
            Self {
                client,
                topic: DEFAULT_TOPIC.to_string(),
            }
        }

        pub fn with_topic(client: redis::Client, topic: impl Into<String>) -> Self {
            Self { client, topic: topic.into() }
        }
    }

    #[async_trait]
    impl ChangeBus for RedisChangeBus {
        async fn publish(&self, event: ChangeEvent) -> Result<(), CoreError> {
            let payload = serde_json::to_string(&event)
                .map_err(|e| CoreError::Internal(Box::new(e)))?;
            let mut conn = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| CoreError::BusUnavailable(e.to_string()))?;
            conn.publish::<_, _, ()>(&self.topic, payload)
                .await
                .map_err(|e| CoreError::BusUnavailable(e.to_string()))?;
            Ok(())
        }

        async fn subscribe(&self) -> Result<BoxStream<'static, ChangeEvent>, CoreError> {
            let mut pubsub = self
                .client
                .get_async_pubsub()
                .await
                .map_err(|e| CoreError::BusUnavailable(e.to_string()))?;
            pubsub
                .subscribe(&self.topic)
                .await
                .map_err(|e| CoreError::BusUnavailable(e.to_string()))?;

            let stream = pubsub.into_on_message().filter_map(|msg| async move {
                let payload: String = msg.get_payload().ok()?;
                serde_json::from_str::<ChangeEvent>(&payload).ok()
            });
            Ok(stream.boxed())
        }

        async fn close(&self) {}
    }
}

#[cfg(feature = "redis-bus")]
pub use redis_bus::RedisChangeBus;
