//! Redis pub/sub event bus

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use super::{BusStream, MessageBus};
use crate::error::{BrokerError, Result};

/// Event bus backed by Redis pub/sub
///
/// Publishing goes through a shared `ConnectionManager`. Every subscription
/// opens its own dedicated connection, since a Redis connection in
/// subscribe mode cannot issue other commands.
pub struct RedisBus {
    client: redis::Client,
    publisher: Mutex<Option<ConnectionManager>>,
}

impl RedisBus {
    /// Connect to Redis
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        info!("Connected event bus to Redis");
        Ok(Self::from_parts(client, publisher))
    }

    /// Build a bus from an existing client and connection manager
    ///
    /// Useful when sharing one connection manager with the heartbeat store.
    pub fn from_parts(client: redis::Client, publisher: ConnectionManager) -> Self {
        Self {
            client,
            publisher: Mutex::new(Some(publisher)),
        }
    }

    fn publisher(&self) -> Result<ConnectionManager> {
        self.publisher
            .lock()
            .clone()
            .ok_or_else(|| BrokerError::BusUnavailable("bus connection closed".into()))
    }
}

fn bus_unavailable(err: redis::RedisError) -> BrokerError {
    BrokerError::BusUnavailable(err.to_string())
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn subscribe(&self, channel: &str) -> Result<BusStream> {
        // Refuse to reopen once closed
        self.publisher()?;

        let connection = self
            .client
            .get_async_connection()
            .await
            .map_err(bus_unavailable)?;
        let mut pubsub = connection.into_pubsub();
        pubsub.subscribe(channel).await.map_err(bus_unavailable)?;
        debug!(channel, "Subscribed to Redis channel");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!(
                        channel = %msg.get_channel_name(),
                        error = %e,
                        "Dropping undecodable bus message"
                    );
                    None
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.publisher()?;
        let receivers: i64 = conn
            .publish(channel, payload)
            .await
            .map_err(bus_unavailable)?;
        debug!(channel, receivers, "Published to Redis channel");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.publisher.lock().take().is_some() {
            info!("Closed Redis event bus connection");
        }
        Ok(())
    }
}
