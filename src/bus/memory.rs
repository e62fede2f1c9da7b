//! In-process event bus backed by tokio broadcast channels

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use super::{BusStream, MessageBus};
use crate::error::{BrokerError, Result};

/// Default per-channel buffer (bounded to prevent memory leaks)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Event bus living inside the broker process
///
/// Can be switched offline to simulate a dropped connection: open
/// subscriptions end and new operations fail until it comes back.
pub struct InMemoryBus {
    channels: DashMap<String, broadcast::Sender<String>>,
    capacity: usize,
    available: AtomicBool,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
            available: AtomicBool::new(true),
        }
    }

    /// Take the bus offline (ending every open subscription) or back online
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            self.channels.clear();
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of open subscriptions on a channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(BrokerError::BusUnavailable("in-memory bus is offline".into()))
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn subscribe(&self, channel: &str) -> Result<BusStream> {
        self.ensure_available()?;

        let rx = self.sender(channel).subscribe();
        let channel = channel.to_string();
        let stream = BroadcastStream::new(rx).filter_map(move |item| {
            let channel = channel.clone();
            async move {
                match item {
                    Ok(message) => Some(message),
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        warn!(channel = %channel, skipped = n, "Bus subscriber lagged, messages dropped");
                        None
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.ensure_available()?;

        // No receivers is fine: nobody is listening on this channel yet.
        let receivers = self.sender(channel).send(payload.to_string()).unwrap_or(0);
        debug!(channel, receivers, "Published to in-memory bus");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.set_available(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe("jobs").await.unwrap();
        assert_eq!(bus.subscriber_count("jobs"), 1);

        bus.publish("jobs", "hello").await.unwrap();
        bus.publish("other", "ignored").await.unwrap();

        let received = timeout(Duration::from_secs(1), stream.next()).await.unwrap();
        assert_eq!(received.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_offline_bus_ends_streams_and_rejects_calls() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe("jobs").await.unwrap();

        bus.set_available(false);
        let ended = timeout(Duration::from_secs(1), stream.next()).await.unwrap();
        assert!(ended.is_none());

        assert!(matches!(
            bus.publish("jobs", "x").await,
            Err(BrokerError::BusUnavailable(_))
        ));
        assert!(bus.subscribe("jobs").await.is_err());

        bus.set_available(true);
        assert!(bus.subscribe("jobs").await.is_ok());
    }

    #[tokio::test]
    async fn test_close_is_terminal_until_reenabled() {
        let bus = InMemoryBus::new();
        bus.close().await.unwrap();
        assert!(!bus.is_available());
        assert!(bus.publish("jobs", "x").await.is_err());
    }
}
