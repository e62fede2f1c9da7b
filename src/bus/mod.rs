//! Event bus
//!
//! The bus is the shared publish/subscribe channel between workers and the
//! broker. Redis pub/sub backs it in production; the in-memory bus serves
//! single-process deployments and tests.

pub mod backoff;
pub mod bridge;
pub mod memory;
pub mod redis_bus;

pub use backoff::Backoff;
pub use bridge::EventBusBridge;
pub use memory::InMemoryBus;
pub use redis_bus::RedisBus;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

/// Raw messages received from one bus subscription
///
/// The stream ending means the underlying connection dropped.
pub type BusStream = BoxStream<'static, String>;

/// Publish/subscribe transport shared with workers
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Open a new subscription to `channel`
    async fn subscribe(&self, channel: &str) -> Result<BusStream>;

    /// Publish a raw message to `channel`
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Release the bus connection. Later calls fail with `BusUnavailable`.
    async fn close(&self) -> Result<()>;
}
