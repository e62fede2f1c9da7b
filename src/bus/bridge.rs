//! Event bus bridge
//!
//! Holds the broker's single bus subscription and hands every envelope to the
//! session registry. Messages are dispatched one at a time so per-topic order
//! on the bus is the order clients see.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::{Backoff, BusStream, MessageBus};
use crate::error::Result;
use crate::models::BusEnvelope;
use crate::registry::{DeliveryReport, SessionRegistry};

#[derive(Debug, PartialEq, Eq)]
enum PumpExit {
    Shutdown,
    Disconnected,
}

/// Long-lived subscriber relaying bus messages to sessions
pub struct EventBusBridge {
    bus: Arc<dyn MessageBus>,
    registry: Arc<SessionRegistry>,
    channel: String,
    backoff: Backoff,
}

impl EventBusBridge {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        registry: Arc<SessionRegistry>,
        channel: impl Into<String>,
        backoff: Backoff,
    ) -> Self {
        Self {
            bus,
            registry,
            channel: channel.into(),
            backoff,
        }
    }

    /// Run the bridge until the shutdown channel changes
    ///
    /// `initial` is a subscription already opened by the caller; without one
    /// the bridge subscribes itself. Lost subscriptions are reopened with
    /// exponential backoff for as long as the bridge runs.
    #[instrument(skip(self, initial, shutdown), fields(channel = %self.channel))]
    pub async fn run(
        self,
        initial: Option<BusStream>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!("Starting event bus bridge");

        let mut pending = initial;
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let stream = match pending.take() {
                Some(stream) => Some(stream),
                None => tokio::select! {
                    result = self.bus.subscribe(&self.channel) => match result {
                        Ok(stream) => {
                            info!(attempt, "Resubscribed to event bus");
                            Some(stream)
                        }
                        Err(e) => {
                            warn!(attempt, error = %e, "Event bus subscription failed");
                            None
                        }
                    },
                    _ = shutdown.changed() => break,
                },
            };

            if let Some(mut stream) = stream {
                attempt = 0;
                if self.pump(&mut stream, &mut shutdown).await == PumpExit::Shutdown {
                    break;
                }
                warn!("Event bus subscription dropped");
            }

            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!(delay_ms = delay.as_millis() as u64, "Waiting before resubscribing");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("Event bus bridge shutting down");
        Ok(())
    }

    async fn pump(&self, stream: &mut BusStream, shutdown: &mut watch::Receiver<bool>) -> PumpExit {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => return PumpExit::Shutdown,
                next = stream.next() => match next {
                    Some(raw) => {
                        self.dispatch(&raw).await;
                    }
                    None => return PumpExit::Disconnected,
                },
            }
        }
    }

    /// Parse one raw bus message and deliver its payload
    ///
    /// Malformed messages are logged and dropped.
    pub async fn dispatch(&self, raw: &str) -> Option<DeliveryReport> {
        let envelope = match BusEnvelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Dropping malformed bus message");
                return None;
            }
        };

        let payload = match envelope.payload_text() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic = %envelope.topic, error = %e, "Dropping unserializable payload");
                return None;
            }
        };

        let report = self.registry.deliver(&envelope.topic, &payload).await;
        debug!(
            topic = %envelope.topic,
            event_type = %envelope.event_type,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Dispatched bus message"
        );
        Some(report)
    }
}
