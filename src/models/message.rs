use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};

/// Event type published when the reaper expires a job
pub const STALE_JOB_EVENT: &str = "job_stale";

/// Reason attached to stale job events
pub const HEARTBEAT_TIMEOUT_REASON: &str = "heartbeat_timeout";

/// Message carried on the event bus
///
/// `topic` is usually a job id; workers that still send `job_id` are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
    #[serde(alias = "job_id")]
    pub topic: String,
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl BusEnvelope {
    pub fn new(
        topic: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            topic: topic.into(),
            event_type: event_type.into(),
            payload,
        }
    }

    /// Parse a raw bus message
    pub fn parse(raw: &str) -> Result<Self> {
        let envelope: BusEnvelope = serde_json::from_str(raw)
            .map_err(|e| BrokerError::InvalidMessage(format!("malformed envelope: {}", e)))?;

        if envelope.topic.trim().is_empty() {
            return Err(BrokerError::InvalidMessage(
                "envelope topic must not be empty".into(),
            ));
        }

        Ok(envelope)
    }

    /// Text pushed to subscribed sessions
    pub fn payload_text(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.payload)?)
    }
}

/// Payload of a stale job notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaleJobEvent {
    pub job_id: String,
    pub reason: String,
    /// Heartbeat age in whole seconds when the job was expired
    pub age: i64,
    pub detected_at: DateTime<Utc>,
}

impl StaleJobEvent {
    pub fn heartbeat_timeout(
        job_id: impl Into<String>,
        age: chrono::Duration,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            reason: HEARTBEAT_TIMEOUT_REASON.to_string(),
            age: age.num_seconds(),
            detected_at,
        }
    }

    pub fn into_envelope(self) -> Result<BusEnvelope> {
        let topic = self.job_id.clone();
        let payload = serde_json::to_value(self)?;
        Ok(BusEnvelope::new(topic, STALE_JOB_EVENT, payload))
    }
}

/// Requests a WebSocket client may send
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        #[serde(alias = "job_id")]
        topic: String,
    },
    Unsubscribe {
        #[serde(alias = "job_id")]
        topic: String,
    },
    Ping,
}

impl ClientMessage {
    pub fn parse(raw: &str) -> Result<Self> {
        let message: ClientMessage = serde_json::from_str(raw)
            .map_err(|e| BrokerError::InvalidMessage(e.to_string()))?;

        match &message {
            ClientMessage::Subscribe { topic } | ClientMessage::Unsubscribe { topic }
                if topic.trim().is_empty() =>
            {
                Err(BrokerError::InvalidMessage("topic must not be empty".into()))
            }
            _ => Ok(message),
        }
    }
}

/// Replies sent back to a WebSocket client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed { topic: String },
    Unsubscribed { topic: String },
    Pong,
    Error { message: String },
}
