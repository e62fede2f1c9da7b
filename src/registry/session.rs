//! Client sessions and the transport seam they own

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::error::SessionDeliveryError;

/// Unique identifier of a client session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random session id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Outbound half of a client connection
///
/// Implemented by the WebSocket layer. A transport is owned by exactly one
/// session and is never shared with other components.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Push one payload to the client
    async fn send(&self, payload: &str) -> std::result::Result<(), SessionDeliveryError>;

    /// Close the underlying connection
    async fn close(&self);
}

/// An open client connection
pub struct Session {
    id: SessionId,
    transport: Box<dyn SessionTransport>,
    state: Mutex<SessionState>,
    connected_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId, transport: Box<dyn SessionTransport>) -> Self {
        Self {
            id,
            transport,
            state: Mutex::new(SessionState::Connecting),
            connected_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub(crate) fn mark_open(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Connecting {
            *state = SessionState::Open;
        }
    }

    /// Returns false if the session was already closing or closed
    pub(crate) fn begin_close(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            SessionState::Connecting | SessionState::Open => {
                *state = SessionState::Closing;
                true
            }
            SessionState::Closing | SessionState::Closed => false,
        }
    }

    pub(crate) async fn finish_close(&self) {
        self.transport.close().await;
        *self.state.lock() = SessionState::Closed;
    }

    pub(crate) async fn send(
        &self,
        payload: &str,
        limit: Duration,
    ) -> std::result::Result<(), SessionDeliveryError> {
        match tokio::time::timeout(limit, self.transport.send(payload)).await {
            Ok(result) => result,
            Err(_) => Err(SessionDeliveryError::Timeout),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

/// Read-only view of a registered session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session: Arc<Session>,
}

impl SessionHandle {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn id(&self) -> &SessionId {
        self.session.id()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.session.connected_at()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::testing::recording_transport;

    #[test]
    fn test_session_id_generation_is_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert_eq!(SessionId::from("abc").as_str(), "abc");
        assert_eq!(SessionId::from("abc".to_string()).to_string(), "abc");
    }

    #[tokio::test]
    async fn test_session_state_transitions() {
        let (transport, recorder) = recording_transport();
        let session = Session::new(SessionId::from("s1"), transport);
        assert_eq!(session.state(), SessionState::Connecting);

        session.mark_open();
        assert!(session.is_open());

        assert!(session.begin_close());
        assert!(!session.begin_close());
        assert_eq!(session.state(), SessionState::Closing);

        session.finish_close().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(recorder.is_closed());
    }

    #[tokio::test]
    async fn test_session_send_times_out() {
        let (transport, recorder) = recording_transport();
        recorder.set_hanging(true);
        let session = Session::new(SessionId::from("s1"), transport);
        session.mark_open();

        let result = session.send("hello", Duration::from_millis(20)).await;
        assert_eq!(result, Err(SessionDeliveryError::Timeout));
    }
}
