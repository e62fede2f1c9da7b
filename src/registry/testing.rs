//! In-memory transport used by unit tests across the crate

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::SessionTransport;
use crate::error::SessionDeliveryError;

#[derive(Default)]
struct RecorderState {
    sent: Mutex<Vec<String>>,
    failing: AtomicBool,
    hanging: AtomicBool,
    closed: AtomicBool,
}

/// Records every payload and can be told to fail or hang
struct RecordingTransport {
    state: Arc<RecorderState>,
}

#[async_trait]
impl SessionTransport for RecordingTransport {
    async fn send(&self, payload: &str) -> Result<(), SessionDeliveryError> {
        if self.state.hanging.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(SessionDeliveryError::Closed);
        }
        if self.state.failing.load(Ordering::SeqCst) {
            return Err(SessionDeliveryError::Write("injected failure".into()));
        }
        self.state.sent.lock().push(payload.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

/// Test-side view of a transport that has been moved into a session
#[derive(Clone)]
pub(crate) struct TransportRecorder {
    state: Arc<RecorderState>,
}

impl TransportRecorder {
    pub(crate) fn sent(&self) -> Vec<String> {
        self.state.sent.lock().clone()
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn set_hanging(&self, hanging: bool) {
        self.state.hanging.store(hanging, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

pub(crate) fn recording_transport() -> (Box<dyn SessionTransport>, TransportRecorder) {
    let state = Arc::new(RecorderState::default());
    (
        Box::new(RecordingTransport {
            state: state.clone(),
        }),
        TransportRecorder { state },
    )
}
