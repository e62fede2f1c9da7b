//! Session transport backed by a WebSocket outbound queue

use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use tokio::sync::{mpsc, watch};

use crate::error::SessionDeliveryError;
use crate::registry::SessionTransport;

/// How long the writer waits to hand the close frame to a slow socket
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// Outbound half of one WebSocket
///
/// `send` waits for room in the queue, so a client that stops reading runs
/// into the registry's send timeout and is dropped. Closing goes through a
/// separate signal so it reaches the writer even when the queue is full.
pub struct WsTransport {
    tx: mpsc::Sender<Message>,
    closed: watch::Sender<bool>,
}

impl WsTransport {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        let (closed, _) = watch::channel(false);
        Self { tx, closed }
    }

    /// Signal that flips to true once the broker closes this session
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

#[async_trait]
impl SessionTransport for WsTransport {
    async fn send(&self, payload: &str) -> Result<(), SessionDeliveryError> {
        if *self.closed.borrow() {
            return Err(SessionDeliveryError::Closed);
        }
        self.tx
            .send(Message::Text(payload.to_string()))
            .await
            .map_err(|_| SessionDeliveryError::Closed)
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }
}

/// Resolves once the close signal is raised; never if the transport is
/// dropped without closing
async fn wait_for_close(closed: &mut watch::Receiver<bool>) {
    if closed.wait_for(|closed| *closed).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Drain the outbound queue onto the socket until the queue ends, the socket
/// fails or the session is closed
///
/// On close the queued messages are abandoned and a close frame is sent.
pub async fn write_outbound<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Message>,
    mut closed: watch::Receiver<bool>,
) where
    S: Sink<Message> + Unpin,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = wait_for_close(&mut closed) => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => return,
            },
        };

        tokio::select! {
            biased;
            _ = wait_for_close(&mut closed) => break,
            sent = sink.send(message) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }

    let _ = tokio::time::timeout(CLOSE_FRAME_TIMEOUT, sink.send(Message::Close(None))).await;
}
