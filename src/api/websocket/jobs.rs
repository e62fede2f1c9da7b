//! Job update WebSocket handlers
//!
//! `/ws` accepts subscribe/unsubscribe/ping messages; `/ws/jobs/:job_id` does
//! the same but starts out subscribed to one job.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::transport::write_outbound;
use super::{WsTransport, WS_BUFFER_SIZE};
use crate::api::server::AppState;
use crate::models::ServerMessage;

/// WebSocket handler for job updates
pub async fn jobs_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_jobs_ws(socket, state, None))
}

/// WebSocket handler pre-subscribed to a single job
pub async fn job_ws(
    ws: WebSocketUpgrade,
    Path(job_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_jobs_ws(socket, state, Some(job_id)))
}

fn encode(reply: &ServerMessage) -> Option<Message> {
    match serde_json::to_string(reply) {
        Ok(json) => Some(Message::Text(json)),
        Err(e) => {
            error!("Failed to serialize WebSocket reply: {}", e);
            None
        }
    }
}

async fn reply(tx: &mpsc::Sender<Message>, reply: &ServerMessage) -> bool {
    match encode(reply) {
        Some(message) => tx.send(message).await.is_ok(),
        None => true,
    }
}

/// Handle WebSocket connection for job updates
async fn handle_jobs_ws(socket: WebSocket, state: AppState, initial_topic: Option<String>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Message>(WS_BUFFER_SIZE);
    let transport = WsTransport::new(tx.clone());
    let closed = transport.closed_signal();

    let handle = match state.broker.connect(Box::new(transport)) {
        Ok(handle) => handle,
        Err(e) => {
            warn!("Rejecting WebSocket connection: {}", e);
            let refusal = ServerMessage::Error {
                message: e.to_string(),
            };
            if let Some(message) = encode(&refusal) {
                let _ = sender.send(message).await;
            }
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    let session_id = handle.id().clone();

    info!(session_id = %session_id, "Jobs WebSocket connected");

    if let Some(topic) = initial_topic {
        let outcome = match state.broker.registry().subscribe(&session_id, &topic) {
            Ok(_) => ServerMessage::Subscribed { topic },
            Err(e) => ServerMessage::Error {
                message: e.to_string(),
            },
        };
        reply(&tx, &outcome).await;
    }

    let mut send_task = tokio::spawn(write_outbound(sender, rx, closed));

    // Route client messages through the broker
    let broker = state.broker.clone();
    let inbound_id = session_id.clone();
    let mut receive_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let response = match broker.handle_inbound(&inbound_id, &text) {
                        Ok(response) => response,
                        Err(e) => {
                            debug!(session_id = %inbound_id, "Rejected client message: {}", e);
                            ServerMessage::Error {
                                message: e.to_string(),
                            }
                        }
                    };
                    if !reply(&tx, &response).await {
                        break;
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!(session_id = %inbound_id, "Jobs WebSocket received close");
                    break;
                }
                Ok(_) => {
                    // Pings are answered by axum; binary frames are ignored
                }
                Err(e) => {
                    debug!(session_id = %inbound_id, "Jobs WebSocket error: {}", e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            debug!("Send task ended");
        }
        _ = &mut receive_task => {
            debug!("Receive task ended");
        }
    }
    send_task.abort();
    receive_task.abort();

    state.broker.disconnect(&session_id).await;
    info!(session_id = %session_id, "Jobs WebSocket disconnected");
}
