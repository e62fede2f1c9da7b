//! API route definitions

use axum::routing::get;
use axum::Router;

use super::handlers;
use super::server::AppState;
use super::websocket;

/// Create the API router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::health::root))
        .route("/health", get(handlers::health::health_check))
        // WebSocket endpoints
        .route("/ws", get(websocket::jobs::jobs_ws))
        .route("/ws/jobs/:job_id", get(websocket::jobs::job_ws))
        .with_state(state)
}
