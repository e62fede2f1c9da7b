//! Liveness endpoints

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::api::server::AppState;
use crate::broker::LifecycleState;

/// Root endpoint
pub async fn root() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "message": "WebSocket Queue API is running"
    }))
}

/// Health check endpoint
///
/// Healthy only while the broker runs and both background tasks are alive.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let broker_state = state.broker.state();
    let tasks_alive = state.broker.background_tasks_alive();
    let healthy = broker_state == LifecycleState::Running && tasks_alive;

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if healthy { "healthy" } else { "unhealthy" },
            "service": "jobrelay",
            "broker": broker_state,
            "sessions": state.broker.registry().len(),
            "topics": state.broker.registry().topic_count(),
            "uptime_seconds": state.started_at.elapsed().as_secs(),
        })),
    )
}
