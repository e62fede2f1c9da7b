use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Unified error type for the broker
#[derive(Error, Debug)]
pub enum BrokerError {
    // Session errors
    #[error("Session already registered: {id}")]
    DuplicateSession { id: String },

    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    #[error("Invalid client message: {0}")]
    InvalidMessage(String),

    // Lifecycle errors
    #[error("Broker is already running")]
    AlreadyRunning,

    #[error("Broker is shutting down")]
    ShuttingDown,

    // Infrastructure errors
    #[error("Event bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("Heartbeat store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

impl BrokerError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            BrokerError::InvalidMessage(_) | BrokerError::InvalidConfig(_) => {
                StatusCode::BAD_REQUEST
            }

            // 404 Not Found
            BrokerError::SessionNotFound { .. } => StatusCode::NOT_FOUND,

            // 409 Conflict
            BrokerError::DuplicateSession { .. } | BrokerError::AlreadyRunning => {
                StatusCode::CONFLICT
            }

            // 503 Service Unavailable
            BrokerError::ShuttingDown
            | BrokerError::BusUnavailable(_)
            | BrokerError::StoreUnavailable(_)
            | BrokerError::Redis(_) => StatusCode::SERVICE_UNAVAILABLE,

            // 500 Internal Server Error
            BrokerError::Serialization(_) | BrokerError::Io(_) | BrokerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this error comes from the bus or heartbeat store.
    ///
    /// These are absorbed and retried by the background tasks instead of
    /// being surfaced to clients.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            BrokerError::BusUnavailable(_)
                | BrokerError::StoreUnavailable(_)
                | BrokerError::Redis(_)
        )
    }
}

// Implement IntoResponse for API error responses
impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

/// Failure to push a payload to a single session
///
/// Captured per session in a `DeliveryReport`; never aborts delivery to
/// other sessions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionDeliveryError {
    #[error("transport closed")]
    Closed,

    #[error("write failed: {0}")]
    Write(String),

    #[error("send timed out")]
    Timeout,
}
