use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Gateway-wide error types with appropriate HTTP status codes.
///
/// # Classification
///
/// Errors fall into two groups that callers must be able to tell apart:
///
/// - **Client errors** (`InvalidPayload`, `BadRequest`, `NotFound`) are caused by
///   the request itself and are never retried.
/// - **Server errors** (`BrokerUnreachable`, `AppendFailed`, `AppendTimeout`,
///   `ReadError`, ...) originate in the broker or the gateway.
///
/// A `ReadError` only ever terminates the stream that hit it; it is surfaced as
/// an HTTP response only if it happens before the stream body starts.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Broker unreachable: {0}")]
    BrokerUnreachable(String),

    #[error("Failed to append record: {0}")]
    AppendFailed(String),

    #[error("Append timed out: {0}")]
    AppendTimeout(String),

    #[error("Failed to read from cursor: {0}")]
    ReadError(String),

    #[error("Invalid message payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl AppError {
    /// Stable machine-readable name of the error, used in response bodies and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::BrokerUnreachable(_) => "broker_unreachable",
            AppError::AppendFailed(_) => "append_failed",
            AppError::AppendTimeout(_) => "append_timeout",
            AppError::ReadError(_) => "read_error",
            AppError::InvalidPayload(_) => "invalid_payload",
            AppError::NotFound(_) => "not_found",
            AppError::BadRequest(_) => "bad_request",
            AppError::Internal(_) => "internal_error",
            AppError::ConfigError(_) => "config_error",
        }
    }

    /// Whether the error was caused by the client's input.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AppError::InvalidPayload(_) | AppError::NotFound(_) | AppError::BadRequest(_)
        )
    }
}

/// Error response body for API endpoints.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Full details stay in the server log; clients get a sanitized message
        if self.is_client_error() {
            tracing::debug!(error = %self, "Request rejected");
        } else {
            tracing::error!(error = %self, "Request failed");
        }

        let (status, message) = match &self {
            // Broker availability - don't leak connection details
            AppError::BrokerUnreachable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Message broker is temporarily unavailable. Please try again later.".to_string(),
            ),
            AppError::AppendFailed(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to publish message. Please try again.".to_string(),
            ),
            AppError::AppendTimeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                "Message broker did not acknowledge the message in time. Please try again."
                    .to_string(),
            ),
            AppError::ReadError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read messages. Please try again.".to_string(),
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "An internal error occurred. Please contact support if the issue persists."
                    .to_string(),
            ),
            AppError::ConfigError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Service configuration error. Please contact support.".to_string(),
            ),

            // Client errors - safe to show
            AppError::InvalidPayload(e) => (StatusCode::BAD_REQUEST, sanitize_serde_error(e)),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        };

        let body = ErrorResponse {
            error: self.kind().to_string(),
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Sanitize serde error messages to avoid leaking internal type information.
fn sanitize_serde_error(e: &serde_json::Error) -> String {
    let msg = e.to_string();

    if msg.contains("invalid type") {
        return "Invalid data type in message payload".to_string();
    }

    if msg.contains("EOF while parsing") || msg.contains("expected") {
        return "Malformed JSON in message payload".to_string();
    }

    "Invalid message payload".to_string()
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;
