//! Error handling for the Conveyor service
//!
//! Defines the application error type and the conversions that map it
//! onto HTTP responses with sanitised messages.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Conflict (e.g., deleting a job that is already running)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Payload too large
    #[error("Payload too large")]
    PayloadTooLarge,

    /// Bad request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Sanitize error messages to prevent information disclosure
        let (status, code, message) = match &self {
            AppError::Database(e) => {
                error!(error = %e, "Database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "An internal database error occurred".to_string(),
                )
            }
            AppError::NotFound(msg) => {
                // Don't reveal internal IDs in not found messages
                let safe_msg = if msg.contains("not found") {
                    "Resource not found".to_string()
                } else {
                    msg.clone()
                };
                (StatusCode::NOT_FOUND, "NOT_FOUND", safe_msg)
            }
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::PayloadTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "PAYLOAD_TOO_LARGE",
                "Request payload exceeds maximum allowed size".to_string(),
            ),
            AppError::BadRequest(msg) => {
                // Sanitize bad request messages that might contain SQL or system info
                let safe_msg =
                    if msg.contains("SQL") || msg.contains("query") || msg.contains("column") {
                        "Invalid request".to_string()
                    } else {
                        msg.clone()
                    };
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", safe_msg)
            }
            AppError::Internal(msg) => {
                error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            code: code.to_string(),
            message,
            details: None,
        });

        (status, body).into_response()
    }
}

/// Result type alias for AppError
pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}
