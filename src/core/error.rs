//! Error types and handling for the bridge server.
//!
//! This module provides a unified error type [`AppError`] that wraps various error sources
//! and converts into a Claude-shaped error document.

use crate::api::claude_models::ClaudeErrorResponse;
use crate::core::error_types::error_type_for_status;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// Main error type for the application.
///
/// All errors in the application should be converted to this type for consistent handling.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration-related errors (file not found, parse errors, etc.)
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// HTTP request errors from the reqwest client
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Client provided invalid data
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The upstream answered with a non-success status
    #[error("Upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    /// Request timeout errors
    #[error("Gateway timeout")]
    Timeout,

    /// Client disconnected before request completed
    /// This is a normal scenario (user cancelled request, timeout, etc.)
    #[error("Client closed request")]
    ClientDisconnect,

    /// Generic internal server errors with custom message
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status returned to the client.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Config(_) | AppError::Serialization(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Request(e) => {
                if e.is_timeout() {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    e.status()
                        .and_then(|s| StatusCode::from_u16(s.as_u16()).ok())
                        .unwrap_or(StatusCode::BAD_GATEWAY)
                }
            }
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            AppError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            // HTTP 408 rather than nginx's non-standard 499
            AppError::ClientDisconnect => StatusCode::REQUEST_TIMEOUT,
        }
    }

    /// Message shown to the client.
    pub fn client_message(&self) -> String {
        match self {
            AppError::Request(e) if e.is_timeout() => "Gateway timeout".to_string(),
            AppError::BadRequest(msg) | AppError::Internal(msg) => msg.clone(),
            AppError::Upstream { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if matches!(self, AppError::ClientDisconnect) {
            tracing::info!("Client disconnected before request completed");
        }

        let body = ClaudeErrorResponse::new(
            error_type_for_status(status.as_u16()),
            self.client_message(),
        );
        (status, Json(body)).into_response()
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;
