//! Webhook errors

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Error type for webhook operations
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The admission review request was invalid or malformed
    #[error("invalid admission review: {0}")]
    InvalidReview(String),

    /// The gateway admin API failed or was unreachable
    #[error("gateway admin API error: {0}")]
    Gateway(String),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The server could not be configured or started
    #[error("server error: {0}")]
    Server(String),
}

impl From<reqwest::Error> for WebhookError {
    fn from(e: reqwest::Error) -> Self {
        WebhookError::Gateway(e.to_string())
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::InvalidReview(_) => StatusCode::BAD_REQUEST,
            WebhookError::Gateway(_) => StatusCode::BAD_GATEWAY,
            WebhookError::Serialization(_) | WebhookError::Server(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}
