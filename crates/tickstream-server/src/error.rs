//! Error types for the stream server.
//!
//! [`ApiError`] covers the HTTP endpoints and converts into a JSON
//! response via its [`IntoResponse`](axum::response::IntoResponse)
//! implementation. [`SendError`] is the per-session transport failure;
//! it closes that session and nothing else.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// A frame could not be handed to a session's connection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The outbound buffer is full; the client is not reading.
    #[error("outbound buffer full")]
    Full,

    /// The connection task is gone.
    #[error("connection closed")]
    Closed,
}

/// Errors returned by the HTTP endpoints.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// No route matched.
    #[error("not found: {0}")]
    NotFound(String),

    /// A serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::NotFound(path) => (StatusCode::NOT_FOUND, format!("no route for {path}")),
            Self::Serialization(e) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("JSON error: {e}"))
            }
        };

        let body = serde_json::json!({
            "error": message,
            "status": status.as_u16(),
        });

        (status, axum::Json(body)).into_response()
    }
}
