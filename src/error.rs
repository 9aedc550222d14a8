use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::time::Duration;
use thiserror::Error;

/// Failures raised while talking to the inference backend.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// The HTTP request to the backend could not be completed.
    #[error("backend transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The backend answered with a non-success status code.
    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },
    /// The backend reported an error inside its response body.
    #[error("backend error: {0}")]
    Backend(String),
    /// A response line could not be decoded.
    #[error("malformed backend output: {0}")]
    Malformed(String),
    /// The generation did not finish within the configured limit.
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
    /// The generation task was cancelled before it produced a result.
    #[error("generation aborted")]
    Aborted,
    /// The generation task panicked.
    #[error("generation task panicked")]
    Panicked,
}

/// Returned by a frame sink whose client has gone away.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("client disconnected")]
pub struct ClientDisconnected;

/// Errors surfaced by the HTTP endpoints.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Inference(_) => StatusCode::BAD_GATEWAY,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}
