use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use xpchat_shared::{ProtocolError, UserId};
use xpchat_store::StoreError;

/// Errors surfaced by the REST API.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upload too large: {size} bytes (max {max})")]
    UploadTooLarge { size: usize, max: usize },

    #[error("Upload storage error: {0}")]
    UploadStorage(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::NotFound(_) | ServerError::Store(StoreError::NotFound) => {
                (StatusCode::NOT_FOUND, self.to_string())
            }
            ServerError::UploadTooLarge { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, self.to_string())
            }
            ServerError::UploadStorage(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Upload storage error".to_string())
            }
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Store(StoreError::Conflict(_)) => {
                (StatusCode::CONFLICT, self.to_string())
            }
            ServerError::Store(e) => {
                tracing::error!(error = %e, "Storage failure in request");
                (StatusCode::INTERNAL_SERVER_ERROR, "Storage error".to_string())
            }
            ServerError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Why an inbound WebSocket frame was not acted on.
///
/// None of these close the connection; the socket loop logs them and reads
/// the next frame.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(#[from] ProtocolError),

    #[error("Unknown target: {0}")]
    UnknownTarget(UserId),

    #[error("Dropping {kind} from unauthenticated connection")]
    NotAuthenticated { kind: &'static str },

    #[error("Auth rejected: {0}")]
    AuthRejected(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
