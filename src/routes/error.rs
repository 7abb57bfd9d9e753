use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::db::store::StoreError;
use crate::services::queue::QueueError;
use crate::services::upload::UploadError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue unavailable: {0}")]
    Queue(#[from] QueueError),

    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Upload(UploadError::Io(_)) | ApiError::Store(_) | ApiError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Upload(_) => StatusCode::BAD_REQUEST,
            ApiError::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let detail = if status.is_server_error() {
            error!(error = %self, "Request failed");
            match status {
                StatusCode::SERVICE_UNAVAILABLE => "Job queue unavailable, try again later".to_string(),
                _ => "An internal error occurred".to_string(),
            }
        } else {
            self.to_string()
        };

        (status, Json(ErrorResponse { detail })).into_response()
    }
}
