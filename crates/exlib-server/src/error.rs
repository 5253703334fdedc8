//! HTTP-facing error type

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::ingest::{DispatchError, JobStoreError, LibraryError};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Job store error: {0}")]
    JobStore(#[from] JobStoreError),

    #[error("Library error: {0}")]
    Library(#[from] LibraryError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::JobStore(ref e) => {
                tracing::error!("Job store error: {:?}", e);
                (StatusCode::SERVICE_UNAVAILABLE, "Job store unavailable".to_string())
            },
            AppError::Library(LibraryError::NotFound(ref id)) => {
                (StatusCode::NOT_FOUND, format!("Exercise '{}' not found", id))
            },
            AppError::Library(ref e) => {
                tracing::error!("Library error: {:?}", e);
                (StatusCode::SERVICE_UNAVAILABLE, "Exercise library unavailable".to_string())
            },
            AppError::Dispatch(DispatchError::UnknownKind(kind)) => {
                (StatusCode::NOT_FOUND, format!("No runner for job kind '{}'", kind))
            },
            AppError::Dispatch(DispatchError::ShuttingDown) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Server is shutting down, retry later".to_string(),
            ),
            AppError::Dispatch(ref e) => {
                tracing::error!("Dispatch error: {:?}", e);
                (StatusCode::SERVICE_UNAVAILABLE, "Job dispatch unavailable".to_string())
            },
            AppError::NotFound(ref message) => (StatusCode::NOT_FOUND, message.clone()),
            AppError::BadRequest(ref message) => (StatusCode::BAD_REQUEST, message.clone()),
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}
