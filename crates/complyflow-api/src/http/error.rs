//! Application error type mapping to HTTP status codes and envelope format.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use complyflow_core::workflow::coordinator::CoordinatorError;

use crate::http::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    Coordinator(CoordinatorError),
    Validation(String),
    NotFound(String),
}

impl From<CoordinatorError> for AppError {
    fn from(e: CoordinatorError) -> Self {
        AppError::Coordinator(e)
    }
}

impl AppError {
    /// Status, machine-readable code and message for this error.
    pub fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Coordinator(CoordinatorError::WorkflowNotFound(t)) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                format!("Unknown workflow type '{t}'"),
            ),
            AppError::Coordinator(CoordinatorError::Validation(msg)) | AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
            AppError::Coordinator(CoordinatorError::ExecutionNotFound(id)) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Execution {id} not found"),
            ),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Coordinator(CoordinatorError::Repository(e)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "BACKEND_UNAVAILABLE",
                e.to_string(),
            ),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            tracing::error!(code, error = %message, "request failed");
        }

        let body = ApiResponse::<()>::error(code, message);
        (status, Json(body)).into_response()
    }
}
