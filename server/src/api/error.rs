use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::groups::GroupError;

/// Wire shape of an API error: a stable machine-readable `code` plus a
/// human-readable message.
#[derive(Serialize)]
pub struct ApiErrorBody {
    pub code: &'static str,
    pub message: String,
}

/// Error type returned by HTTP handlers.
///
/// Each variant owns one status code and one `code` string; handlers bubble
/// failures up with `?` and the [`IntoResponse`] conversion shapes the JSON
/// response.
pub enum AppError {
    /// The requested resource does not exist (404).
    NotFound,
    /// The request was understood but rejected (400).
    Validation(String),
    /// Something failed on our side (500).
    Internal(String),
}

impl AppError {
    fn parts(self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::NotFound => (
                StatusCode::NOT_FOUND,
                "not_found",
                "Resource not found".to_string(),
            ),
            AppError::Validation(message) => (StatusCode::BAD_REQUEST, "validation_error", message),
            AppError::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        (status, Json(ApiErrorBody { code, message })).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl From<GroupError> for AppError {
    fn from(e: GroupError) -> Self {
        match e {
            // Integrity violations are the caller's fault and must reject
            // the write visibly.
            GroupError::Cycle => AppError::Validation(e.to_string()),
            GroupError::Storage(e) => AppError::Internal(e.to_string()),
        }
    }
}
