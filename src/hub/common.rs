//! Common types for status API responses and errors

use axum::{http::StatusCode, Json};
use serde::Serialize;

/// API error response
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub message: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        ApiError {
            message: message.into(),
        }
    }

    pub fn not_found(resource: &str) -> (StatusCode, Json<ApiError>) {
        (
            StatusCode::NOT_FOUND,
            Json(ApiError::new(format!("{} not found", resource))),
        )
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;
