//! API Error Types
//!
//! Defines error types for the API layer and implements conversion
//! to HTTP responses with appropriate status codes.

use crate::concurrency::LimitError;
use crate::ingest::ImportError;
use crate::storage::StorageError;
use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// API error types
#[derive(Error, Debug)]
pub enum ApiError {
    /// Request validation failed
    #[error("Validation error: {0}")]
    Validation(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Selector or time parsing error
    #[error("Query error: {0}")]
    Query(#[from] crate::query::QueryError),

    /// Storage layer error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Import failed
    #[error("Import error: {0}")]
    Import(#[from] ImportError),

    /// A concurrency limiter rejected the request
    #[error("{message}")]
    TooManyRequests { message: String, retry_after_secs: u64 },

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LimitError> for ApiError {
    fn from(err: LimitError) -> Self {
        ApiError::TooManyRequests {
            retry_after_secs: err.waited.as_secs().max(1),
            message: err.to_string(),
        }
    }
}

/// Error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub error: ErrorBody,
    pub request_id: String,
}

/// Error details
#[derive(Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

fn storage_status(e: &StorageError) -> (StatusCode, &'static str) {
    match e {
        StorageError::TooManyMatches { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "TOO_MANY_MATCHES"),
        StorageError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        StorageError::TooManyRequests(_) => (StatusCode::TOO_MANY_REQUESTS, "TOO_MANY_REQUESTS"),
        StorageError::DeadlineExceeded(_) => (StatusCode::SERVICE_UNAVAILABLE, "DEADLINE_EXCEEDED"),
        StorageError::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "CANCELLED"),
        e if e.is_user_error() => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Query(_) => (StatusCode::BAD_REQUEST, "QUERY_ERROR"),
            ApiError::Storage(e) => storage_status(e),
            ApiError::Import(ImportError::Storage(e)) => storage_status(e),
            ApiError::Import(ImportError::Parse { .. } | ImportError::Csv(_) | ImportError::UnknownFormat(_)) => {
                (StatusCode::BAD_REQUEST, "IMPORT_ERROR")
            }
            ApiError::Import(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IMPORT_ERROR"),
            ApiError::TooManyRequests { .. } => (StatusCode::TOO_MANY_REQUESTS, "TOO_MANY_REQUESTS"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            ApiError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
        };

        let request_id = uuid::Uuid::new_v4().to_string();

        if status.is_server_error() {
            tracing::error!(
                request_id = %request_id,
                error_code = %code,
                error_message = %self,
                "API error occurred"
            );
        } else {
            tracing::debug!(
                request_id = %request_id,
                error_code = %code,
                error_message = %self,
                "Request rejected"
            );
        }

        let body = ErrorResponse {
            status: "error",
            error: ErrorBody {
                code: code.to_string(),
                message: self.to_string(),
            },
            request_id,
        };

        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = match &self {
                ApiError::TooManyRequests { retry_after_secs, .. } => *retry_after_secs,
                _ => 1,
            };
            if let Ok(v) = retry_after.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, v);
            }
        }
        response
    }
}

/// Result type for API operations
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_limit_error_is_429_with_retry_after() {
        let err: ApiError = LimitError {
            kind: "search",
            limit: 4,
            waited: Duration::from_secs(10),
        }
        .into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "10");
    }

    #[test]
    fn test_storage_error_codes() {
        let status = |e: StorageError| ApiError::from(e).into_response().status();
        assert_eq!(status(StorageError::TooManyMatches { limit: 1 }), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status(StorageError::InvalidFilter("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(StorageError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status(StorageError::Corruption("x".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
