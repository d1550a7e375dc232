//! Centralized error handling module
//!
//! Provides the application error type and its HTTP response mapping.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use crate::models::UnknownMetric;
use crate::store::StoreError;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::StorageError(err.to_string())
    }
}

impl From<UnknownMetric> for AppError {
    fn from(err: UnknownMetric) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

/// Standardized error response format
#[derive(Serialize)]
pub struct ErrorResponse {
    /// Unique correlation ID for tracing
    pub correlation_id: String,
    /// Error type classification
    pub error_type: String,
    /// Human-readable error message (safe for clients)
    pub message: String,
    /// HTTP status code
    pub status_code: u16,
    /// Timestamp of the error
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(error_type: &str, message: &str, status_code: StatusCode) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            error_type: error_type.to_string(),
            message: message.to_string(),
            status_code: status_code.as_u16(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let (error_type, message) = match self {
            AppError::ValidationError(msg) => ("VALIDATION_ERROR", msg.as_str()),
            AppError::StorageError(msg) => {
                error!(error = %msg, "Storage error occurred");
                ("STORAGE_ERROR", "Dashboard state could not be persisted")
            }
            AppError::NotFound(msg) => ("NOT_FOUND", msg.as_str()),
            AppError::BadRequest(msg) => ("BAD_REQUEST", msg.as_str()),
        };

        let error_response = ErrorResponse::new(error_type, message, status);

        error!(
            correlation_id = %error_response.correlation_id,
            error_type = %error_type,
            status_code = %status.as_u16(),
            "Error response generated"
        );

        HttpResponse::build(status).json(error_response)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::StorageError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_status() {
        let error = AppError::ValidationError("Invalid temperature".to_string());
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_store_error_is_internal() {
        let error: AppError = StoreError::Poisoned.into();
        assert_eq!(error.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_unknown_metric_is_bad_request() {
        let error: AppError = UnknownMetric("pressure".to_string()).into();
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_error_response_format() {
        let response = ErrorResponse::new("TEST_ERROR", "Test message", StatusCode::BAD_REQUEST);
        assert!(!response.correlation_id.is_empty());
        assert_eq!(response.error_type, "TEST_ERROR");
        assert_eq!(response.message, "Test message");
        assert_eq!(response.status_code, 400);
    }
}
