use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThrottlerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cache adapter connection error: {0}")]
    AdapterConnection(String),

    #[error("Cache adapter operation error: {0}")]
    AdapterOperation(String),

    #[error("Cache operation timed out after {0:?}")]
    StoreTimeout(Duration),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ThrottlerError>;

impl From<redis::RedisError> for ThrottlerError {
    fn from(err: redis::RedisError) -> Self {
        ThrottlerError::AdapterOperation(err.to_string())
    }
}

impl From<validator::ValidationErrors> for ThrottlerError {
    fn from(err: validator::ValidationErrors) -> Self {
        ThrottlerError::Configuration(err.to_string())
    }
}

impl ThrottlerError {
    /// True for failures of the backing store, as opposed to bad input or config.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            ThrottlerError::AdapterConnection(_)
                | ThrottlerError::AdapterOperation(_)
                | ThrottlerError::StoreTimeout(_)
        )
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    /// Infrastructure failures are reported without their internal detail.
    pub fn from_error(err: &ThrottlerError) -> Self {
        match err {
            ThrottlerError::Validation(msg) => Self::new("validation_error", msg, 422),
            ThrottlerError::Unauthorized(_) => {
                Self::new("unauthorized", "Missing or invalid admin token", 401)
            }
            ThrottlerError::AdapterConnection(_)
            | ThrottlerError::AdapterOperation(_)
            | ThrottlerError::StoreTimeout(_) => {
                Self::new("service_unavailable", "State store unavailable", 503)
            }
            ThrottlerError::Configuration(_) => {
                Self::new("configuration_error", "Service misconfigured", 500)
            }
            ThrottlerError::Serialization(_)
            | ThrottlerError::Internal(_)
            | ThrottlerError::Io(_) => Self::new("internal_error", "Internal server error", 500),
        }
    }
}

impl IntoResponse for ThrottlerError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "Request failed");
        let body = ErrorResponse::from_error(&self);
        let status =
            StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_failures_map_to_503_without_detail() {
        let err = ThrottlerError::AdapterOperation("connection reset by 10.0.0.7".into());
        let body = ErrorResponse::from_error(&err);
        assert_eq!(body.code, 503);
        assert!(!body.message.contains("10.0.0.7"));
        assert!(err.is_store_failure());
    }

    #[test]
    fn test_validation_error_keeps_message() {
        let err = ThrottlerError::Validation("ip is required".into());
        let body = ErrorResponse::from_error(&err);
        assert_eq!(body.code, 422);
        assert_eq!(body.message, "ip is required");
        assert!(!err.is_store_failure());
    }

    #[test]
    fn test_unauthorized_hides_detail() {
        let err = ThrottlerError::Unauthorized("bad token".into());
        let body = ErrorResponse::from_error(&err);
        assert_eq!(body.code, 401);
        assert!(!body.message.contains("bad token"));
    }

    #[test]
    fn test_timeout_is_store_failure() {
        let err = ThrottlerError::StoreTimeout(Duration::from_millis(50));
        assert!(err.is_store_failure());
        assert_eq!(ErrorResponse::from_error(&err).code, 503);
    }
}
