//! Error response formatting
//!
//! Converts [`AppError`] values into the standardized JSON error body every
//! endpoint returns, with consistent status codes, machine-readable error
//! codes, and a request id for support.

use crate::error::{AppError, ErrorCode};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Standardized error response structure
///
/// This is returned to clients for all error cases, ensuring
/// consistent error handling across the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code
    pub error: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Request ID for debugging and support
    pub request_id: Option<String>,

    /// ISO 8601 timestamp of the error
    pub timestamp: String,

    /// Whether the client should retry the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl ErrorResponse {
    /// Create a new error response from an AppError
    pub fn from_app_error(error: &AppError) -> Self {
        Self {
            error: error.error_code(),
            message: error.user_message(),
            request_id: error.request_id.clone(),
            timestamp: Utc::now().to_rfc3339(),
            retryable: Some(error.is_retryable()),
        }
    }
}

/// Implement IntoResponse for AppError so handlers can return it directly
/// and get the standardized body, status mapping, and logging.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status_code =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status_code.is_server_error() {
            tracing::error!(
                error = ?self,
                request_id = ?self.request_id,
                status = %status_code.as_u16(),
                "Server error occurred"
            );
        } else {
            tracing::warn!(
                error = ?self,
                request_id = ?self.request_id,
                status = %status_code.as_u16(),
                "Client error occurred"
            );
        }

        let error_response = ErrorResponse::from_app_error(&self);
        (status_code, Json(error_response)).into_response()
    }
}

/// Helper to extract request ID from request headers
pub fn get_request_id_from_headers(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, AppErrorKind, DomainError, ValidationError};
    use axum::{http::StatusCode, response::IntoResponse};

    #[test]
    fn test_error_response_from_app_error() {
        let app_error = AppError::new(AppErrorKind::Domain(DomainError::RefundAmountExceeded {
            order_id: "ord-1".to_string(),
            requested: 600_000,
            remaining: 500_000,
        }))
        .with_request_id("req_123");

        let error_response = ErrorResponse::from_app_error(&app_error);

        assert_eq!(error_response.error, ErrorCode::RefundAmountExceeded);
        assert_eq!(error_response.request_id, Some("req_123".to_string()));
        assert!(error_response.message.contains("600000"));
    }

    #[test]
    fn test_app_error_into_response() {
        let app_error = AppError::new(AppErrorKind::Validation(ValidationError::InvalidAmount {
            amount: "-100".to_string(),
            reason: "Amount cannot be negative".to_string(),
        }));

        let response = app_error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_status_code_mapping() {
        let not_found = AppError::new(AppErrorKind::Domain(DomainError::OrderNotFound {
            order_id: "ord-404".to_string(),
        }));
        assert_eq!(not_found.status_code(), 404);

        let conflict = AppError::new(AppErrorKind::Domain(DomainError::Conflict {
            entity_id: "ord-1".to_string(),
        }));
        assert_eq!(conflict.status_code(), 409);

        let invalid_field = AppError::new(AppErrorKind::Validation(
            ValidationError::InvalidField {
                field: "currency".to_string(),
                reason: "must be a 3-letter code".to_string(),
            },
        ));
        assert_eq!(invalid_field.status_code(), 400);
    }

    #[test]
    fn test_request_id_extraction() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("x-request-id", "req_789".parse().unwrap());
        assert_eq!(
            get_request_id_from_headers(&headers),
            Some("req_789".to_string())
        );
        assert_eq!(get_request_id_from_headers(&axum::http::HeaderMap::new()), None);
    }
}
