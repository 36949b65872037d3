//! Comprehensive error handling for Coursepay backend
//!
//! This module provides a unified error system with proper HTTP status mapping,
//! user-friendly messages, and structured error codes for client handling.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for programmatic handling by API clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "ORDER_NOT_FOUND")]
    OrderNotFound,
    #[serde(rename = "PLAN_NOT_FOUND")]
    PlanNotFound,
    #[serde(rename = "TRANCHE_NOT_FOUND")]
    TrancheNotFound,
    #[serde(rename = "REFUND_NOT_FOUND")]
    RefundNotFound,
    #[serde(rename = "INVALID_ORDER_STATE")]
    InvalidOrderState,
    #[serde(rename = "ORDER_CONFLICT")]
    OrderConflict,
    #[serde(rename = "REFUND_NOT_ALLOWED")]
    RefundNotAllowed,
    #[serde(rename = "REFUND_AMOUNT_EXCEEDED")]
    RefundAmountExceeded,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,

    // External errors (502, 503, 504)
    #[serde(rename = "GATEWAY_ERROR")]
    GatewayError,
    #[serde(rename = "NO_GATEWAY_AVAILABLE")]
    NoGatewayAvailable,
    #[serde(rename = "EXTERNAL_SERVICE_TIMEOUT")]
    ExternalServiceTimeout,

    // Generic
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Domain-specific business logic errors
#[derive(Debug, Clone)]
pub enum DomainError {
    /// Order with given ID doesn't exist
    OrderNotFound { order_id: String },
    /// Installment plan with given ID doesn't exist
    PlanNotFound { plan_id: String },
    /// Installment tranche with given ID doesn't exist
    TrancheNotFound { tranche_id: String },
    /// Refund request with given ID doesn't exist
    RefundNotFound { refund_id: String },
    /// Requested transition is not legal from the order's current status
    InvalidTransition {
        order_id: String,
        from: String,
        to: String,
    },
    /// Concurrent modification lost the conditional-update race. Carries the
    /// id of the contended order or tranche.
    Conflict { entity_id: String },
    /// Refund requested against an order that cannot accept one
    RefundNotAllowed { order_id: String, reason: String },
    /// Refund amount exceeds what remains refundable on the order
    RefundAmountExceeded {
        order_id: String,
        requested: i64,
        remaining: i64,
    },
}

/// Infrastructure-level errors (database, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    /// Database connection or query failure
    Database { message: String, is_retryable: bool },
    /// Missing or invalid configuration
    Configuration { message: String },
}

/// External service errors (payment gateways)
#[derive(Debug, Clone)]
pub enum ExternalError {
    /// Payment gateway (Razorpay, Cashfree) error
    Gateway {
        gateway: String,
        message: String,
        is_retryable: bool,
    },
    /// Every configured gateway was skipped or failed for an order
    NoGatewayAvailable { message: String },
    /// External service timeout
    Timeout { service: String, timeout_secs: u64 },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    /// Invalid amount (format or value)
    InvalidAmount { amount: String, reason: String },
    /// Unsupported or invalid currency
    InvalidCurrency { currency: String, reason: String },
    /// Required field missing
    MissingField { field: String },
    /// Field value failed a format or content check
    InvalidField { field: String, reason: String },
    /// Field value out of acceptable range
    OutOfRange {
        field: String,
        min: Option<String>,
        max: Option<String>,
    },
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::OrderNotFound { .. } => 404,
                DomainError::PlanNotFound { .. } => 404,
                DomainError::TrancheNotFound { .. } => 404,
                DomainError::RefundNotFound { .. } => 404,
                DomainError::InvalidTransition { .. } => 409, // Conflict
                DomainError::Conflict { .. } => 409,
                DomainError::RefundNotAllowed { .. } => 422, // Unprocessable Entity
                DomainError::RefundAmountExceeded { .. } => 422,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => 500,
                InfrastructureError::Configuration { .. } => 500,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::Gateway { .. } => 502, // Bad Gateway
                ExternalError::NoGatewayAvailable { .. } => 503, // Service Unavailable
                ExternalError::Timeout { .. } => 504, // Gateway Timeout
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidAmount { .. } => 400,
                ValidationError::InvalidCurrency { .. } => 400,
                ValidationError::MissingField { .. } => 400,
                ValidationError::InvalidField { .. } => 400,
                ValidationError::OutOfRange { .. } => 400,
            },
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::OrderNotFound { .. } => ErrorCode::OrderNotFound,
                DomainError::PlanNotFound { .. } => ErrorCode::PlanNotFound,
                DomainError::TrancheNotFound { .. } => ErrorCode::TrancheNotFound,
                DomainError::RefundNotFound { .. } => ErrorCode::RefundNotFound,
                DomainError::InvalidTransition { .. } => ErrorCode::InvalidOrderState,
                DomainError::Conflict { .. } => ErrorCode::OrderConflict,
                DomainError::RefundNotAllowed { .. } => ErrorCode::RefundNotAllowed,
                DomainError::RefundAmountExceeded { .. } => ErrorCode::RefundAmountExceeded,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::Gateway { .. } => ErrorCode::GatewayError,
                ExternalError::NoGatewayAvailable { .. } => ErrorCode::NoGatewayAvailable,
                ExternalError::Timeout { .. } => ErrorCode::ExternalServiceTimeout,
            },
            AppErrorKind::Validation(_) => ErrorCode::ValidationError,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::OrderNotFound { order_id } => {
                    format!("Payment order '{}' not found", order_id)
                }
                DomainError::PlanNotFound { plan_id } => {
                    format!("Installment plan '{}' not found", plan_id)
                }
                DomainError::TrancheNotFound { tranche_id } => {
                    format!("Installment tranche '{}' not found", tranche_id)
                }
                DomainError::RefundNotFound { refund_id } => {
                    format!("Refund request '{}' not found", refund_id)
                }
                DomainError::InvalidTransition { order_id, from, to } => {
                    format!(
                        "Order '{}' cannot move from '{}' to '{}'",
                        order_id, from, to
                    )
                }
                DomainError::Conflict { entity_id } => {
                    format!(
                        "'{}' was modified concurrently. Please retry",
                        entity_id
                    )
                }
                DomainError::RefundNotAllowed { order_id, reason } => {
                    format!("Refund not allowed for order '{}': {}", order_id, reason)
                }
                DomainError::RefundAmountExceeded {
                    order_id,
                    requested,
                    remaining,
                } => {
                    format!(
                        "Refund of {} exceeds the {} remaining on order '{}'",
                        requested, remaining, order_id
                    )
                }
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::Gateway {
                    gateway,
                    is_retryable,
                    ..
                } => {
                    if *is_retryable {
                        format!(
                            "Payment gateway ({}) is temporarily unavailable. Please try again",
                            gateway
                        )
                    } else {
                        "Payment processing failed. Please contact support".to_string()
                    }
                }
                ExternalError::NoGatewayAvailable { .. } => {
                    "No payment gateway is available right now. Please try again later".to_string()
                }
                ExternalError::Timeout {
                    service,
                    timeout_secs,
                } => {
                    format!(
                        "{} request timed out after {} seconds. Please try again",
                        service, timeout_secs
                    )
                }
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidAmount { amount, reason } => {
                    format!("Invalid amount '{}': {}", amount, reason)
                }
                ValidationError::InvalidCurrency { currency, reason } => {
                    format!("Invalid currency '{}': {}", currency, reason)
                }
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
                ValidationError::InvalidField { field, reason } => {
                    format!("Invalid value for field '{}': {}", field, reason)
                }
                ValidationError::OutOfRange { field, min, max } => match (min, max) {
                    (Some(min), Some(max)) => {
                        format!("Field '{}' must be between {} and {}", field, min, max)
                    }
                    (Some(min), None) => {
                        format!("Field '{}' must be at least {}", field, min)
                    }
                    (None, Some(max)) => {
                        format!("Field '{}' must be at most {}", field, max)
                    }
                    (None, None) => {
                        format!("Field '{}' is out of acceptable range", field)
                    }
                },
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(err) => matches!(err, DomainError::Conflict { .. }),
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Configuration { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::Gateway { is_retryable, .. } => *is_retryable,
                ExternalError::NoGatewayAvailable { .. } => true,
                ExternalError::Timeout { .. } => true,
            },
            AppErrorKind::Validation(_) => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

// Conversions from specific error types
// Note: From<DatabaseError> is implemented in database/error.rs and
// From<GatewayError> in gateways/error.rs to avoid circular dependencies.

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_not_found_error() {
        let error = AppError::new(AppErrorKind::Domain(DomainError::OrderNotFound {
            order_id: "ord_missing".to_string(),
        }));

        assert_eq!(error.status_code(), 404);
        assert_eq!(error.error_code(), ErrorCode::OrderNotFound);
        assert!(error.user_message().contains("ord_missing"));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_conflict_error_is_retryable() {
        let error = AppError::new(AppErrorKind::Domain(DomainError::Conflict {
            entity_id: "ord_1".to_string(),
        }));

        assert_eq!(error.status_code(), 409);
        assert_eq!(error.error_code(), ErrorCode::OrderConflict);
        assert!(error.is_retryable());
    }

    #[test]
    fn test_refund_amount_exceeded_error() {
        let error = AppError::new(AppErrorKind::Domain(DomainError::RefundAmountExceeded {
            order_id: "ord_2".to_string(),
            requested: 60_000,
            remaining: 40_000,
        }));

        assert_eq!(error.status_code(), 422);
        assert_eq!(error.error_code(), ErrorCode::RefundAmountExceeded);
        assert!(error.user_message().contains("60000"));
    }

    #[test]
    fn test_gateway_error_retryability() {
        let retryable = AppError::new(AppErrorKind::External(ExternalError::Gateway {
            gateway: "razorpay".to_string(),
            message: "503 from upstream".to_string(),
            is_retryable: true,
        }));
        assert_eq!(retryable.status_code(), 502);
        assert!(retryable.is_retryable());

        let rejected = AppError::new(AppErrorKind::External(ExternalError::Gateway {
            gateway: "cashfree".to_string(),
            message: "card declined".to_string(),
            is_retryable: false,
        }));
        assert!(!rejected.is_retryable());
    }

    #[test]
    fn test_no_gateway_available_error() {
        let error = AppError::new(AppErrorKind::External(ExternalError::NoGatewayAvailable {
            message: "all candidates skipped".to_string(),
        }));

        assert_eq!(error.status_code(), 503);
        assert_eq!(error.error_code(), ErrorCode::NoGatewayAvailable);
        assert!(error.is_retryable());
    }

    #[test]
    fn test_validation_error() {
        let error = AppError::new(AppErrorKind::Validation(ValidationError::InvalidAmount {
            amount: "-100".to_string(),
            reason: "Amount cannot be negative".to_string(),
        }));

        assert_eq!(error.status_code(), 400);
        assert_eq!(error.error_code(), ErrorCode::ValidationError);
        assert!(!error.is_retryable());
    }
}
