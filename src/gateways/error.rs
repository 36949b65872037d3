use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Closed error taxonomy for gateway adapters.
///
/// Every fallible adapter call resolves to exactly one of these three
/// variants. The orchestrator's failover decision hangs on the variant:
/// `Unavailable` candidates are skipped, `Transient` moves on to the next
/// candidate, `Rejected` stops the attempt outright.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Gateway unavailable: gateway={gateway}, reason={reason}")]
    Unavailable { gateway: String, reason: String },

    #[error("Gateway transient failure: gateway={gateway}, message={message}")]
    Transient { gateway: String, message: String },

    #[error("Gateway rejected request: gateway={gateway}, message={message}")]
    Rejected {
        gateway: String,
        gateway_code: Option<String>,
        message: String,
    },
}

impl GatewayError {
    pub fn unavailable(gateway: impl Into<String>, reason: impl Into<String>) -> Self {
        GatewayError::Unavailable {
            gateway: gateway.into(),
            reason: reason.into(),
        }
    }

    pub fn transient(gateway: impl Into<String>, message: impl Into<String>) -> Self {
        GatewayError::Transient {
            gateway: gateway.into(),
            message: message.into(),
        }
    }

    pub fn rejected(
        gateway: impl Into<String>,
        gateway_code: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        GatewayError::Rejected {
            gateway: gateway.into(),
            gateway_code,
            message: message.into(),
        }
    }

    /// Classify a transport-level failure from reqwest.
    ///
    /// Timeouts and connection failures never carry a gateway verdict, so
    /// they are always `Transient`.
    pub fn from_reqwest(gateway: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::transient(gateway, format!("request timed out: {}", err))
        } else if err.is_connect() {
            GatewayError::transient(gateway, format!("connection failed: {}", err))
        } else if err.is_builder() {
            GatewayError::unavailable(gateway, format!("client misconfigured: {}", err))
        } else {
            GatewayError::transient(gateway, err.to_string())
        }
    }

    /// Classify a non-success HTTP response from a gateway.
    ///
    /// 429 and 5xx mean the gateway could not process the request right now;
    /// any other 4xx is an explicit refusal.
    pub fn from_response(gateway: &str, status: u16, body: &str) -> Self {
        if status == 429 || status >= 500 {
            GatewayError::transient(gateway, format!("HTTP {}: {}", status, body))
        } else {
            GatewayError::rejected(
                gateway,
                Some(format!("HTTP_{}", status)),
                format!("HTTP {}: {}", status, body),
            )
        }
    }

    /// Only `Transient` moves the orchestrator on to the next candidate.
    pub fn allows_failover(&self) -> bool {
        matches!(self, GatewayError::Transient { .. })
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Unavailable { .. } => true,
            GatewayError::Transient { .. } => true,
            GatewayError::Rejected { .. } => false,
        }
    }

    pub fn gateway(&self) -> &str {
        match self {
            GatewayError::Unavailable { gateway, .. } => gateway,
            GatewayError::Transient { gateway, .. } => gateway,
            GatewayError::Rejected { gateway, .. } => gateway,
        }
    }
}

impl From<GatewayError> for crate::error::AppError {
    fn from(err: GatewayError) -> Self {
        use crate::error::{AppError, AppErrorKind, ExternalError};

        let gateway = err.gateway().to_string();
        let is_retryable = err.is_retryable();

        AppError::new(AppErrorKind::External(ExternalError::Gateway {
            gateway,
            message: err.to_string(),
            is_retryable,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_allows_failover() {
        assert!(!GatewayError::unavailable("razorpay", "missing credentials").allows_failover());
        assert!(GatewayError::transient("razorpay", "timeout").allows_failover());
        assert!(!GatewayError::rejected("razorpay", None, "declined").allows_failover());
    }

    #[test]
    fn response_status_classification() {
        assert!(matches!(
            GatewayError::from_response("cashfree", 503, "upstream down"),
            GatewayError::Transient { .. }
        ));
        assert!(matches!(
            GatewayError::from_response("cashfree", 429, "slow down"),
            GatewayError::Transient { .. }
        ));

        let rejected = GatewayError::from_response("cashfree", 400, "bad order");
        match rejected {
            GatewayError::Rejected { gateway_code, .. } => {
                assert_eq!(gateway_code.as_deref(), Some("HTTP_400"));
            }
            other => panic!("expected Rejected, got {:?}", other),
        }
    }

    #[test]
    fn rejection_is_not_retryable() {
        assert!(!GatewayError::rejected("razorpay", None, "card declined").is_retryable());
        assert!(GatewayError::transient("razorpay", "502").is_retryable());
        assert!(GatewayError::unavailable("razorpay", "disabled").is_retryable());
    }

    #[test]
    fn app_error_conversion_keeps_retryability() {
        let app: crate::error::AppError =
            GatewayError::transient("razorpay", "timeout").into();
        assert_eq!(app.status_code(), 502);
        assert!(app.is_retryable());

        let app: crate::error::AppError =
            GatewayError::rejected("razorpay", None, "declined").into();
        assert!(!app.is_retryable());
    }
}
