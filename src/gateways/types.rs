use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifier for a configured payment gateway.
///
/// Names are normalized to lowercase so `"Razorpay"`, `"razorpay"` and the
/// webhook path segment all key the same registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GatewayName(String);

#[derive(Debug, Error)]
#[error("invalid gateway name: {0:?}")]
pub struct InvalidGatewayName(pub String);

impl GatewayName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GatewayName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GatewayName {
    type Err = InvalidGatewayName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(InvalidGatewayName(s.to_string()));
        }
        Ok(Self::new(trimmed))
    }
}

/// Order-creation request handed to a gateway adapter.
///
/// `amount_minor` is always in minor currency units (paise, cents); adapters
/// never convert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayOrderRequest {
    /// Local order id, passed through as the provider receipt/reference.
    pub order_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub payer_id: String,
    /// Stored payment-instrument reference for auto-debit flows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument_ref: Option<String>,
}

impl GatewayOrderRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.amount_minor <= 0 {
            return Err(format!(
                "amount_minor must be positive, got {}",
                self.amount_minor
            ));
        }
        if self.currency.trim().is_empty() {
            return Err("currency is required".to_string());
        }
        if self.order_id.trim().is_empty() {
            return Err("order_id is required".to_string());
        }
        Ok(())
    }
}

/// Provider-side handle returned by a successful order creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayOrderHandle {
    pub gateway_order_ref: String,
    /// Redirect URL or client session token, when the provider issues one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_token: Option<String>,
}

/// Provider payment status normalized at the adapter boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayPaymentStatus {
    /// Funds captured; the order is payable.
    Paid,
    /// Still awaiting payer action or provider settlement.
    Pending,
    /// Failed in a way the provider considers retryable (timeout, issuer
    /// unavailable, temporary decline).
    TransientFailure,
    /// Failed permanently for this attempt (fraud block, invalid instrument,
    /// expired/abandoned checkout).
    HardFailure,
}

impl fmt::Display for GatewayPaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GatewayPaymentStatus::Paid => "paid",
            GatewayPaymentStatus::Pending => "pending",
            GatewayPaymentStatus::TransientFailure => "transient_failure",
            GatewayPaymentStatus::HardFailure => "hard_failure",
        };
        write!(f, "{}", s)
    }
}

/// Point-in-time payment status returned by `fetch_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayStatusSnapshot {
    pub status: GatewayPaymentStatus,
    /// Provider-reported failure reason, when the status is a failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Provider payment id, once one exists. Refund submission needs it on
    /// gateways that refund payments rather than orders.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_payment_ref: Option<String>,
}

/// Outcome reported by a refund webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayRefundOutcome {
    Confirmed,
    Failed,
}

/// Refund-submission request handed to a gateway adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRefundRequest {
    /// Local refund id, passed through as the provider note/reference.
    pub refund_id: String,
    pub gateway_order_ref: String,
    /// Captured payment id recorded when the order succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_payment_ref: Option<String>,
    pub amount_minor: i64,
}

/// Acknowledgement returned by `submit_refund`. Confirmation always arrives
/// asynchronously via webhook; this only proves the gateway accepted the
/// request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundSubmission {
    pub gateway_refund_ref: String,
    /// Raw provider status at submission time, informational only.
    pub provider_status: String,
}

/// Result of webhook signature verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureCheck {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SignatureCheck {
    pub fn valid() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// A webhook payload normalized at the adapter boundary. Upstream code never
/// sees provider wire shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayWebhook {
    pub gateway: GatewayName,
    /// Provider event id when the provider supplies one; otherwise the
    /// reconciler derives a ledger key from the payload hash.
    pub event_id: Option<String>,
    pub kind: WebhookKind,
    /// Original payload, retained for the ledger/orphan record.
    pub payload: JsonValue,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WebhookKind {
    Payment {
        gateway_order_ref: String,
        status: GatewayPaymentStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// Provider payment id, kept on the order for later refunds.
        #[serde(skip_serializing_if = "Option::is_none")]
        gateway_payment_ref: Option<String>,
    },
    Refund {
        gateway_refund_ref: String,
        gateway_order_ref: String,
        outcome: GatewayRefundOutcome,
    },
    /// Event types this service does not track (settlements, disputes, ...).
    /// Acknowledged without touching any order.
    Unrecognized { event_type: String },
}
