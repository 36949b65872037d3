use crate::gateways::client::GatewayClient;
use crate::gateways::error::{GatewayError, GatewayResult};
use crate::gateways::types::{
    GatewayName, GatewayOrderHandle, GatewayOrderRequest, GatewayPaymentStatus,
    GatewayRefundOutcome, GatewayRefundRequest, GatewayStatusSnapshot, GatewayWebhook,
    RefundSubmission, SignatureCheck, WebhookKind,
};
use crate::gateways::utils::{verify_hmac_sha256_hex, GatewayHttpClient};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::info;

pub const CASHFREE: &str = "cashfree";

const API_VERSION: &str = "2023-08-01";

#[derive(Debug, Clone)]
pub struct CashfreeConfig {
    pub app_id: String,
    pub secret_key: String,
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for CashfreeConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            secret_key: String::new(),
            base_url: "https://api.cashfree.com".to_string(),
            timeout_secs: 30,
            max_retries: 2,
        }
    }
}

impl CashfreeConfig {
    pub fn from_env() -> GatewayResult<Self> {
        let app_id = std::env::var("CASHFREE_APP_ID").map_err(|_| {
            GatewayError::unavailable(CASHFREE, "CASHFREE_APP_ID environment variable is required")
        })?;
        let secret_key = std::env::var("CASHFREE_SECRET_KEY").map_err(|_| {
            GatewayError::unavailable(
                CASHFREE,
                "CASHFREE_SECRET_KEY environment variable is required",
            )
        })?;

        Ok(Self {
            base_url: std::env::var("CASHFREE_BASE_URL")
                .unwrap_or_else(|_| "https://api.cashfree.com".to_string()),
            timeout_secs: std::env::var("GATEWAY_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30),
            max_retries: std::env::var("GATEWAY_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(2),
            app_id,
            secret_key,
        })
    }
}

pub struct CashfreeGateway {
    config: CashfreeConfig,
    http: GatewayHttpClient,
}

impl CashfreeGateway {
    pub fn new(config: CashfreeConfig) -> GatewayResult<Self> {
        let http = GatewayHttpClient::new(
            CASHFREE,
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> GatewayResult<Self> {
        Self::new(CashfreeConfig::from_env()?)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    fn auth_headers(&self) -> [(&str, &str); 3] {
        [
            ("x-client-id", self.config.app_id.as_str()),
            ("x-client-secret", self.config.secret_key.as_str()),
            ("x-api-version", API_VERSION),
        ]
    }
}

#[async_trait]
impl GatewayClient for CashfreeGateway {
    async fn create_order(
        &self,
        request: GatewayOrderRequest,
    ) -> GatewayResult<GatewayOrderHandle> {
        request
            .validate()
            .map_err(|reason| GatewayError::rejected(CASHFREE, None, reason))?;

        let mut payload = serde_json::json!({
            "order_id": request.order_id,
            "order_amount": to_decimal_amount(request.amount_minor),
            "order_currency": request.currency,
            "customer_details": { "customer_id": request.payer_id },
        });
        if let Some(instrument) = &request.instrument_ref {
            payload["payment_instrument_ref"] = serde_json::json!(instrument);
        }

        let order: CashfreeOrderData = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("/pg/orders"),
                None,
                Some(&payload),
                &self.auth_headers(),
            )
            .await?;

        info!(order_id = %request.order_id, gateway_order_ref = %order.order_id, "cashfree order created");

        // Cashfree keys status and refund calls off the merchant order id,
        // so that is the ref we hold onto.
        Ok(GatewayOrderHandle {
            gateway_order_ref: order.order_id,
            checkout_token: order.payment_session_id,
        })
    }

    async fn fetch_status(&self, gateway_order_ref: &str) -> GatewayResult<GatewayStatusSnapshot> {
        let payments: Vec<CashfreePaymentData> = self
            .http
            .request_json(
                reqwest::Method::GET,
                &self.endpoint(&format!("/pg/orders/{}/payments", gateway_order_ref)),
                None,
                None,
                &self.auth_headers(),
            )
            .await?;

        Ok(normalize_payments(&payments))
    }

    async fn submit_refund(
        &self,
        request: GatewayRefundRequest,
    ) -> GatewayResult<RefundSubmission> {
        let payload = serde_json::json!({
            "refund_id": request.refund_id,
            "refund_amount": to_decimal_amount(request.amount_minor),
        });

        let refund: CashfreeRefundData = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint(&format!("/pg/orders/{}/refunds", request.gateway_order_ref)),
                None,
                Some(&payload),
                &self.auth_headers(),
            )
            .await?;

        let gateway_refund_ref = refund.cf_refund_id.unwrap_or(refund.refund_id);
        info!(refund_id = %request.refund_id, gateway_refund_ref = %gateway_refund_ref, "cashfree refund submitted");

        Ok(RefundSubmission {
            gateway_refund_ref,
            provider_status: refund.refund_status,
        })
    }

    fn verify_signature(
        &self,
        payload: &[u8],
        signature: Option<&str>,
        timestamp: Option<&str>,
    ) -> SignatureCheck {
        let signature = match signature {
            Some(v) if !v.trim().is_empty() => v,
            _ => return SignatureCheck::invalid("missing x-webhook-signature header"),
        };
        let timestamp = match timestamp {
            Some(v) if !v.trim().is_empty() => v,
            _ => return SignatureCheck::invalid("missing x-webhook-timestamp header"),
        };

        // The signature covers timestamp + raw body.
        let mut message = Vec::with_capacity(timestamp.len() + payload.len());
        message.extend_from_slice(timestamp.as_bytes());
        message.extend_from_slice(payload);

        if verify_hmac_sha256_hex(&message, &self.config.secret_key, signature) {
            SignatureCheck::valid()
        } else {
            SignatureCheck::invalid("invalid cashfree signature")
        }
    }

    fn parse_webhook(&self, payload: &[u8]) -> GatewayResult<GatewayWebhook> {
        let parsed: JsonValue = serde_json::from_slice(payload).map_err(|e| {
            GatewayError::rejected(CASHFREE, None, format!("invalid webhook JSON payload: {}", e))
        })?;

        let event_type = parsed
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let order_ref = parsed
            .pointer("/data/order/order_id")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let payment = parsed.pointer("/data/payment").cloned().unwrap_or(JsonValue::Null);
        let payment_ref = json_id_string(payment.get("cf_payment_id"));
        let payment_message = payment
            .get("payment_message")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string());

        let (event_id, kind) = match event_type.as_str() {
            "PAYMENT_SUCCESS_WEBHOOK" => (
                payment_event_id(&event_type, payment_ref.as_deref()),
                WebhookKind::Payment {
                    gateway_order_ref: order_ref,
                    status: GatewayPaymentStatus::Paid,
                    reason: None,
                    gateway_payment_ref: payment_ref,
                },
            ),
            "PAYMENT_FAILED_WEBHOOK" => (
                payment_event_id(&event_type, payment_ref.as_deref()),
                WebhookKind::Payment {
                    gateway_order_ref: order_ref,
                    status: classify_failure_message(payment_message.as_deref().unwrap_or("")),
                    reason: payment_message,
                    gateway_payment_ref: payment_ref,
                },
            ),
            "PAYMENT_USER_DROPPED_WEBHOOK" => (
                payment_event_id(&event_type, payment_ref.as_deref()),
                WebhookKind::Payment {
                    gateway_order_ref: order_ref,
                    status: GatewayPaymentStatus::HardFailure,
                    reason: Some("checkout abandoned by payer".to_string()),
                    gateway_payment_ref: payment_ref,
                },
            ),
            "REFUND_STATUS_WEBHOOK" => {
                let refund = parsed.pointer("/data/refund").cloned().unwrap_or(JsonValue::Null);
                let refund_ref = json_id_string(refund.get("cf_refund_id"))
                    .or_else(|| json_id_string(refund.get("refund_id")))
                    .unwrap_or_default();
                let refund_status = refund
                    .get("refund_status")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let refund_order_ref = refund
                    .get("order_id")
                    .and_then(|v| v.as_str())
                    .map(|v| v.to_string())
                    .unwrap_or(order_ref);

                let event_id = Some(format!("{}:{}:{}", event_type, refund_ref, refund_status));
                let kind = match refund_status.as_str() {
                    "SUCCESS" => WebhookKind::Refund {
                        gateway_refund_ref: refund_ref,
                        gateway_order_ref: refund_order_ref,
                        outcome: GatewayRefundOutcome::Confirmed,
                    },
                    "FAILED" | "CANCELLED" => WebhookKind::Refund {
                        gateway_refund_ref: refund_ref,
                        gateway_order_ref: refund_order_ref,
                        outcome: GatewayRefundOutcome::Failed,
                    },
                    // PENDING / ONHOLD are not terminal; acknowledge and wait
                    // for the next status webhook.
                    other => WebhookKind::Unrecognized {
                        event_type: format!("{}:{}", event_type, other),
                    },
                };
                (event_id, kind)
            }
            _ => (None, WebhookKind::Unrecognized { event_type }),
        };

        Ok(GatewayWebhook {
            gateway: self.name(),
            event_id,
            kind,
            payload: parsed,
            received_at: chrono::Utc::now(),
        })
    }

    fn name(&self) -> GatewayName {
        GatewayName::new(CASHFREE)
    }
}

/// Cashfree takes decimal major units on the wire; callers always pass minor
/// units.
fn to_decimal_amount(amount_minor: i64) -> f64 {
    amount_minor as f64 / 100.0
}

fn payment_event_id(event_type: &str, payment_ref: Option<&str>) -> Option<String> {
    payment_ref.map(|r| format!("{}:{}", event_type, r))
}

/// Cashfree reports every failed attempt as `FAILED` and hides the cause in
/// the message text, so retryability is inferred from it.
fn classify_failure_message(message: &str) -> GatewayPaymentStatus {
    let lowered = message.to_ascii_lowercase();
    let transient = ["timeout", "timed out", "unavailable", "temporar", "try again"]
        .iter()
        .any(|needle| lowered.contains(needle));
    if transient {
        GatewayPaymentStatus::TransientFailure
    } else {
        GatewayPaymentStatus::HardFailure
    }
}

fn normalize_payments(payments: &[CashfreePaymentData]) -> GatewayStatusSnapshot {
    if let Some(success) = payments.iter().find(|p| p.payment_status == "SUCCESS") {
        return GatewayStatusSnapshot {
            status: GatewayPaymentStatus::Paid,
            reason: None,
            gateway_payment_ref: Some(success.cf_payment_id.to_string()),
        };
    }

    if payments.is_empty()
        || payments.iter().any(|p| {
            matches!(
                p.payment_status.as_str(),
                "PENDING" | "NOT_ATTEMPTED" | "FLAGGED"
            )
        })
    {
        return GatewayStatusSnapshot {
            status: GatewayPaymentStatus::Pending,
            reason: None,
            gateway_payment_ref: None,
        };
    }

    let last = &payments[payments.len() - 1];
    let reason = last.payment_message.clone();
    let status = match last.payment_status.as_str() {
        "USER_DROPPED" | "CANCELLED" | "VOID" => GatewayPaymentStatus::HardFailure,
        _ => classify_failure_message(reason.as_deref().unwrap_or("")),
    };
    GatewayStatusSnapshot {
        status,
        reason,
        gateway_payment_ref: None,
    }
}

fn json_id_string(value: Option<&JsonValue>) -> Option<String> {
    match value {
        Some(JsonValue::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct CashfreeOrderData {
    order_id: String,
    #[serde(default)]
    payment_session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CashfreePaymentData {
    cf_payment_id: i64,
    payment_status: String,
    #[serde(default)]
    payment_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CashfreeRefundData {
    #[serde(default)]
    cf_refund_id: Option<String>,
    refund_id: String,
    refund_status: String,
}
