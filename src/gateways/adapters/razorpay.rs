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

pub const RAZORPAY: &str = "razorpay";

#[derive(Debug, Clone)]
pub struct RazorpayConfig {
    pub key_id: String,
    pub key_secret: String,
    pub webhook_secret: Option<String>,
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for RazorpayConfig {
    fn default() -> Self {
        Self {
            key_id: String::new(),
            key_secret: String::new(),
            webhook_secret: None,
            base_url: "https://api.razorpay.com".to_string(),
            timeout_secs: 30,
            max_retries: 2,
        }
    }
}

impl RazorpayConfig {
    pub fn from_env() -> GatewayResult<Self> {
        let key_id = std::env::var("RAZORPAY_KEY_ID").map_err(|_| {
            GatewayError::unavailable(RAZORPAY, "RAZORPAY_KEY_ID environment variable is required")
        })?;
        let key_secret = std::env::var("RAZORPAY_KEY_SECRET").map_err(|_| {
            GatewayError::unavailable(
                RAZORPAY,
                "RAZORPAY_KEY_SECRET environment variable is required",
            )
        })?;

        Ok(Self {
            webhook_secret: std::env::var("RAZORPAY_WEBHOOK_SECRET").ok(),
            base_url: std::env::var("RAZORPAY_BASE_URL")
                .unwrap_or_else(|_| "https://api.razorpay.com".to_string()),
            timeout_secs: std::env::var("GATEWAY_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30),
            max_retries: std::env::var("GATEWAY_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(2),
            key_id,
            key_secret,
        })
    }
}

pub struct RazorpayGateway {
    config: RazorpayConfig,
    http: GatewayHttpClient,
}

impl RazorpayGateway {
    pub fn new(config: RazorpayConfig) -> GatewayResult<Self> {
        let http = GatewayHttpClient::new(
            RAZORPAY,
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> GatewayResult<Self> {
        Self::new(RazorpayConfig::from_env()?)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    fn auth(&self) -> (&str, &str) {
        (&self.config.key_id, &self.config.key_secret)
    }
}

#[async_trait]
impl GatewayClient for RazorpayGateway {
    async fn create_order(
        &self,
        request: GatewayOrderRequest,
    ) -> GatewayResult<GatewayOrderHandle> {
        request
            .validate()
            .map_err(|reason| GatewayError::rejected(RAZORPAY, None, reason))?;

        let mut payload = serde_json::json!({
            "amount": request.amount_minor,
            "currency": request.currency,
            "receipt": request.order_id,
            "payment_capture": 1,
            "notes": { "payer_id": request.payer_id },
        });
        if let Some(token) = &request.instrument_ref {
            payload["token"] = serde_json::json!(token);
        }

        let order: RazorpayOrderData = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("/v1/orders"),
                Some(self.auth()),
                Some(&payload),
                &[("Content-Type", "application/json")],
            )
            .await?;

        info!(order_id = %request.order_id, gateway_order_ref = %order.id, "razorpay order created");

        Ok(GatewayOrderHandle {
            gateway_order_ref: order.id,
            checkout_token: None,
        })
    }

    async fn fetch_status(&self, gateway_order_ref: &str) -> GatewayResult<GatewayStatusSnapshot> {
        let collection: RazorpayPaymentCollection = self
            .http
            .request_json(
                reqwest::Method::GET,
                &self.endpoint(&format!("/v1/orders/{}/payments", gateway_order_ref)),
                Some(self.auth()),
                None,
                &[],
            )
            .await?;

        Ok(normalize_payment_collection(&collection))
    }

    async fn submit_refund(
        &self,
        request: GatewayRefundRequest,
    ) -> GatewayResult<RefundSubmission> {
        let payment_ref = request.gateway_payment_ref.as_deref().ok_or_else(|| {
            GatewayError::rejected(
                RAZORPAY,
                None,
                "order has no captured payment reference to refund",
            )
        })?;

        let payload = serde_json::json!({
            "amount": request.amount_minor,
            "notes": { "refund_id": request.refund_id },
        });

        let refund: RazorpayRefundData = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint(&format!("/v1/payments/{}/refund", payment_ref)),
                Some(self.auth()),
                Some(&payload),
                &[("Content-Type", "application/json")],
            )
            .await?;

        info!(refund_id = %request.refund_id, gateway_refund_ref = %refund.id, "razorpay refund submitted");

        Ok(RefundSubmission {
            gateway_refund_ref: refund.id,
            provider_status: refund.status,
        })
    }

    fn verify_signature(
        &self,
        payload: &[u8],
        signature: Option<&str>,
        _timestamp: Option<&str>,
    ) -> SignatureCheck {
        let signature = match signature {
            Some(v) if !v.trim().is_empty() => v,
            _ => return SignatureCheck::invalid("missing X-Razorpay-Signature header"),
        };
        let secret = self
            .config
            .webhook_secret
            .as_deref()
            .unwrap_or(&self.config.key_secret);
        if verify_hmac_sha256_hex(payload, secret, signature) {
            SignatureCheck::valid()
        } else {
            SignatureCheck::invalid("invalid razorpay signature")
        }
    }

    fn parse_webhook(&self, payload: &[u8]) -> GatewayResult<GatewayWebhook> {
        let parsed: JsonValue = serde_json::from_slice(payload).map_err(|e| {
            GatewayError::rejected(RAZORPAY, None, format!("invalid webhook JSON payload: {}", e))
        })?;

        let event_type = parsed
            .get("event")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let payment = parsed
            .pointer("/payload/payment/entity")
            .cloned()
            .unwrap_or(JsonValue::Null);

        let kind = match event_type.as_str() {
            "payment.captured" => WebhookKind::Payment {
                gateway_order_ref: string_field(&payment, "order_id"),
                status: GatewayPaymentStatus::Paid,
                reason: None,
                gateway_payment_ref: optional_field(&payment, "id"),
            },
            "payment.failed" => {
                let (status, reason) = classify_failed_payment(&payment);
                WebhookKind::Payment {
                    gateway_order_ref: string_field(&payment, "order_id"),
                    status,
                    reason,
                    gateway_payment_ref: optional_field(&payment, "id"),
                }
            }
            "refund.processed" | "refund.failed" => {
                let refund = parsed
                    .pointer("/payload/refund/entity")
                    .cloned()
                    .unwrap_or(JsonValue::Null);
                WebhookKind::Refund {
                    gateway_refund_ref: string_field(&refund, "id"),
                    // Refund webhooks carry the payment entity too; the
                    // order id lives there, not on the refund.
                    gateway_order_ref: string_field(&payment, "order_id"),
                    outcome: if event_type == "refund.processed" {
                        GatewayRefundOutcome::Confirmed
                    } else {
                        GatewayRefundOutcome::Failed
                    },
                }
            }
            _ => WebhookKind::Unrecognized { event_type },
        };

        Ok(GatewayWebhook {
            gateway: self.name(),
            // Razorpay payloads carry no event id; the reconciler keys the
            // ledger off the payload fingerprint instead.
            event_id: None,
            kind,
            payload: parsed,
            received_at: chrono::Utc::now(),
        })
    }

    fn name(&self) -> GatewayName {
        GatewayName::new(RAZORPAY)
    }
}

/// Reduce an order's payment list to one normalized status.
///
/// A captured payment wins outright; otherwise any in-flight attempt keeps
/// the order pending, and only an all-failed list reports a failure.
fn normalize_payment_collection(collection: &RazorpayPaymentCollection) -> GatewayStatusSnapshot {
    if let Some(captured) = collection
        .items
        .iter()
        .find(|p| p.status == "captured" || p.status == "refunded")
    {
        return GatewayStatusSnapshot {
            status: GatewayPaymentStatus::Paid,
            reason: None,
            gateway_payment_ref: Some(captured.id.clone()),
        };
    }

    if collection.items.is_empty()
        || collection
            .items
            .iter()
            .any(|p| p.status == "created" || p.status == "authorized")
    {
        return GatewayStatusSnapshot {
            status: GatewayPaymentStatus::Pending,
            reason: None,
            gateway_payment_ref: None,
        };
    }

    // Every attempt failed. Use the most recent one for the verdict.
    let last = collection.items.last();
    let value = last
        .map(|p| {
            serde_json::json!({
                "error_code": p.error_code,
                "error_description": p.error_description,
            })
        })
        .unwrap_or(JsonValue::Null);
    let (status, reason) = classify_failed_payment(&value);
    GatewayStatusSnapshot {
        status,
        reason,
        gateway_payment_ref: None,
    }
}

/// Split Razorpay's failed-payment error codes into transient vs hard.
///
/// `GATEWAY_ERROR`/`SERVER_ERROR` mean the rails hiccuped; everything else
/// (declines, fraud blocks, bad instruments) is final for this attempt.
fn classify_failed_payment(payment: &JsonValue) -> (GatewayPaymentStatus, Option<String>) {
    let code = payment
        .get("error_code")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let description = payment
        .get("error_description")
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());

    let status = match code {
        "GATEWAY_ERROR" | "SERVER_ERROR" => GatewayPaymentStatus::TransientFailure,
        _ => GatewayPaymentStatus::HardFailure,
    };
    (status, description)
}

fn string_field(value: &JsonValue, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn optional_field(value: &JsonValue, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
}

#[derive(Debug, Deserialize)]
struct RazorpayOrderData {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RazorpayPaymentCollection {
    #[serde(default)]
    items: Vec<RazorpayPaymentData>,
}

#[derive(Debug, Deserialize)]
struct RazorpayPaymentData {
    id: String,
    status: String,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RazorpayRefundData {
    id: String,
    status: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateways::utils::hmac_sha256_hex;
    use serde_json::json;

    fn gateway() -> RazorpayGateway {
        RazorpayGateway::new(RazorpayConfig {
            key_id: "rzp_test_key".to_string(),
            key_secret: "rzp_test_secret".to_string(),
            webhook_secret: Some("whsec_test".to_string()),
            base_url: "https://api.razorpay.com".to_string(),
            timeout_secs: 5,
            max_retries: 1,
        })
        .expect("gateway init should succeed")
    }

    #[test]
    fn webhook_signature_validation() {
        let gateway = gateway();
        let payload = br#"{"event":"payment.captured"}"#;

        let invalid = gateway.verify_signature(payload, Some("invalid_signature"), None);
        assert!(!invalid.valid);

        let signature = hmac_sha256_hex(payload, "whsec_test");
        let valid = gateway.verify_signature(payload, Some(&signature), None);
        assert!(valid.valid);

        let missing = gateway.verify_signature(payload, None, None);
        assert!(!missing.valid);
    }

    #[test]
    fn parse_captured_payment_webhook() {
        let gateway = gateway();
        let payload = json!({
            "event": "payment.captured",
            "payload": {
                "payment": {
                    "entity": {
                        "id": "pay_29QQoUBi66xm2f",
                        "order_id": "order_9A33XWu170gUtm",
                        "status": "captured"
                    }
                }
            }
        });

        let webhook = gateway
            .parse_webhook(payload.to_string().as_bytes())
            .expect("parse should succeed");
        assert_eq!(webhook.gateway.as_str(), "razorpay");
        assert!(webhook.event_id.is_none());
        match webhook.kind {
            WebhookKind::Payment {
                gateway_order_ref,
                status,
                gateway_payment_ref,
                ..
            } => {
                assert_eq!(gateway_order_ref, "order_9A33XWu170gUtm");
                assert_eq!(status, GatewayPaymentStatus::Paid);
                assert_eq!(gateway_payment_ref.as_deref(), Some("pay_29QQoUBi66xm2f"));
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn parse_failed_payment_webhook_classifies_retryability() {
        let gateway = gateway();
        let transient = json!({
            "event": "payment.failed",
            "payload": { "payment": { "entity": {
                "id": "pay_1", "order_id": "order_1", "status": "failed",
                "error_code": "GATEWAY_ERROR", "error_description": "issuer unavailable"
            }}}
        });
        let webhook = gateway
            .parse_webhook(transient.to_string().as_bytes())
            .expect("parse should succeed");
        match webhook.kind {
            WebhookKind::Payment { status, reason, .. } => {
                assert_eq!(status, GatewayPaymentStatus::TransientFailure);
                assert_eq!(reason.as_deref(), Some("issuer unavailable"));
            }
            other => panic!("unexpected kind: {:?}", other),
        }

        let hard = json!({
            "event": "payment.failed",
            "payload": { "payment": { "entity": {
                "id": "pay_2", "order_id": "order_1", "status": "failed",
                "error_code": "BAD_REQUEST_ERROR", "error_description": "card declined"
            }}}
        });
        let webhook = gateway
            .parse_webhook(hard.to_string().as_bytes())
            .expect("parse should succeed");
        match webhook.kind {
            WebhookKind::Payment { status, .. } => {
                assert_eq!(status, GatewayPaymentStatus::HardFailure)
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn parse_refund_webhook_takes_order_from_payment_entity() {
        let gateway = gateway();
        let payload = json!({
            "event": "refund.processed",
            "payload": {
                "refund": { "entity": { "id": "rfnd_FP8QHiV938haTz", "payment_id": "pay_1" } },
                "payment": { "entity": { "id": "pay_1", "order_id": "order_77" } }
            }
        });

        let webhook = gateway
            .parse_webhook(payload.to_string().as_bytes())
            .expect("parse should succeed");
        match webhook.kind {
            WebhookKind::Refund {
                gateway_refund_ref,
                gateway_order_ref,
                outcome,
            } => {
                assert_eq!(gateway_refund_ref, "rfnd_FP8QHiV938haTz");
                assert_eq!(gateway_order_ref, "order_77");
                assert_eq!(outcome, GatewayRefundOutcome::Confirmed);
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn parse_unknown_event_is_unrecognized() {
        let gateway = gateway();
        let payload = json!({"event": "settlement.processed", "payload": {}});
        let webhook = gateway
            .parse_webhook(payload.to_string().as_bytes())
            .expect("parse should succeed");
        match webhook.kind {
            WebhookKind::Unrecognized { event_type } => {
                assert_eq!(event_type, "settlement.processed")
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn payment_collection_normalization() {
        let paid = RazorpayPaymentCollection {
            items: vec![
                RazorpayPaymentData {
                    id: "pay_a".to_string(),
                    status: "failed".to_string(),
                    error_code: Some("BAD_REQUEST_ERROR".to_string()),
                    error_description: None,
                },
                RazorpayPaymentData {
                    id: "pay_b".to_string(),
                    status: "captured".to_string(),
                    error_code: None,
                    error_description: None,
                },
            ],
        };
        let snapshot = normalize_payment_collection(&paid);
        assert_eq!(snapshot.status, GatewayPaymentStatus::Paid);
        assert_eq!(snapshot.gateway_payment_ref.as_deref(), Some("pay_b"));

        let empty = RazorpayPaymentCollection { items: vec![] };
        assert_eq!(
            normalize_payment_collection(&empty).status,
            GatewayPaymentStatus::Pending
        );

        let all_failed = RazorpayPaymentCollection {
            items: vec![RazorpayPaymentData {
                id: "pay_c".to_string(),
                status: "failed".to_string(),
                error_code: Some("SERVER_ERROR".to_string()),
                error_description: Some("try again".to_string()),
            }],
        };
        let snapshot = normalize_payment_collection(&all_failed);
        assert_eq!(snapshot.status, GatewayPaymentStatus::TransientFailure);
        assert_eq!(snapshot.reason.as_deref(), Some("try again"));
    }
}
