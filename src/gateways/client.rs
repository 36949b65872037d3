use crate::gateways::error::GatewayResult;
use crate::gateways::types::{
    GatewayName, GatewayOrderHandle, GatewayOrderRequest, GatewayRefundRequest,
    GatewayStatusSnapshot, GatewayWebhook, RefundSubmission, SignatureCheck,
};
use async_trait::async_trait;

/// Uniform surface every payment gateway adapter implements.
///
/// Adapters own all provider wire knowledge; callers only ever see the
/// normalized types and the closed `GatewayError` taxonomy.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn create_order(&self, request: GatewayOrderRequest)
        -> GatewayResult<GatewayOrderHandle>;

    async fn fetch_status(&self, gateway_order_ref: &str) -> GatewayResult<GatewayStatusSnapshot>;

    async fn submit_refund(&self, request: GatewayRefundRequest)
        -> GatewayResult<RefundSubmission>;

    /// Verify a webhook's authenticity against the raw body.
    ///
    /// `timestamp` is only consulted by gateways whose signature covers a
    /// timestamp header.
    fn verify_signature(
        &self,
        payload: &[u8],
        signature: Option<&str>,
        timestamp: Option<&str>,
    ) -> SignatureCheck;

    /// Normalize a raw webhook body. Unknown event types come back as
    /// `WebhookKind::Unrecognized`, not as errors.
    fn parse_webhook(&self, payload: &[u8]) -> GatewayResult<GatewayWebhook>;

    fn name(&self) -> GatewayName;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateways::types::{GatewayPaymentStatus, WebhookKind};

    struct MockGateway;

    #[async_trait]
    impl GatewayClient for MockGateway {
        async fn create_order(
            &self,
            request: GatewayOrderRequest,
        ) -> GatewayResult<GatewayOrderHandle> {
            Ok(GatewayOrderHandle {
                gateway_order_ref: format!("mock_{}", request.order_id),
                checkout_token: Some("https://example.com/checkout".to_string()),
            })
        }

        async fn fetch_status(
            &self,
            _gateway_order_ref: &str,
        ) -> GatewayResult<GatewayStatusSnapshot> {
            Ok(GatewayStatusSnapshot {
                status: GatewayPaymentStatus::Paid,
                reason: None,
                gateway_payment_ref: Some("mock_pay_1".to_string()),
            })
        }

        async fn submit_refund(
            &self,
            request: GatewayRefundRequest,
        ) -> GatewayResult<RefundSubmission> {
            Ok(RefundSubmission {
                gateway_refund_ref: format!("mock_rfnd_{}", request.refund_id),
                provider_status: "processed".to_string(),
            })
        }

        fn verify_signature(
            &self,
            _payload: &[u8],
            signature: Option<&str>,
            _timestamp: Option<&str>,
        ) -> SignatureCheck {
            match signature {
                Some(_) => SignatureCheck::valid(),
                None => SignatureCheck::invalid("missing signature header"),
            }
        }

        fn parse_webhook(&self, payload: &[u8]) -> GatewayResult<GatewayWebhook> {
            Ok(GatewayWebhook {
                gateway: self.name(),
                event_id: Some("mock-evt".to_string()),
                kind: WebhookKind::Payment {
                    gateway_order_ref: "mock_order".to_string(),
                    status: GatewayPaymentStatus::Paid,
                    reason: None,
                    gateway_payment_ref: None,
                },
                payload: serde_json::from_slice(payload).unwrap_or_default(),
                received_at: chrono::Utc::now(),
            })
        }

        fn name(&self) -> GatewayName {
            GatewayName::new("mock")
        }
    }

    #[tokio::test]
    async fn trait_can_be_implemented_by_mock_gateway() {
        let gateway: Box<dyn GatewayClient> = Box::new(MockGateway);

        let handle = gateway
            .create_order(GatewayOrderRequest {
                order_id: "ord_1".to_string(),
                amount_minor: 500_000,
                currency: "INR".to_string(),
                payer_id: "payer_1".to_string(),
                instrument_ref: None,
            })
            .await
            .expect("order creation should succeed");
        assert_eq!(handle.gateway_order_ref, "mock_ord_1");

        let snapshot = gateway
            .fetch_status(&handle.gateway_order_ref)
            .await
            .expect("status fetch should succeed");
        assert_eq!(snapshot.status, GatewayPaymentStatus::Paid);

        let check = gateway.verify_signature(b"{}", None, None);
        assert!(!check.valid);

        let webhook = gateway
            .parse_webhook(br#"{"event":"payment.captured"}"#)
            .expect("parse should succeed");
        assert_eq!(webhook.gateway.as_str(), "mock");
    }
}
