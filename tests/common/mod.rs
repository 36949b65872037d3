//! Shared test doubles: scripted gateway clients, a recording notification
//! sink, and a store wrapper that injects write conflicts.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use Coursepay_backend::database::error::DbResult;
use Coursepay_backend::database::models::{
    DueTranche, InstallmentPlanRecord, InstallmentTrancheRecord, NewInstallmentPlan, NewOrder,
    NewOrphanEvent, NewRefund, NewWebhookEvent, OrderTransition, PaymentOrderRecord, RefundRecord,
    RefundResolution,
};
use Coursepay_backend::database::{MemoryOrderStore, OrderStore, WebhookApplyOutcome};
use Coursepay_backend::gateways::{
    GatewayClient, GatewayError, GatewayName, GatewayOrderHandle, GatewayOrderRequest,
    GatewayPaymentStatus, GatewayRefundOutcome, GatewayRefundRequest, GatewayResult,
    GatewayStatusSnapshot, GatewayWebhook, RefundSubmission, SignatureCheck, WebhookKind,
};
use Coursepay_backend::services::{NotificationKind, NotificationSink};

// ---------------------------------------------------------------------------
// Scripted gateway client
// ---------------------------------------------------------------------------

/// Gateway double with per-call scripted outcomes.
///
/// Pushed results are consumed front-to-back; an empty script falls back to
/// the configured default (accept orders, report `pending` status, accept
/// refunds).
pub struct ScriptedGateway {
    name: GatewayName,
    create_script: Mutex<VecDeque<GatewayResult<GatewayOrderHandle>>>,
    create_fallback: Option<GatewayError>,
    status_script: Mutex<VecDeque<GatewayResult<GatewayStatusSnapshot>>>,
    refund_script: Mutex<VecDeque<GatewayResult<RefundSubmission>>>,
    expected_signature: Option<String>,
    pub create_calls: Mutex<Vec<String>>,
    pub refund_calls: Mutex<Vec<GatewayRefundRequest>>,
}

impl ScriptedGateway {
    fn build(
        name: &str,
        create_fallback: Option<GatewayError>,
        expected_signature: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: GatewayName::new(name),
            create_script: Mutex::new(VecDeque::new()),
            create_fallback,
            status_script: Mutex::new(VecDeque::new()),
            refund_script: Mutex::new(VecDeque::new()),
            expected_signature,
            create_calls: Mutex::new(Vec::new()),
            refund_calls: Mutex::new(Vec::new()),
        })
    }

    /// Accepts every order with a generated `<name>_<order_id>` ref.
    pub fn accepting(name: &str) -> Arc<Self> {
        Self::build(name, None, None)
    }

    /// Reports itself unusable on every order creation.
    pub fn unavailable(name: &str) -> Arc<Self> {
        let err = GatewayError::unavailable(name, "credentials expired");
        Self::build(name, Some(err), None)
    }

    /// Fails every order creation transiently.
    pub fn flaky(name: &str) -> Arc<Self> {
        let err = GatewayError::transient(name, "upstream timeout");
        Self::build(name, Some(err), None)
    }

    /// Rejects every order creation outright.
    pub fn rejecting(name: &str, code: &str) -> Arc<Self> {
        let err = GatewayError::rejected(name, Some(code.to_string()), "order refused");
        Self::build(name, Some(err), None)
    }

    /// Accepts orders, but verifies webhook signatures against `secret`.
    pub fn with_signature(name: &str, secret: &str) -> Arc<Self> {
        Self::build(name, None, Some(secret.to_string()))
    }

    pub fn push_create(&self, result: GatewayResult<GatewayOrderHandle>) {
        self.create_script.lock().unwrap().push_back(result);
    }

    pub fn push_status(&self, result: GatewayResult<GatewayStatusSnapshot>) {
        self.status_script.lock().unwrap().push_back(result);
    }

    pub fn push_refund(&self, result: GatewayResult<RefundSubmission>) {
        self.refund_script.lock().unwrap().push_back(result);
    }

    pub fn create_call_count(&self) -> usize {
        self.create_calls.lock().unwrap().len()
    }
}

#[async_trait]
impl GatewayClient for ScriptedGateway {
    async fn create_order(&self, request: GatewayOrderRequest) -> GatewayResult<GatewayOrderHandle> {
        self.create_calls.lock().unwrap().push(request.order_id.clone());
        if let Some(scripted) = self.create_script.lock().unwrap().pop_front() {
            return scripted;
        }
        match &self.create_fallback {
            Some(err) => Err(err.clone()),
            None => Ok(GatewayOrderHandle {
                gateway_order_ref: format!("{}_{}", self.name, request.order_id),
                checkout_token: None,
            }),
        }
    }

    async fn fetch_status(&self, _gateway_order_ref: &str) -> GatewayResult<GatewayStatusSnapshot> {
        if let Some(scripted) = self.status_script.lock().unwrap().pop_front() {
            return scripted;
        }
        Ok(GatewayStatusSnapshot {
            status: GatewayPaymentStatus::Pending,
            reason: None,
            gateway_payment_ref: None,
        })
    }

    async fn submit_refund(&self, request: GatewayRefundRequest) -> GatewayResult<RefundSubmission> {
        self.refund_calls.lock().unwrap().push(request.clone());
        if let Some(scripted) = self.refund_script.lock().unwrap().pop_front() {
            return scripted;
        }
        Ok(RefundSubmission {
            gateway_refund_ref: format!("rfnd_{}", request.refund_id),
            provider_status: "pending".to_string(),
        })
    }

    fn verify_signature(
        &self,
        _payload: &[u8],
        signature: Option<&str>,
        _timestamp: Option<&str>,
    ) -> SignatureCheck {
        match &self.expected_signature {
            None => SignatureCheck::valid(),
            Some(secret) => match signature {
                Some(sig) if sig == secret => SignatureCheck::valid(),
                Some(_) => SignatureCheck::invalid("signature mismatch"),
                None => SignatureCheck::invalid("missing signature header"),
            },
        }
    }

    fn parse_webhook(&self, payload: &[u8]) -> GatewayResult<GatewayWebhook> {
        let value: JsonValue = serde_json::from_slice(payload).map_err(|e| {
            GatewayError::rejected(
                self.name.as_str(),
                None,
                format!("unparseable payload: {}", e),
            )
        })?;

        let event_id = value
            .get("event_id")
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        let field = |key: &str| {
            value
                .get(key)
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string()
        };

        let kind = match value.get("type").and_then(JsonValue::as_str) {
            Some("payment") => WebhookKind::Payment {
                gateway_order_ref: field("gateway_order_ref"),
                status: match value.get("status").and_then(JsonValue::as_str) {
                    Some("paid") => GatewayPaymentStatus::Paid,
                    Some("pending") => GatewayPaymentStatus::Pending,
                    Some("transient_failure") => GatewayPaymentStatus::TransientFailure,
                    _ => GatewayPaymentStatus::HardFailure,
                },
                reason: value
                    .get("reason")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string),
                gateway_payment_ref: value
                    .get("gateway_payment_ref")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string),
            },
            Some("refund") => WebhookKind::Refund {
                gateway_refund_ref: field("gateway_refund_ref"),
                gateway_order_ref: field("gateway_order_ref"),
                outcome: match value.get("outcome").and_then(JsonValue::as_str) {
                    Some("confirmed") => GatewayRefundOutcome::Confirmed,
                    _ => GatewayRefundOutcome::Failed,
                },
            },
            other => WebhookKind::Unrecognized {
                event_type: other.unwrap_or("unknown").to_string(),
            },
        };

        Ok(GatewayWebhook {
            gateway: self.name.clone(),
            event_id,
            kind,
            payload: value,
            received_at: Utc::now(),
        })
    }

    fn name(&self) -> GatewayName {
        self.name.clone()
    }
}

// ---------------------------------------------------------------------------
// Webhook bodies in the scripted gateway's wire format
// ---------------------------------------------------------------------------

pub fn payment_event_body(
    event_id: Option<&str>,
    gateway_order_ref: &str,
    status: &str,
    gateway_payment_ref: Option<&str>,
) -> Vec<u8> {
    let mut body = json!({
        "type": "payment",
        "gateway_order_ref": gateway_order_ref,
        "status": status,
    });
    if let Some(id) = event_id {
        body["event_id"] = json!(id);
    }
    if let Some(payment_ref) = gateway_payment_ref {
        body["gateway_payment_ref"] = json!(payment_ref);
    }
    serde_json::to_vec(&body).unwrap()
}

pub fn refund_event_body(
    event_id: &str,
    gateway_refund_ref: &str,
    gateway_order_ref: &str,
    outcome: &str,
) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "event_id": event_id,
        "type": "refund",
        "gateway_refund_ref": gateway_refund_ref,
        "gateway_order_ref": gateway_order_ref,
        "outcome": outcome,
    }))
    .unwrap()
}

pub fn unrecognized_event_body(event_id: &str, event_type: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "event_id": event_id,
        "type": event_type,
    }))
    .unwrap()
}

// ---------------------------------------------------------------------------
// Recording notification sink
// ---------------------------------------------------------------------------

/// Records every notification delivered, for exactly-once assertions.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(NotificationKind, String, String)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<(NotificationKind, String, String)> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, kind: NotificationKind) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _, _)| *k == kind)
            .count()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, kind: NotificationKind, order: &PaymentOrderRecord, message: &str) {
        self.events
            .lock()
            .unwrap()
            .push((kind, order.id.clone(), message.to_string()));
    }
}

// ---------------------------------------------------------------------------
// Conflict-injecting store
// ---------------------------------------------------------------------------

/// Delegates to a [`MemoryOrderStore`] but answers the first N
/// `apply_webhook_event` calls with a write conflict, as if a concurrent
/// update had invalidated the read.
pub struct ConflictingStore {
    inner: MemoryOrderStore,
    conflicts_left: AtomicUsize,
}

impl ConflictingStore {
    pub fn new(conflicts: usize) -> Self {
        Self {
            inner: MemoryOrderStore::new(),
            conflicts_left: AtomicUsize::new(conflicts),
        }
    }

    pub async fn webhook_event_count(&self) -> usize {
        self.inner.webhook_event_count().await
    }
}

#[async_trait]
impl OrderStore for ConflictingStore {
    async fn insert_order(&self, order: NewOrder) -> DbResult<PaymentOrderRecord> {
        self.inner.insert_order(order).await
    }

    async fn get_order(&self, order_id: &str) -> DbResult<Option<PaymentOrderRecord>> {
        self.inner.get_order(order_id).await
    }

    async fn find_order_by_gateway_ref(
        &self,
        gateway_name: &str,
        gateway_order_ref: &str,
    ) -> DbResult<Option<PaymentOrderRecord>> {
        self.inner
            .find_order_by_gateway_ref(gateway_name, gateway_order_ref)
            .await
    }

    async fn transition_order(
        &self,
        transition: OrderTransition,
    ) -> DbResult<Option<PaymentOrderRecord>> {
        self.inner.transition_order(transition).await
    }

    async fn list_retry_candidates(&self, limit: i64) -> DbResult<Vec<PaymentOrderRecord>> {
        self.inner.list_retry_candidates(limit).await
    }

    async fn apply_webhook_event(
        &self,
        event: NewWebhookEvent,
        transition: Option<OrderTransition>,
        refund: Option<RefundResolution>,
    ) -> DbResult<WebhookApplyOutcome> {
        let left = self.conflicts_left.load(Ordering::SeqCst);
        if left > 0 {
            self.conflicts_left.store(left - 1, Ordering::SeqCst);
            return Ok(WebhookApplyOutcome::Conflict);
        }
        self.inner.apply_webhook_event(event, transition, refund).await
    }

    async fn record_orphan_event(&self, event: NewOrphanEvent) -> DbResult<()> {
        self.inner.record_orphan_event(event).await
    }

    async fn insert_refund(&self, refund: NewRefund) -> DbResult<RefundRecord> {
        self.inner.insert_refund(refund).await
    }

    async fn get_refund(&self, refund_id: &str) -> DbResult<Option<RefundRecord>> {
        self.inner.get_refund(refund_id).await
    }

    async fn find_refund_by_gateway_ref(
        &self,
        gateway_refund_ref: &str,
    ) -> DbResult<Option<RefundRecord>> {
        self.inner.find_refund_by_gateway_ref(gateway_refund_ref).await
    }

    async fn find_open_refund_for_order(
        &self,
        order_id: &str,
    ) -> DbResult<Option<RefundRecord>> {
        self.inner.find_open_refund_for_order(order_id).await
    }

    async fn set_refund_submission(
        &self,
        refund_id: &str,
        gateway_refund_ref: &str,
        provider_status: &str,
    ) -> DbResult<()> {
        self.inner
            .set_refund_submission(refund_id, gateway_refund_ref, provider_status)
            .await
    }

    async fn resolve_refund(
        &self,
        resolution: RefundResolution,
        order_transition: Option<OrderTransition>,
    ) -> DbResult<Option<RefundRecord>> {
        self.inner.resolve_refund(resolution, order_transition).await
    }

    async fn insert_plan(
        &self,
        plan: NewInstallmentPlan,
    ) -> DbResult<(InstallmentPlanRecord, Vec<InstallmentTrancheRecord>)> {
        self.inner.insert_plan(plan).await
    }

    async fn get_plan(
        &self,
        plan_id: &str,
    ) -> DbResult<Option<(InstallmentPlanRecord, Vec<InstallmentTrancheRecord>)>> {
        self.inner.get_plan(plan_id).await
    }

    async fn get_tranche(&self, tranche_id: &str) -> DbResult<Option<InstallmentTrancheRecord>> {
        self.inner.get_tranche(tranche_id).await
    }

    async fn list_due_tranches(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<DueTranche>> {
        self.inner.list_due_tranches(now, limit).await
    }

    async fn claim_tranche(&self, tranche_id: &str) -> DbResult<bool> {
        self.inner.claim_tranche(tranche_id).await
    }

    async fn set_tranche_order(&self, tranche_id: &str, order_id: &str) -> DbResult<()> {
        self.inner.set_tranche_order(tranche_id, order_id).await
    }

    async fn release_tranche(&self, tranche_id: &str) -> DbResult<()> {
        self.inner.release_tranche(tranche_id).await
    }

    async fn finish_tranche(
        &self,
        tranche_id: &str,
        order_id: &str,
        outcome: &str,
    ) -> DbResult<bool> {
        self.inner.finish_tranche(tranche_id, order_id, outcome).await
    }
}
