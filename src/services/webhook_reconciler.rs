//! Webhook Reconciler
//!
//! Single entry point for provider webhooks: verifies authenticity, ledgers
//! every event exactly once, and applies the reported outcome to the order
//! and refund rows through the same conditional-update path every other
//! writer uses.

use crate::database::error::DatabaseError;
use crate::database::models::{
    refund_status, tranche_status, NewOrphanEvent, NewWebhookEvent, OrderTransition,
    PaymentOrderRecord, RefundRecord, RefundResolution,
};
use crate::database::store::{OrderStore, WebhookApplyOutcome};
use crate::gateways::{
    GatewayName, GatewayPaymentStatus, GatewayRefundOutcome, GatewayRegistry, WebhookKind,
};
use crate::services::notification::{NotificationKind, NotificationSink};
use crate::services::payment_orchestrator::OrderStatus;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("Unknown gateway: {0}")]
    UnknownGateway(String),
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
    #[error("Conflict applying event to order {order_id}")]
    Conflict { order_id: String },
    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
}

/// Outcome of handling one webhook delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconciliationResult {
    /// Ledgered, and the reported outcome applied (or confirmed already
    /// current)
    Applied,
    /// This `(gateway, eventId)` was already ledgered; nothing changed
    AlreadyProcessed,
    /// Event type this service does not track; acknowledged, no mutation
    Ignored,
    /// Verified payload referencing no known order or refund; recorded for
    /// operator review
    UnknownOrder,
    /// Ledgered without touching the order: the reported transition is not
    /// valid from the order's current state
    Stale,
}

/// What to do with a payment event against the order as last read.
enum PaymentPlan {
    Apply(OrderTransition, OrderStatus),
    /// The event carries no state change (informational, or the order is
    /// already where it reports). Ledger and acknowledge.
    LedgerOnly,
    /// The order's current state cannot accept this report. Ledger it so
    /// redeliveries stay cheap, touch nothing.
    LedgerStale,
}

/// Everything about a delivery that outlives the per-kind dispatch.
struct EventEnvelope<'a> {
    gateway: &'a GatewayName,
    event_id: String,
    payload: JsonValue,
    received_at: DateTime<Utc>,
}

impl EventEnvelope<'_> {
    fn ledger_row(&self, order_id: Option<String>, kind: &str) -> NewWebhookEvent {
        NewWebhookEvent {
            gateway_name: self.gateway.to_string(),
            event_id: self.event_id.clone(),
            order_id,
            kind: kind.to_string(),
            payload: self.payload.clone(),
            received_at: self.received_at,
        }
    }

    fn orphan_row(&self, gateway_order_ref: String) -> NewOrphanEvent {
        NewOrphanEvent {
            gateway_name: self.gateway.to_string(),
            event_id: Some(self.event_id.clone()),
            gateway_order_ref,
            payload: self.payload.clone(),
            received_at: self.received_at,
        }
    }
}

pub struct WebhookReconciler {
    store: Arc<dyn OrderStore>,
    registry: Arc<GatewayRegistry>,
    notifier: Arc<dyn NotificationSink>,
}

impl WebhookReconciler {
    pub fn new(
        store: Arc<dyn OrderStore>,
        registry: Arc<GatewayRegistry>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            registry,
            notifier,
        }
    }

    /// Handle one raw webhook delivery.
    ///
    /// Never mutates anything before the signature verifies, and applies the
    /// ledger entry and the order/refund update in one atomic store
    /// operation. A lost write race is retried once against a fresh read,
    /// then surfaced as [`ReconcilerError::Conflict`] so the provider
    /// redelivers.
    pub async fn handle(
        &self,
        gateway: &str,
        body: &[u8],
        signature: Option<&str>,
        timestamp: Option<&str>,
    ) -> Result<ReconciliationResult, ReconcilerError> {
        let name = GatewayName::new(gateway);
        let client = self
            .registry
            .get(&name)
            .ok_or_else(|| ReconcilerError::UnknownGateway(gateway.to_string()))?;

        let check = client.verify_signature(body, signature, timestamp);
        if !check.valid {
            let reason = check
                .reason
                .unwrap_or_else(|| "signature mismatch".to_string());
            error!(gateway = %name, reason = %reason, "webhook signature rejected");
            return Err(ReconcilerError::InvalidSignature(reason));
        }

        let webhook = client
            .parse_webhook(body)
            .map_err(|e| ReconcilerError::MalformedPayload(e.to_string()))?;
        let env = EventEnvelope {
            gateway: &name,
            event_id: webhook
                .event_id
                .unwrap_or_else(|| payload_fingerprint(body)),
            payload: webhook.payload,
            received_at: webhook.received_at,
        };

        match webhook.kind {
            WebhookKind::Unrecognized { event_type } => {
                info!(gateway = %name, event_type = %event_type, "ignoring untracked webhook event");
                Ok(ReconciliationResult::Ignored)
            }
            WebhookKind::Payment {
                gateway_order_ref,
                status,
                reason,
                gateway_payment_ref,
            } => {
                self.handle_payment(env, gateway_order_ref, status, reason, gateway_payment_ref)
                    .await
            }
            WebhookKind::Refund {
                gateway_refund_ref,
                gateway_order_ref,
                outcome,
            } => {
                self.handle_refund(env, gateway_refund_ref, gateway_order_ref, outcome)
                    .await
            }
        }
    }

    // =========================================================================
    // Payment Events
    // =========================================================================

    async fn handle_payment(
        &self,
        env: EventEnvelope<'_>,
        gateway_order_ref: String,
        status: GatewayPaymentStatus,
        reason: Option<String>,
        gateway_payment_ref: Option<String>,
    ) -> Result<ReconciliationResult, ReconcilerError> {
        let found = self
            .store
            .find_order_by_gateway_ref(env.gateway.as_str(), &gateway_order_ref)
            .await?;
        let Some(mut order) = found else {
            warn!(
                gateway = %env.gateway,
                gateway_order_ref = %gateway_order_ref,
                event_id = %env.event_id,
                "webhook references an unknown order, recording orphan"
            );
            self.store
                .record_orphan_event(env.orphan_row(gateway_order_ref))
                .await?;
            return Ok(ReconciliationResult::UnknownOrder);
        };

        // One internal retry when a concurrent writer wins the conditional
        // update while the event is still applicable.
        for pass in 0..2 {
            if pass > 0 {
                order = match self.store.get_order(&order.id).await? {
                    Some(current) => current,
                    None => return Ok(ReconciliationResult::UnknownOrder),
                };
            }

            let plan = payment_plan(
                &env,
                &order,
                status,
                reason.as_deref(),
                &gateway_order_ref,
                gateway_payment_ref.as_deref(),
            );
            let (transition, target) = match plan {
                PaymentPlan::Apply(t, target) => (Some(t), Some(target)),
                PaymentPlan::LedgerOnly => (None, None),
                PaymentPlan::LedgerStale => {
                    let outcome = self
                        .store
                        .apply_webhook_event(
                            env.ledger_row(Some(order.id.clone()), "payment"),
                            None,
                            None,
                        )
                        .await?;
                    if matches!(outcome, WebhookApplyOutcome::AlreadyProcessed) {
                        return Ok(ReconciliationResult::AlreadyProcessed);
                    }
                    warn!(
                        order_id = %order.id,
                        current_status = %order.status,
                        reported = %status,
                        event_id = %env.event_id,
                        "stale webhook report rejected, order untouched"
                    );
                    return Ok(ReconciliationResult::Stale);
                }
            };

            let event = env.ledger_row(Some(order.id.clone()), "payment");
            match self.store.apply_webhook_event(event, transition, None).await? {
                WebhookApplyOutcome::Applied(updated) => {
                    let updated = updated.unwrap_or_else(|| order.clone());
                    if let Some(target) = target {
                        self.finish_payment(&updated, target, reason.as_deref()).await;
                    }
                    return Ok(ReconciliationResult::Applied);
                }
                WebhookApplyOutcome::AlreadyProcessed => {
                    info!(event_id = %env.event_id, gateway = %env.gateway, "webhook already processed");
                    return Ok(ReconciliationResult::AlreadyProcessed);
                }
                WebhookApplyOutcome::Stale => {
                    warn!(
                        order_id = %order.id,
                        reported = %status,
                        event_id = %env.event_id,
                        "order moved past the reported state, event ledgered only"
                    );
                    return Ok(ReconciliationResult::Stale);
                }
                WebhookApplyOutcome::Conflict => continue,
            }
        }

        Err(ReconcilerError::Conflict { order_id: order.id })
    }

    /// Side effects after a payment transition actually applied. Failures
    /// here are logged, never propagated into the webhook response.
    async fn finish_payment(
        &self,
        order: &PaymentOrderRecord,
        target: OrderStatus,
        reason: Option<&str>,
    ) {
        match target {
            OrderStatus::Succeeded => {
                info!(order_id = %order.id, "order confirmed paid by webhook");
                self.notifier
                    .notify(NotificationKind::OrderSucceeded, order, "payment confirmed")
                    .await;
                if let Some(tranche_id) = &order.tranche_id {
                    self.settle_tranche(tranche_id, &order.id).await;
                }
            }
            OrderStatus::HardFailed => {
                let reason = reason.unwrap_or("gateway reported failure");
                warn!(order_id = %order.id, reason = %reason, "order failed permanently per webhook");
                self.notifier
                    .notify(NotificationKind::OrderFailed, order, reason)
                    .await;
                if let Some(tranche_id) = &order.tranche_id {
                    self.suspend_tranche(tranche_id, &order.id).await;
                }
            }
            _ => {
                warn!(
                    order_id = %order.id,
                    status = %order.status,
                    "order failed transiently per webhook, scheduler will retry"
                );
            }
        }
    }

    // =========================================================================
    // Refund Events
    // =========================================================================

    async fn handle_refund(
        &self,
        env: EventEnvelope<'_>,
        gateway_refund_ref: String,
        gateway_order_ref: String,
        outcome: GatewayRefundOutcome,
    ) -> Result<ReconciliationResult, ReconcilerError> {
        let Some(mut refund) = self
            .store
            .find_refund_by_gateway_ref(&gateway_refund_ref)
            .await?
        else {
            warn!(
                gateway = %env.gateway,
                gateway_refund_ref = %gateway_refund_ref,
                event_id = %env.event_id,
                "refund webhook references an unknown refund, recording orphan"
            );
            self.store
                .record_orphan_event(env.orphan_row(gateway_order_ref))
                .await?;
            return Ok(ReconciliationResult::UnknownOrder);
        };

        for pass in 0..2 {
            if pass > 0 {
                refund = match self.store.get_refund(&refund.id).await? {
                    Some(current) => current,
                    None => return Ok(ReconciliationResult::UnknownOrder),
                };
            }

            let Some(order) = self.store.get_order(&refund.order_id).await? else {
                warn!(refund_id = %refund.id, order_id = %refund.order_id, "refund points at a missing order");
                return Ok(ReconciliationResult::UnknownOrder);
            };

            if !refund_status::is_open(&refund.status) {
                // A terminal report redelivered under a fresh event id.
                let applied = self
                    .store
                    .apply_webhook_event(
                        env.ledger_row(Some(order.id.clone()), "refund"),
                        None,
                        None,
                    )
                    .await?;
                if matches!(applied, WebhookApplyOutcome::AlreadyProcessed) {
                    return Ok(ReconciliationResult::AlreadyProcessed);
                }
                warn!(
                    refund_id = %refund.id,
                    status = %refund.status,
                    event_id = %env.event_id,
                    "refund already resolved, event ledgered only"
                );
                return Ok(ReconciliationResult::Stale);
            }

            let (resolution, transition, kind, message) =
                refund_plan(&env, &order, &refund, outcome, &gateway_refund_ref);

            let event = env.ledger_row(Some(order.id.clone()), "refund");
            match self
                .store
                .apply_webhook_event(event, Some(transition), Some(resolution))
                .await?
            {
                WebhookApplyOutcome::Applied(updated) => {
                    let updated = updated.unwrap_or(order);
                    info!(
                        refund_id = %refund.id,
                        order_id = %updated.id,
                        outcome = ?outcome,
                        "refund resolved by webhook"
                    );
                    self.notifier.notify(kind, &updated, &message).await;
                    return Ok(ReconciliationResult::Applied);
                }
                WebhookApplyOutcome::AlreadyProcessed => {
                    info!(event_id = %env.event_id, gateway = %env.gateway, "webhook already processed");
                    return Ok(ReconciliationResult::AlreadyProcessed);
                }
                WebhookApplyOutcome::Stale => {
                    warn!(
                        refund_id = %refund.id,
                        order_id = %order.id,
                        event_id = %env.event_id,
                        "order moved past refund_requested, event ledgered only"
                    );
                    return Ok(ReconciliationResult::Stale);
                }
                WebhookApplyOutcome::Conflict => continue,
            }
        }

        Err(ReconcilerError::Conflict {
            order_id: refund.order_id,
        })
    }

    // =========================================================================
    // Tranche Bookkeeping
    // =========================================================================

    async fn settle_tranche(&self, tranche_id: &str, order_id: &str) {
        match self
            .store
            .finish_tranche(tranche_id, order_id, tranche_status::PAID)
            .await
        {
            Ok(true) => info!(tranche_id = %tranche_id, order_id = %order_id, "tranche paid"),
            Ok(false) => {
                warn!(tranche_id = %tranche_id, order_id = %order_id, "tranche pairing no longer current, not updated")
            }
            Err(e) => error!(tranche_id = %tranche_id, error = %e, "failed to mark tranche paid"),
        }
    }

    async fn suspend_tranche(&self, tranche_id: &str, order_id: &str) {
        match self
            .store
            .finish_tranche(tranche_id, order_id, tranche_status::SUSPENDED)
            .await
        {
            Ok(true) => {
                warn!(tranche_id = %tranche_id, order_id = %order_id, "tranche suspended after terminal failure")
            }
            Ok(false) => {}
            Err(e) => error!(tranche_id = %tranche_id, error = %e, "failed to suspend tranche"),
        }
    }
}

/// Decide what a payment event means for the order as currently read.
///
/// Payment reports only ever drive orders out of `pending`; anything else is
/// either already-current (ledger and acknowledge) or an out-of-order
/// delivery (ledger and reject).
fn payment_plan(
    env: &EventEnvelope<'_>,
    order: &PaymentOrderRecord,
    status: GatewayPaymentStatus,
    reason: Option<&str>,
    gateway_order_ref: &str,
    gateway_payment_ref: Option<&str>,
) -> PaymentPlan {
    let target = match status {
        GatewayPaymentStatus::Paid => OrderStatus::Succeeded,
        GatewayPaymentStatus::TransientFailure => OrderStatus::TransientFailed,
        GatewayPaymentStatus::HardFailure => OrderStatus::HardFailed,
        // Authorization/created notices carry no settlement outcome.
        GatewayPaymentStatus::Pending => return PaymentPlan::LedgerOnly,
    };

    if order.status != OrderStatus::Pending.to_db_status() {
        if order.status == target.to_db_status() {
            return PaymentPlan::LedgerOnly;
        }
        return PaymentPlan::LedgerStale;
    }

    let mut t = OrderTransition::new(
        &order.id,
        &order.status,
        order.attempt,
        target.to_db_status(),
    );
    match target {
        OrderStatus::Succeeded => {
            t.patch.gateway_payment_ref = gateway_payment_ref.map(str::to_string);
            // Credit the attempt that actually captured the money, which may
            // not be the order's newest one.
            if order.gateway_name.as_deref() != Some(env.gateway.as_str())
                || order.gateway_order_ref.as_deref() != Some(gateway_order_ref)
            {
                t.patch.gateway_name = Some(env.gateway.to_string());
                t.patch.gateway_order_ref = Some(gateway_order_ref.to_string());
            }
        }
        _ => {
            t.patch.failure_reason =
                Some(reason.unwrap_or("gateway reported failure").to_string());
        }
    }
    t.history_entry = Some(json!({
        "attempt": order.attempt,
        "outcome": target.to_db_status(),
        "source": "webhook",
        "event_id": env.event_id,
        "at": Utc::now().to_rfc3339(),
    }));

    PaymentPlan::Apply(t, target)
}

/// Build the paired refund resolution and order transition for a refund
/// report against an open refund.
fn refund_plan(
    env: &EventEnvelope<'_>,
    order: &PaymentOrderRecord,
    refund: &RefundRecord,
    outcome: GatewayRefundOutcome,
    gateway_refund_ref: &str,
) -> (RefundResolution, OrderTransition, NotificationKind, String) {
    match outcome {
        GatewayRefundOutcome::Confirmed => {
            let refunded_total = order.refunded_minor + refund.amount_minor;
            let target = if refunded_total >= order.amount_minor {
                OrderStatus::Refunded
            } else {
                // Partial refund: release the order for further requests.
                OrderStatus::Succeeded
            };

            let resolution = RefundResolution {
                refund_id: refund.id.clone(),
                new_status: refund_status::CONFIRMED.to_string(),
                gateway_refund_ref: Some(gateway_refund_ref.to_string()),
                failure_reason: None,
            };

            let mut t = OrderTransition::new(
                &order.id,
                &order.status,
                order.attempt,
                target.to_db_status(),
            );
            t.patch.add_refunded_minor = Some(refund.amount_minor);
            t.history_entry = Some(json!({
                "attempt": order.attempt,
                "outcome": "refund_confirmed",
                "refund_id": refund.id,
                "amount_minor": refund.amount_minor,
                "event_id": env.event_id,
                "at": Utc::now().to_rfc3339(),
            }));

            let message = format!(
                "refund of {} {} confirmed",
                refund.amount_minor, order.currency
            );
            (resolution, t, NotificationKind::RefundConfirmed, message)
        }
        GatewayRefundOutcome::Failed => {
            let resolution = RefundResolution {
                refund_id: refund.id.clone(),
                new_status: refund_status::FAILED.to_string(),
                gateway_refund_ref: Some(gateway_refund_ref.to_string()),
                failure_reason: Some("gateway reported refund failure".to_string()),
            };

            let mut t = OrderTransition::new(
                &order.id,
                &order.status,
                order.attempt,
                OrderStatus::Succeeded.to_db_status(),
            );
            t.history_entry = Some(json!({
                "attempt": order.attempt,
                "outcome": "refund_failed",
                "refund_id": refund.id,
                "event_id": env.event_id,
                "at": Utc::now().to_rfc3339(),
            }));

            let message = "refund could not be completed, the order remains paid".to_string();
            (resolution, t, NotificationKind::RefundFailed, message)
        }
    }
}

/// Ledger key for providers that send no event id: a hash of the raw body,
/// so byte-identical redeliveries dedupe.
fn payload_fingerprint(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn order(status: &str) -> PaymentOrderRecord {
        let now = Utc::now();
        PaymentOrderRecord {
            id: "ord-1".to_string(),
            payer_id: "payer-1".to_string(),
            subject_ref: "course-101".to_string(),
            amount_minor: 500_000,
            currency: "INR".to_string(),
            status: status.to_string(),
            preferred_gateway: None,
            gateway_name: Some("razorpay".to_string()),
            gateway_order_ref: Some("order_abc".to_string()),
            gateway_payment_ref: None,
            checkout_token: None,
            instrument_ref: None,
            attempt: 1,
            refunded_minor: 0,
            failure_reason: None,
            tranche_id: None,
            attempt_history: json!([]),
            metadata: json!({}),
            created_at: now,
            updated_at: now,
            last_transition_at: now,
            completed_at: None,
        }
    }

    fn envelope(gateway: &GatewayName) -> EventEnvelope<'_> {
        EventEnvelope {
            gateway,
            event_id: "evt-1".to_string(),
            payload: json!({}),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn fingerprint_is_stable_and_distinct() {
        let a = payload_fingerprint(b"{\"event\":\"payment.captured\"}");
        let b = payload_fingerprint(b"{\"event\":\"payment.captured\"}");
        let c = payload_fingerprint(b"{\"event\":\"payment.failed\"}");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("sha256:"));
    }

    #[test]
    fn paid_report_against_pending_builds_a_success_transition() {
        let gateway = GatewayName::new("razorpay");
        let env = envelope(&gateway);
        let plan = payment_plan(
            &env,
            &order("pending"),
            GatewayPaymentStatus::Paid,
            None,
            "order_abc",
            Some("pay_xyz"),
        );
        match plan {
            PaymentPlan::Apply(t, target) => {
                assert_eq!(target, OrderStatus::Succeeded);
                assert_eq!(t.new_status, "succeeded");
                assert!(!t.increment_attempt);
                assert_eq!(t.patch.gateway_payment_ref.as_deref(), Some("pay_xyz"));
                // Refs already current, so no re-pointing patch.
                assert!(t.patch.gateway_name.is_none());
            }
            _ => panic!("expected an apply plan"),
        }
    }

    #[test]
    fn paid_report_for_a_superseded_attempt_repoints_the_order() {
        let gateway = GatewayName::new("razorpay");
        let env = envelope(&gateway);
        let mut o = order("pending");
        o.gateway_order_ref = Some("order_new".to_string());
        let plan = payment_plan(&env, &o, GatewayPaymentStatus::Paid, None, "order_abc", None);
        match plan {
            PaymentPlan::Apply(t, _) => {
                assert_eq!(t.patch.gateway_order_ref.as_deref(), Some("order_abc"));
                assert_eq!(t.patch.gateway_name.as_deref(), Some("razorpay"));
            }
            _ => panic!("expected an apply plan"),
        }
    }

    #[test]
    fn settled_order_ledgers_stale_failure_reports() {
        let gateway = GatewayName::new("razorpay");
        let env = envelope(&gateway);
        let plan = payment_plan(
            &env,
            &order("succeeded"),
            GatewayPaymentStatus::HardFailure,
            Some("late decline"),
            "order_abc",
            None,
        );
        assert!(matches!(plan, PaymentPlan::LedgerStale));

        // A duplicate "paid" for an already-settled order is merely current.
        let plan = payment_plan(
            &env,
            &order("succeeded"),
            GatewayPaymentStatus::Paid,
            None,
            "order_abc",
            None,
        );
        assert!(matches!(plan, PaymentPlan::LedgerOnly));
    }

    #[test]
    fn partial_refund_releases_back_to_succeeded() {
        let gateway = GatewayName::new("razorpay");
        let env = envelope(&gateway);
        let o = order("refund_requested");
        let refund = RefundRecord {
            id: "rf-1".to_string(),
            order_id: "ord-1".to_string(),
            amount_minor: 200_000,
            status: refund_status::SUBMITTED.to_string(),
            gateway_refund_ref: Some("rfnd_1".to_string()),
            provider_status: Some("processed".to_string()),
            reason: None,
            failure_reason: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            resolved_at: None,
        };

        let (resolution, t, kind, _) = refund_plan(
            &env,
            &o,
            &refund,
            GatewayRefundOutcome::Confirmed,
            "rfnd_1",
        );
        assert_eq!(resolution.new_status, refund_status::CONFIRMED);
        assert_eq!(t.new_status, "succeeded");
        assert_eq!(t.patch.add_refunded_minor, Some(200_000));
        assert_eq!(kind, NotificationKind::RefundConfirmed);

        // A full-amount refund parks the order in refunded.
        let full = RefundRecord {
            amount_minor: 500_000,
            ..refund
        };
        let (_, t, _, _) = refund_plan(&env, &o, &full, GatewayRefundOutcome::Confirmed, "rfnd_1");
        assert_eq!(t.new_status, "refunded");
    }

    #[test]
    fn failed_refund_releases_the_order_without_crediting() {
        let gateway = GatewayName::new("razorpay");
        let env = envelope(&gateway);
        let o = order("refund_requested");
        let refund = RefundRecord {
            id: "rf-1".to_string(),
            order_id: "ord-1".to_string(),
            amount_minor: 200_000,
            status: refund_status::SUBMITTED.to_string(),
            gateway_refund_ref: Some("rfnd_1".to_string()),
            provider_status: None,
            reason: None,
            failure_reason: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            resolved_at: None,
        };

        let (resolution, t, kind, _) =
            refund_plan(&env, &o, &refund, GatewayRefundOutcome::Failed, "rfnd_1");
        assert_eq!(resolution.new_status, refund_status::FAILED);
        assert_eq!(t.new_status, "succeeded");
        assert_eq!(t.patch.add_refunded_minor, None);
        assert_eq!(kind, NotificationKind::RefundFailed);
    }
}
