//! In-memory [`OrderStore`] for `SKIP_DB` runs and tests.
//!
//! Behaves like the Postgres store down to the conditional-update outcomes:
//! every check happens before any mutation, so a reported conflict leaves
//! the store untouched exactly as a rolled-back transaction would.

use crate::database::error::{DatabaseError, DatabaseErrorKind, DbResult};
use crate::database::models::{
    plan_status, refund_status, tranche_status, DueTranche, InstallmentPlanRecord,
    InstallmentTrancheRecord, NewInstallmentPlan, NewOrder, NewOrphanEvent, NewRefund,
    NewWebhookEvent, OrderTransition, OrphanEventRecord, PaymentOrderRecord, RefundRecord,
    RefundResolution, WebhookEventRecord,
};
use crate::database::store::{OrderStore, WebhookApplyOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    orders: HashMap<String, PaymentOrderRecord>,
    webhook_events: HashMap<(String, String), WebhookEventRecord>,
    orphan_events: Vec<OrphanEventRecord>,
    refunds: HashMap<String, RefundRecord>,
    plans: HashMap<String, InstallmentPlanRecord>,
    tranches: HashMap<String, InstallmentTrancheRecord>,
}

#[derive(Default)]
pub struct MemoryOrderStore {
    inner: RwLock<Inner>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ledgered webhook events, for diagnostics.
    pub async fn webhook_event_count(&self) -> usize {
        self.inner.read().await.webhook_events.len()
    }

    /// Recorded orphan events, newest last.
    pub async fn orphan_events(&self) -> Vec<OrphanEventRecord> {
        self.inner.read().await.orphan_events.clone()
    }
}

fn duplicate_key(constraint: &str) -> DatabaseError {
    DatabaseError::new(DatabaseErrorKind::Conflict {
        constraint: constraint.to_string(),
    })
}

fn matches_expectation(order: &PaymentOrderRecord, t: &OrderTransition) -> bool {
    order.status == t.expected_status && order.attempt == t.expected_attempt
}

fn apply_to(order: &mut PaymentOrderRecord, t: &OrderTransition, now: DateTime<Utc>) {
    order.status = t.new_status.clone();
    if t.new_status == "succeeded" && order.completed_at.is_none() {
        order.completed_at = Some(now);
    }
    if t.increment_attempt {
        order.attempt += 1;
    }
    if let Some(v) = &t.patch.gateway_name {
        order.gateway_name = Some(v.clone());
    }
    if let Some(v) = &t.patch.gateway_order_ref {
        order.gateway_order_ref = Some(v.clone());
    }
    if let Some(v) = &t.patch.gateway_payment_ref {
        order.gateway_payment_ref = Some(v.clone());
    }
    if let Some(v) = &t.patch.checkout_token {
        order.checkout_token = Some(v.clone());
    }
    if let Some(v) = &t.patch.failure_reason {
        order.failure_reason = Some(v.clone());
    }
    if let Some(add) = t.patch.add_refunded_minor {
        order.refunded_minor += add;
    }
    if let Some(entry) = &t.history_entry {
        if let Some(history) = order.attempt_history.as_array_mut() {
            history.push(entry.clone());
        }
    }
    order.updated_at = now;
    order.last_transition_at = now;
}

fn history_contains(history: &JsonValue, gateway_name: &str, gateway_order_ref: &str) -> bool {
    history
        .as_array()
        .map(|entries| {
            entries.iter().any(|entry| {
                entry.get("gateway").and_then(JsonValue::as_str) == Some(gateway_name)
                    && entry.get("gateway_order_ref").and_then(JsonValue::as_str)
                        == Some(gateway_order_ref)
            })
        })
        .unwrap_or(false)
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn insert_order(&self, order: NewOrder) -> DbResult<PaymentOrderRecord> {
        let mut inner = self.inner.write().await;
        if inner.orders.contains_key(&order.id) {
            return Err(duplicate_key("payment_orders_pkey"));
        }

        let now = Utc::now();
        let record = PaymentOrderRecord {
            id: order.id.clone(),
            payer_id: order.payer_id,
            subject_ref: order.subject_ref,
            amount_minor: order.amount_minor,
            currency: order.currency,
            status: "pending".to_string(),
            preferred_gateway: order.preferred_gateway,
            gateway_name: None,
            gateway_order_ref: None,
            gateway_payment_ref: None,
            checkout_token: None,
            instrument_ref: order.instrument_ref,
            attempt: 0,
            refunded_minor: 0,
            failure_reason: None,
            tranche_id: order.tranche_id,
            attempt_history: json!([]),
            metadata: order.metadata,
            created_at: now,
            updated_at: now,
            last_transition_at: now,
            completed_at: None,
        };
        inner.orders.insert(order.id, record.clone());
        Ok(record)
    }

    async fn get_order(&self, order_id: &str) -> DbResult<Option<PaymentOrderRecord>> {
        Ok(self.inner.read().await.orders.get(order_id).cloned())
    }

    async fn find_order_by_gateway_ref(
        &self,
        gateway_name: &str,
        gateway_order_ref: &str,
    ) -> DbResult<Option<PaymentOrderRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .orders
            .values()
            .find(|o| {
                (o.gateway_name.as_deref() == Some(gateway_name)
                    && o.gateway_order_ref.as_deref() == Some(gateway_order_ref))
                    || history_contains(&o.attempt_history, gateway_name, gateway_order_ref)
            })
            .cloned())
    }

    async fn transition_order(
        &self,
        transition: OrderTransition,
    ) -> DbResult<Option<PaymentOrderRecord>> {
        let mut inner = self.inner.write().await;
        let applies = inner
            .orders
            .get(&transition.order_id)
            .map(|o| matches_expectation(o, &transition))
            .unwrap_or(false);
        if !applies {
            return Ok(None);
        }

        let now = Utc::now();
        let order = inner
            .orders
            .get_mut(&transition.order_id)
            .ok_or_else(|| DatabaseError::new(DatabaseErrorKind::NotFound))?;
        apply_to(order, &transition, now);
        Ok(Some(order.clone()))
    }

    async fn list_retry_candidates(&self, limit: i64) -> DbResult<Vec<PaymentOrderRecord>> {
        let inner = self.inner.read().await;
        let mut candidates: Vec<PaymentOrderRecord> = inner
            .orders
            .values()
            .filter(|o| o.status == "transient_failed")
            .cloned()
            .collect();
        candidates.sort_by_key(|o| o.last_transition_at);
        candidates.truncate(limit.max(0) as usize);
        Ok(candidates)
    }

    async fn apply_webhook_event(
        &self,
        event: NewWebhookEvent,
        transition: Option<OrderTransition>,
        refund: Option<RefundResolution>,
    ) -> DbResult<WebhookApplyOutcome> {
        let mut inner = self.inner.write().await;
        let key = (event.gateway_name.clone(), event.event_id.clone());
        if inner.webhook_events.contains_key(&key) {
            return Ok(WebhookApplyOutcome::AlreadyProcessed);
        }

        let ledger_row = WebhookEventRecord {
            gateway_name: event.gateway_name,
            event_id: event.event_id,
            order_id: event.order_id,
            kind: event.kind,
            payload: event.payload,
            received_at: event.received_at,
        };

        // Evaluate every condition before mutating anything; a conflict must
        // leave the store exactly as a rolled-back transaction would.
        if let Some(t) = &transition {
            match inner.orders.get(&t.order_id) {
                Some(o) if matches_expectation(o, t) => {}
                Some(o) if o.status == t.expected_status => {
                    return Ok(WebhookApplyOutcome::Conflict);
                }
                _ => {
                    inner.webhook_events.insert(key, ledger_row);
                    return Ok(WebhookApplyOutcome::Stale);
                }
            }
        }

        if let Some(r) = &refund {
            let open = inner
                .refunds
                .get(&r.refund_id)
                .map(|f| refund_status::is_open(&f.status))
                .unwrap_or(false);
            if !open {
                return Ok(WebhookApplyOutcome::Conflict);
            }
        }

        inner.webhook_events.insert(key, ledger_row);

        let now = Utc::now();
        let mut updated_order = None;
        if let Some(t) = &transition {
            let order = inner
                .orders
                .get_mut(&t.order_id)
                .ok_or_else(|| DatabaseError::new(DatabaseErrorKind::NotFound))?;
            apply_to(order, t, now);
            updated_order = Some(order.clone());
        }

        if let Some(r) = &refund {
            let row = inner
                .refunds
                .get_mut(&r.refund_id)
                .ok_or_else(|| DatabaseError::new(DatabaseErrorKind::NotFound))?;
            row.status = r.new_status.clone();
            if let Some(v) = &r.gateway_refund_ref {
                row.gateway_refund_ref = Some(v.clone());
            }
            if let Some(v) = &r.failure_reason {
                row.failure_reason = Some(v.clone());
            }
            row.resolved_at = Some(now);
            row.updated_at = now;
        }

        Ok(WebhookApplyOutcome::Applied(updated_order))
    }

    async fn record_orphan_event(&self, event: NewOrphanEvent) -> DbResult<()> {
        let mut inner = self.inner.write().await;
        inner.orphan_events.push(OrphanEventRecord {
            id: Uuid::new_v4().to_string(),
            gateway_name: event.gateway_name,
            event_id: event.event_id,
            gateway_order_ref: event.gateway_order_ref,
            payload: event.payload,
            received_at: event.received_at,
        });
        Ok(())
    }

    async fn insert_refund(&self, refund: NewRefund) -> DbResult<RefundRecord> {
        let mut inner = self.inner.write().await;
        if inner.refunds.contains_key(&refund.id) {
            return Err(duplicate_key("refund_requests_pkey"));
        }

        let now = Utc::now();
        let record = RefundRecord {
            id: refund.id.clone(),
            order_id: refund.order_id,
            amount_minor: refund.amount_minor,
            status: refund_status::REQUESTED.to_string(),
            gateway_refund_ref: None,
            provider_status: None,
            reason: refund.reason,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        };
        inner.refunds.insert(refund.id, record.clone());
        Ok(record)
    }

    async fn get_refund(&self, refund_id: &str) -> DbResult<Option<RefundRecord>> {
        Ok(self.inner.read().await.refunds.get(refund_id).cloned())
    }

    async fn find_refund_by_gateway_ref(
        &self,
        gateway_refund_ref: &str,
    ) -> DbResult<Option<RefundRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .refunds
            .values()
            .find(|r| r.gateway_refund_ref.as_deref() == Some(gateway_refund_ref))
            .cloned())
    }

    async fn find_open_refund_for_order(&self, order_id: &str) -> DbResult<Option<RefundRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .refunds
            .values()
            .filter(|r| r.order_id == order_id && refund_status::is_open(&r.status))
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn set_refund_submission(
        &self,
        refund_id: &str,
        gateway_refund_ref: &str,
        provider_status: &str,
    ) -> DbResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(row) = inner.refunds.get_mut(refund_id) {
            if row.status == refund_status::REQUESTED {
                row.status = refund_status::SUBMITTED.to_string();
                row.gateway_refund_ref = Some(gateway_refund_ref.to_string());
                row.provider_status = Some(provider_status.to_string());
                row.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn resolve_refund(
        &self,
        resolution: RefundResolution,
        order_transition: Option<OrderTransition>,
    ) -> DbResult<Option<RefundRecord>> {
        let mut inner = self.inner.write().await;

        let open = inner
            .refunds
            .get(&resolution.refund_id)
            .map(|r| refund_status::is_open(&r.status))
            .unwrap_or(false);
        if !open {
            return Ok(None);
        }

        if let Some(t) = &order_transition {
            let applies = inner
                .orders
                .get(&t.order_id)
                .map(|o| matches_expectation(o, t))
                .unwrap_or(false);
            if !applies {
                return Ok(None);
            }
        }

        let now = Utc::now();
        let refund = {
            let row = inner
                .refunds
                .get_mut(&resolution.refund_id)
                .ok_or_else(|| DatabaseError::new(DatabaseErrorKind::NotFound))?;
            row.status = resolution.new_status.clone();
            if let Some(v) = &resolution.gateway_refund_ref {
                row.gateway_refund_ref = Some(v.clone());
            }
            if let Some(v) = &resolution.failure_reason {
                row.failure_reason = Some(v.clone());
            }
            row.resolved_at = Some(now);
            row.updated_at = now;
            row.clone()
        };

        if let Some(t) = &order_transition {
            let order = inner
                .orders
                .get_mut(&t.order_id)
                .ok_or_else(|| DatabaseError::new(DatabaseErrorKind::NotFound))?;
            apply_to(order, t, now);
        }

        Ok(Some(refund))
    }

    async fn insert_plan(
        &self,
        plan: NewInstallmentPlan,
    ) -> DbResult<(InstallmentPlanRecord, Vec<InstallmentTrancheRecord>)> {
        let mut inner = self.inner.write().await;
        if inner.plans.contains_key(&plan.id) {
            return Err(duplicate_key("installment_plans_pkey"));
        }

        let now = Utc::now();
        let plan_row = InstallmentPlanRecord {
            id: plan.id.clone(),
            payer_id: plan.payer_id,
            subject_ref: plan.subject_ref,
            currency: plan.currency,
            total_amount_minor: plan.tranches.iter().map(|t| t.amount_minor).sum(),
            installment_count: plan.tranches.len() as i32,
            auto_debit: plan.auto_debit,
            instrument_ref: plan.instrument_ref,
            status: plan_status::ACTIVE.to_string(),
            created_at: now,
            updated_at: now,
        };

        let mut tranche_rows = Vec::with_capacity(plan.tranches.len());
        for tranche in plan.tranches {
            let row = InstallmentTrancheRecord {
                id: tranche.id.clone(),
                plan_id: plan.id.clone(),
                seq: tranche.seq,
                amount_minor: tranche.amount_minor,
                due_at: tranche.due_at,
                status: tranche_status::SCHEDULED.to_string(),
                active_order_id: None,
                created_at: now,
                updated_at: now,
            };
            inner.tranches.insert(tranche.id, row.clone());
            tranche_rows.push(row);
        }
        inner.plans.insert(plan.id, plan_row.clone());

        Ok((plan_row, tranche_rows))
    }

    async fn get_plan(
        &self,
        plan_id: &str,
    ) -> DbResult<Option<(InstallmentPlanRecord, Vec<InstallmentTrancheRecord>)>> {
        let inner = self.inner.read().await;
        let plan = match inner.plans.get(plan_id) {
            Some(plan) => plan.clone(),
            None => return Ok(None),
        };
        let mut tranches: Vec<InstallmentTrancheRecord> = inner
            .tranches
            .values()
            .filter(|t| t.plan_id == plan_id)
            .cloned()
            .collect();
        tranches.sort_by_key(|t| t.seq);
        Ok(Some((plan, tranches)))
    }

    async fn get_tranche(&self, tranche_id: &str) -> DbResult<Option<InstallmentTrancheRecord>> {
        Ok(self.inner.read().await.tranches.get(tranche_id).cloned())
    }

    async fn list_due_tranches(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<DueTranche>> {
        let inner = self.inner.read().await;
        let mut due: Vec<DueTranche> = inner
            .tranches
            .values()
            .filter(|t| t.status == tranche_status::SCHEDULED && t.due_at <= now)
            .filter_map(|t| {
                inner
                    .plans
                    .get(&t.plan_id)
                    .filter(|p| p.auto_debit && p.status == plan_status::ACTIVE)
                    .map(|p| DueTranche {
                        tranche: t.clone(),
                        plan: p.clone(),
                    })
            })
            .collect();
        due.sort_by_key(|d| d.tranche.due_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn claim_tranche(&self, tranche_id: &str) -> DbResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.tranches.get_mut(tranche_id) {
            Some(t) if t.status == tranche_status::SCHEDULED => {
                t.status = tranche_status::PROCESSING.to_string();
                t.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_tranche_order(&self, tranche_id: &str, order_id: &str) -> DbResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(t) = inner.tranches.get_mut(tranche_id) {
            t.active_order_id = Some(order_id.to_string());
            t.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn release_tranche(&self, tranche_id: &str) -> DbResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(t) = inner.tranches.get_mut(tranche_id) {
            if t.status == tranche_status::PROCESSING {
                t.status = tranche_status::SCHEDULED.to_string();
                t.active_order_id = None;
                t.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn finish_tranche(
        &self,
        tranche_id: &str,
        order_id: &str,
        outcome: &str,
    ) -> DbResult<bool> {
        let mut inner = self.inner.write().await;

        let plan_id = match inner.tranches.get_mut(tranche_id) {
            Some(t)
                if t.status == tranche_status::PROCESSING
                    && t.active_order_id.as_deref() == Some(order_id) =>
            {
                t.status = outcome.to_string();
                t.updated_at = Utc::now();
                t.plan_id.clone()
            }
            _ => return Ok(false),
        };

        if outcome == tranche_status::PAID {
            let all_paid = inner
                .tranches
                .values()
                .filter(|t| t.plan_id == plan_id)
                .all(|t| t.status == tranche_status::PAID);
            if all_paid {
                if let Some(plan) = inner.plans.get_mut(&plan_id) {
                    if plan.status == plan_status::ACTIVE {
                        plan.status = plan_status::COMPLETED.to_string();
                        plan.updated_at = Utc::now();
                    }
                }
            }
        }

        Ok(true)
    }
}
