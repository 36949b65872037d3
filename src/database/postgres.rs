//! Postgres-backed [`OrderStore`].
//!
//! All status-changing writes are conditional updates that name the state
//! they expect; a zero-row update is reported to the caller instead of being
//! retried here.

use crate::database::error::{DatabaseError, DbResult};
use crate::database::models::{
    tranche_status, DueTranche, InstallmentPlanRecord, InstallmentTrancheRecord,
    NewInstallmentPlan, NewOrder, NewOrphanEvent, NewRefund, NewWebhookEvent, OrderTransition,
    PaymentOrderRecord, RefundRecord, RefundResolution,
};
use crate::database::store::{OrderStore, WebhookApplyOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn insert_order(&self, order: NewOrder) -> DbResult<PaymentOrderRecord> {
        sqlx::query_as::<_, PaymentOrderRecord>(
            "INSERT INTO payment_orders
             (id, payer_id, subject_ref, amount_minor, currency, preferred_gateway,
              instrument_ref, tranche_id, metadata)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING id, payer_id, subject_ref, amount_minor, currency, status, preferred_gateway,
                       gateway_name, gateway_order_ref, gateway_payment_ref, checkout_token,
                       attempt, refunded_minor, failure_reason, tranche_id, attempt_history,
                       metadata, created_at, updated_at, last_transition_at,
                       instrument_ref, completed_at",
        )
        .bind(&order.id)
        .bind(&order.payer_id)
        .bind(&order.subject_ref)
        .bind(order.amount_minor)
        .bind(&order.currency)
        .bind(&order.preferred_gateway)
        .bind(&order.instrument_ref)
        .bind(&order.tranche_id)
        .bind(&order.metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn get_order(&self, order_id: &str) -> DbResult<Option<PaymentOrderRecord>> {
        sqlx::query_as::<_, PaymentOrderRecord>(
            "SELECT id, payer_id, subject_ref, amount_minor, currency, status, preferred_gateway,
                    gateway_name, gateway_order_ref, gateway_payment_ref, checkout_token,
                    attempt, refunded_minor, failure_reason, tranche_id, attempt_history,
                    metadata, created_at, updated_at, last_transition_at,
                       instrument_ref, completed_at
             FROM payment_orders
             WHERE id = $1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn find_order_by_gateway_ref(
        &self,
        gateway_name: &str,
        gateway_order_ref: &str,
    ) -> DbResult<Option<PaymentOrderRecord>> {
        // The history containment arm catches late webhooks for a superseded
        // attempt, whose ref no longer matches the current columns.
        let history_probe = json!([{
            "gateway": gateway_name,
            "gateway_order_ref": gateway_order_ref,
        }]);

        sqlx::query_as::<_, PaymentOrderRecord>(
            "SELECT id, payer_id, subject_ref, amount_minor, currency, status, preferred_gateway,
                    gateway_name, gateway_order_ref, gateway_payment_ref, checkout_token,
                    attempt, refunded_minor, failure_reason, tranche_id, attempt_history,
                    metadata, created_at, updated_at, last_transition_at,
                       instrument_ref, completed_at
             FROM payment_orders
             WHERE (gateway_name = $1 AND gateway_order_ref = $2)
                OR attempt_history @> $3
             LIMIT 1",
        )
        .bind(gateway_name)
        .bind(gateway_order_ref)
        .bind(history_probe)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn transition_order(
        &self,
        transition: OrderTransition,
    ) -> DbResult<Option<PaymentOrderRecord>> {
        let increment: i32 = if transition.increment_attempt { 1 } else { 0 };
        let history = transition
            .history_entry
            .map(|entry| json!([entry]))
            .unwrap_or_else(|| json!([]));

        sqlx::query_as::<_, PaymentOrderRecord>(
            "UPDATE payment_orders
             SET status = $4,
                 attempt = attempt + $5,
                 gateway_name = COALESCE($6, gateway_name),
                 gateway_order_ref = COALESCE($7, gateway_order_ref),
                 gateway_payment_ref = COALESCE($8, gateway_payment_ref),
                 checkout_token = COALESCE($9, checkout_token),
                 failure_reason = COALESCE($10, failure_reason),
                 refunded_minor = refunded_minor + $11,
                 attempt_history = attempt_history || $12,
                 completed_at = CASE WHEN $4 = 'succeeded'
                                     THEN COALESCE(completed_at, NOW())
                                     ELSE completed_at END,
                 updated_at = NOW(),
                 last_transition_at = NOW()
             WHERE id = $1 AND status = $2 AND attempt = $3
             RETURNING id, payer_id, subject_ref, amount_minor, currency, status, preferred_gateway,
                       gateway_name, gateway_order_ref, gateway_payment_ref, checkout_token,
                       attempt, refunded_minor, failure_reason, tranche_id, attempt_history,
                       metadata, created_at, updated_at, last_transition_at,
                       instrument_ref, completed_at",
        )
        .bind(&transition.order_id)
        .bind(&transition.expected_status)
        .bind(transition.expected_attempt)
        .bind(&transition.new_status)
        .bind(increment)
        .bind(&transition.patch.gateway_name)
        .bind(&transition.patch.gateway_order_ref)
        .bind(&transition.patch.gateway_payment_ref)
        .bind(&transition.patch.checkout_token)
        .bind(&transition.patch.failure_reason)
        .bind(transition.patch.add_refunded_minor.unwrap_or(0))
        .bind(history)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn list_retry_candidates(&self, limit: i64) -> DbResult<Vec<PaymentOrderRecord>> {
        sqlx::query_as::<_, PaymentOrderRecord>(
            "SELECT id, payer_id, subject_ref, amount_minor, currency, status, preferred_gateway,
                    gateway_name, gateway_order_ref, gateway_payment_ref, checkout_token,
                    attempt, refunded_minor, failure_reason, tranche_id, attempt_history,
                    metadata, created_at, updated_at, last_transition_at,
                       instrument_ref, completed_at
             FROM payment_orders
             WHERE status = 'transient_failed'
             ORDER BY last_transition_at ASC
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn apply_webhook_event(
        &self,
        event: NewWebhookEvent,
        transition: Option<OrderTransition>,
        refund: Option<RefundResolution>,
    ) -> DbResult<WebhookApplyOutcome> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let inserted = sqlx::query(
            "INSERT INTO webhook_events (gateway_name, event_id, order_id, kind, payload, received_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (gateway_name, event_id) DO NOTHING",
        )
        .bind(&event.gateway_name)
        .bind(&event.event_id)
        .bind(&event.order_id)
        .bind(&event.kind)
        .bind(&event.payload)
        .bind(event.received_at)
        .execute(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(WebhookApplyOutcome::AlreadyProcessed);
        }

        let mut updated_order = None;
        if let Some(t) = transition {
            let increment: i32 = if t.increment_attempt { 1 } else { 0 };
            let history = t
                .history_entry
                .map(|entry| json!([entry]))
                .unwrap_or_else(|| json!([]));

            let row = sqlx::query_as::<_, PaymentOrderRecord>(
                "UPDATE payment_orders
                 SET status = $4,
                     attempt = attempt + $5,
                     gateway_name = COALESCE($6, gateway_name),
                     gateway_order_ref = COALESCE($7, gateway_order_ref),
                     gateway_payment_ref = COALESCE($8, gateway_payment_ref),
                     checkout_token = COALESCE($9, checkout_token),
                     failure_reason = COALESCE($10, failure_reason),
                     refunded_minor = refunded_minor + $11,
                     attempt_history = attempt_history || $12,
                     completed_at = CASE WHEN $4 = 'succeeded'
                                         THEN COALESCE(completed_at, NOW())
                                         ELSE completed_at END,
                     updated_at = NOW(),
                     last_transition_at = NOW()
                 WHERE id = $1 AND status = $2 AND attempt = $3
                 RETURNING id, payer_id, subject_ref, amount_minor, currency, status, preferred_gateway,
                           gateway_name, gateway_order_ref, gateway_payment_ref, checkout_token,
                           attempt, refunded_minor, failure_reason, tranche_id, attempt_history,
                           metadata, created_at, updated_at, last_transition_at,
                       instrument_ref, completed_at",
            )
            .bind(&t.order_id)
            .bind(&t.expected_status)
            .bind(t.expected_attempt)
            .bind(&t.new_status)
            .bind(increment)
            .bind(&t.patch.gateway_name)
            .bind(&t.patch.gateway_order_ref)
            .bind(&t.patch.gateway_payment_ref)
            .bind(&t.patch.checkout_token)
            .bind(&t.patch.failure_reason)
            .bind(t.patch.add_refunded_minor.unwrap_or(0))
            .bind(history)
            .fetch_optional(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            match row {
                Some(record) => updated_order = Some(record),
                None => {
                    let current = sqlx::query_as::<_, PaymentOrderRecord>(
                        "SELECT id, payer_id, subject_ref, amount_minor, currency, status, preferred_gateway,
                                gateway_name, gateway_order_ref, gateway_payment_ref, checkout_token,
                                attempt, refunded_minor, failure_reason, tranche_id, attempt_history,
                                metadata, created_at, updated_at, last_transition_at,
                       instrument_ref, completed_at
                         FROM payment_orders
                         WHERE id = $1",
                    )
                    .bind(&t.order_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(DatabaseError::from_sqlx)?;

                    let status_still_expected = current
                        .as_ref()
                        .map(|o| o.status == t.expected_status)
                        .unwrap_or(false);

                    if status_still_expected {
                        // Lost a write race on the attempt counter. Roll the
                        // ledger row back so a retried apply gets a clean
                        // insert.
                        tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
                        return Ok(WebhookApplyOutcome::Conflict);
                    }

                    // The order moved past the expected state. Keep the
                    // ledger row so replays stay no-ops, leave the order
                    // alone.
                    tx.commit().await.map_err(DatabaseError::from_sqlx)?;
                    return Ok(WebhookApplyOutcome::Stale);
                }
            }
        }

        if let Some(r) = refund {
            let resolved = sqlx::query_as::<_, RefundRecord>(
                "UPDATE refund_requests
                 SET status = $2,
                     gateway_refund_ref = COALESCE($3, gateway_refund_ref),
                     failure_reason = COALESCE($4, failure_reason),
                     resolved_at = NOW(),
                     updated_at = NOW()
                 WHERE id = $1 AND status IN ('requested', 'submitted')
                 RETURNING id, order_id, amount_minor, status, gateway_refund_ref,
                           provider_status, reason, failure_reason, created_at, updated_at, resolved_at",
            )
            .bind(&r.refund_id)
            .bind(&r.new_status)
            .bind(&r.gateway_refund_ref)
            .bind(&r.failure_reason)
            .fetch_optional(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            if resolved.is_none() {
                tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
                return Ok(WebhookApplyOutcome::Conflict);
            }
        }

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(WebhookApplyOutcome::Applied(updated_order))
    }

    async fn record_orphan_event(&self, event: NewOrphanEvent) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO orphan_events (id, gateway_name, event_id, gateway_order_ref, payload, received_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&event.gateway_name)
        .bind(&event.event_id)
        .bind(&event.gateway_order_ref)
        .bind(&event.payload)
        .bind(event.received_at)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn insert_refund(&self, refund: NewRefund) -> DbResult<RefundRecord> {
        sqlx::query_as::<_, RefundRecord>(
            "INSERT INTO refund_requests (id, order_id, amount_minor, reason)
             VALUES ($1, $2, $3, $4)
             RETURNING id, order_id, amount_minor, status, gateway_refund_ref,
                       provider_status, reason, failure_reason, created_at, updated_at, resolved_at",
        )
        .bind(&refund.id)
        .bind(&refund.order_id)
        .bind(refund.amount_minor)
        .bind(&refund.reason)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn get_refund(&self, refund_id: &str) -> DbResult<Option<RefundRecord>> {
        sqlx::query_as::<_, RefundRecord>(
            "SELECT id, order_id, amount_minor, status, gateway_refund_ref,
                    provider_status, reason, failure_reason, created_at, updated_at, resolved_at
             FROM refund_requests
             WHERE id = $1",
        )
        .bind(refund_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn find_refund_by_gateway_ref(
        &self,
        gateway_refund_ref: &str,
    ) -> DbResult<Option<RefundRecord>> {
        sqlx::query_as::<_, RefundRecord>(
            "SELECT id, order_id, amount_minor, status, gateway_refund_ref,
                    provider_status, reason, failure_reason, created_at, updated_at, resolved_at
             FROM refund_requests
             WHERE gateway_refund_ref = $1",
        )
        .bind(gateway_refund_ref)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn find_open_refund_for_order(
        &self,
        order_id: &str,
    ) -> DbResult<Option<RefundRecord>> {
        sqlx::query_as::<_, RefundRecord>(
            "SELECT id, order_id, amount_minor, status, gateway_refund_ref,
                    provider_status, reason, failure_reason, created_at, updated_at, resolved_at
             FROM refund_requests
             WHERE order_id = $1 AND status IN ('requested', 'submitted')
             ORDER BY created_at DESC
             LIMIT 1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn set_refund_submission(
        &self,
        refund_id: &str,
        gateway_refund_ref: &str,
        provider_status: &str,
    ) -> DbResult<()> {
        sqlx::query(
            "UPDATE refund_requests
             SET status = 'submitted', gateway_refund_ref = $2, provider_status = $3,
                 updated_at = NOW()
             WHERE id = $1 AND status = 'requested'",
        )
        .bind(refund_id)
        .bind(gateway_refund_ref)
        .bind(provider_status)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn resolve_refund(
        &self,
        resolution: RefundResolution,
        order_transition: Option<OrderTransition>,
    ) -> DbResult<Option<RefundRecord>> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let resolved = sqlx::query_as::<_, RefundRecord>(
            "UPDATE refund_requests
             SET status = $2,
                 gateway_refund_ref = COALESCE($3, gateway_refund_ref),
                 failure_reason = COALESCE($4, failure_reason),
                 resolved_at = NOW(),
                 updated_at = NOW()
             WHERE id = $1 AND status IN ('requested', 'submitted')
             RETURNING id, order_id, amount_minor, status, gateway_refund_ref,
                       provider_status, reason, failure_reason, created_at, updated_at, resolved_at",
        )
        .bind(&resolution.refund_id)
        .bind(&resolution.new_status)
        .bind(&resolution.gateway_refund_ref)
        .bind(&resolution.failure_reason)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let refund = match resolved {
            Some(refund) => refund,
            None => {
                tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
                return Ok(None);
            }
        };

        if let Some(t) = order_transition {
            let increment: i32 = if t.increment_attempt { 1 } else { 0 };
            let history = t
                .history_entry
                .map(|entry| json!([entry]))
                .unwrap_or_else(|| json!([]));

            let updated = sqlx::query(
                "UPDATE payment_orders
                 SET status = $4,
                     attempt = attempt + $5,
                     failure_reason = COALESCE($6, failure_reason),
                     refunded_minor = refunded_minor + $7,
                     attempt_history = attempt_history || $8,
                     completed_at = CASE WHEN $4 = 'succeeded'
                                         THEN COALESCE(completed_at, NOW())
                                         ELSE completed_at END,
                     updated_at = NOW(),
                     last_transition_at = NOW()
                 WHERE id = $1 AND status = $2 AND attempt = $3",
            )
            .bind(&t.order_id)
            .bind(&t.expected_status)
            .bind(t.expected_attempt)
            .bind(&t.new_status)
            .bind(increment)
            .bind(&t.patch.failure_reason)
            .bind(t.patch.add_refunded_minor.unwrap_or(0))
            .bind(history)
            .execute(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            if updated.rows_affected() == 0 {
                tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
                return Ok(None);
            }
        }

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(Some(refund))
    }

    async fn insert_plan(
        &self,
        plan: NewInstallmentPlan,
    ) -> DbResult<(InstallmentPlanRecord, Vec<InstallmentTrancheRecord>)> {
        let total_amount_minor: i64 = plan.tranches.iter().map(|t| t.amount_minor).sum();
        let installment_count = plan.tranches.len() as i32;

        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let plan_row = sqlx::query_as::<_, InstallmentPlanRecord>(
            "INSERT INTO installment_plans
             (id, payer_id, subject_ref, currency, total_amount_minor, installment_count,
              auto_debit, instrument_ref)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING id, payer_id, subject_ref, currency, total_amount_minor,
                       installment_count, auto_debit, instrument_ref, status,
                       created_at, updated_at",
        )
        .bind(&plan.id)
        .bind(&plan.payer_id)
        .bind(&plan.subject_ref)
        .bind(&plan.currency)
        .bind(total_amount_minor)
        .bind(installment_count)
        .bind(plan.auto_debit)
        .bind(&plan.instrument_ref)
        .fetch_one(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let mut tranche_rows = Vec::with_capacity(plan.tranches.len());
        for tranche in &plan.tranches {
            let row = sqlx::query_as::<_, InstallmentTrancheRecord>(
                "INSERT INTO installment_tranches (id, plan_id, seq, amount_minor, due_at)
                 VALUES ($1, $2, $3, $4, $5)
                 RETURNING id, plan_id, seq, amount_minor, due_at, status, active_order_id,
                           created_at, updated_at",
            )
            .bind(&tranche.id)
            .bind(&plan.id)
            .bind(tranche.seq)
            .bind(tranche.amount_minor)
            .bind(tranche.due_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
            tranche_rows.push(row);
        }

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok((plan_row, tranche_rows))
    }

    async fn get_plan(
        &self,
        plan_id: &str,
    ) -> DbResult<Option<(InstallmentPlanRecord, Vec<InstallmentTrancheRecord>)>> {
        let plan = sqlx::query_as::<_, InstallmentPlanRecord>(
            "SELECT id, payer_id, subject_ref, currency, total_amount_minor,
                    installment_count, auto_debit, instrument_ref, status,
                    created_at, updated_at
             FROM installment_plans
             WHERE id = $1",
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let plan = match plan {
            Some(plan) => plan,
            None => return Ok(None),
        };

        let tranches = sqlx::query_as::<_, InstallmentTrancheRecord>(
            "SELECT id, plan_id, seq, amount_minor, due_at, status, active_order_id,
                    created_at, updated_at
             FROM installment_tranches
             WHERE plan_id = $1
             ORDER BY seq ASC",
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(Some((plan, tranches)))
    }

    async fn get_tranche(&self, tranche_id: &str) -> DbResult<Option<InstallmentTrancheRecord>> {
        sqlx::query_as::<_, InstallmentTrancheRecord>(
            "SELECT id, plan_id, seq, amount_minor, due_at, status, active_order_id,
                    created_at, updated_at
             FROM installment_tranches
             WHERE id = $1",
        )
        .bind(tranche_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn list_due_tranches(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<DueTranche>> {
        let rows = sqlx::query_as::<_, DueTrancheRow>(
            "SELECT t.id, t.plan_id, t.seq, t.amount_minor, t.due_at, t.status,
                    t.active_order_id, t.created_at, t.updated_at,
                    p.payer_id AS plan_payer_id, p.subject_ref AS plan_subject_ref,
                    p.currency AS plan_currency,
                    p.total_amount_minor AS plan_total_amount_minor,
                    p.installment_count AS plan_installment_count,
                    p.auto_debit AS plan_auto_debit,
                    p.instrument_ref AS plan_instrument_ref,
                    p.status AS plan_status,
                    p.created_at AS plan_created_at, p.updated_at AS plan_updated_at
             FROM installment_tranches t
             JOIN installment_plans p ON p.id = t.plan_id
             WHERE t.status = 'scheduled'
               AND t.due_at <= $1
               AND p.auto_debit = TRUE
               AND p.status = 'active'
             ORDER BY t.due_at ASC
             LIMIT $2",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(rows.into_iter().map(DueTrancheRow::into_due).collect())
    }

    async fn claim_tranche(&self, tranche_id: &str) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE installment_tranches
             SET status = 'processing', updated_at = NOW()
             WHERE id = $1 AND status = 'scheduled'",
        )
        .bind(tranche_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_tranche_order(&self, tranche_id: &str, order_id: &str) -> DbResult<()> {
        sqlx::query(
            "UPDATE installment_tranches
             SET active_order_id = $2, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(tranche_id)
        .bind(order_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn release_tranche(&self, tranche_id: &str) -> DbResult<()> {
        sqlx::query(
            "UPDATE installment_tranches
             SET status = 'scheduled', active_order_id = NULL, updated_at = NOW()
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(tranche_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn finish_tranche(
        &self,
        tranche_id: &str,
        order_id: &str,
        outcome: &str,
    ) -> DbResult<bool> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let plan_id = sqlx::query_scalar::<_, String>(
            "UPDATE installment_tranches
             SET status = $3, updated_at = NOW()
             WHERE id = $1 AND status = 'processing' AND active_order_id = $2
             RETURNING plan_id",
        )
        .bind(tranche_id)
        .bind(order_id)
        .bind(outcome)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let plan_id = match plan_id {
            Some(plan_id) => plan_id,
            None => {
                tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
                return Ok(false);
            }
        };

        if outcome == tranche_status::PAID {
            let open: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM installment_tranches
                 WHERE plan_id = $1 AND status <> 'paid'",
            )
            .bind(&plan_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            if open == 0 {
                sqlx::query(
                    "UPDATE installment_plans
                     SET status = 'completed', updated_at = NOW()
                     WHERE id = $1 AND status = 'active'",
                )
                .bind(&plan_id)
                .execute(&mut *tx)
                .await
                .map_err(DatabaseError::from_sqlx)?;
            }
        }

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(true)
    }
}

/// Flat projection of the due-tranche join.
#[derive(Debug, FromRow)]
struct DueTrancheRow {
    id: String,
    plan_id: String,
    seq: i32,
    amount_minor: i64,
    due_at: DateTime<Utc>,
    status: String,
    active_order_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    plan_payer_id: String,
    plan_subject_ref: String,
    plan_currency: String,
    plan_total_amount_minor: i64,
    plan_installment_count: i32,
    plan_auto_debit: bool,
    plan_instrument_ref: Option<String>,
    plan_status: String,
    plan_created_at: DateTime<Utc>,
    plan_updated_at: DateTime<Utc>,
}

impl DueTrancheRow {
    fn into_due(self) -> DueTranche {
        DueTranche {
            plan: InstallmentPlanRecord {
                id: self.plan_id.clone(),
                payer_id: self.plan_payer_id,
                subject_ref: self.plan_subject_ref,
                currency: self.plan_currency,
                total_amount_minor: self.plan_total_amount_minor,
                installment_count: self.plan_installment_count,
                auto_debit: self.plan_auto_debit,
                instrument_ref: self.plan_instrument_ref,
                status: self.plan_status,
                created_at: self.plan_created_at,
                updated_at: self.plan_updated_at,
            },
            tranche: InstallmentTrancheRecord {
                id: self.id,
                plan_id: self.plan_id,
                seq: self.seq,
                amount_minor: self.amount_minor,
                due_at: self.due_at,
                status: self.status,
                active_order_id: self.active_order_id,
                created_at: self.created_at,
                updated_at: self.updated_at,
            },
        }
    }
}
