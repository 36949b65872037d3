use crate::database::error::DbResult;
use crate::database::models::{
    DueTranche, InstallmentPlanRecord, InstallmentTrancheRecord, NewInstallmentPlan, NewOrder,
    NewOrphanEvent, NewRefund, NewWebhookEvent, OrderTransition, PaymentOrderRecord, RefundRecord,
    RefundResolution,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Outcome of an atomic ledger-plus-order apply.
#[derive(Debug, Clone)]
pub enum WebhookApplyOutcome {
    /// Ledger row written and the order transition (when present) applied.
    Applied(Option<PaymentOrderRecord>),
    /// The `(gateway, event_id)` pair was already in the ledger. Nothing
    /// changed.
    AlreadyProcessed,
    /// Ledger row written, but the order had already moved past the expected
    /// state. The order was left untouched.
    Stale,
    /// The conditional update lost a write race while the expected state is
    /// still current. Nothing was committed; re-read and retry.
    Conflict,
}

/// Persistence seam for orders, the webhook ledger, refunds, and installment
/// plans.
///
/// Every order write goes through a conditional update that names the state
/// it expects to find; implementations never overwrite blindly. The Postgres
/// implementation backs production, the in-memory one backs `SKIP_DB` runs
/// and the test suite with identical semantics.
#[async_trait]
pub trait OrderStore: Send + Sync {
    // --- orders ---

    /// Insert a new order. A duplicate id surfaces as a conflict error; the
    /// caller decides whether that means idempotent replay.
    async fn insert_order(&self, order: NewOrder) -> DbResult<PaymentOrderRecord>;

    async fn get_order(&self, order_id: &str) -> DbResult<Option<PaymentOrderRecord>>;

    async fn find_order_by_gateway_ref(
        &self,
        gateway_name: &str,
        gateway_order_ref: &str,
    ) -> DbResult<Option<PaymentOrderRecord>>;

    /// Conditionally transition an order. Returns the updated row, or `None`
    /// when the row no longer matches the expected status/attempt.
    async fn transition_order(
        &self,
        transition: OrderTransition,
    ) -> DbResult<Option<PaymentOrderRecord>>;

    /// Orders in `transient_failed`, oldest transition first.
    async fn list_retry_candidates(&self, limit: i64) -> DbResult<Vec<PaymentOrderRecord>>;

    // --- webhook ledger ---

    /// Atomically: insert the ledger row (write-once) and, when present,
    /// apply the order transition and refund resolution. See
    /// [`WebhookApplyOutcome`] for the contract on partial application.
    async fn apply_webhook_event(
        &self,
        event: NewWebhookEvent,
        transition: Option<OrderTransition>,
        refund: Option<RefundResolution>,
    ) -> DbResult<WebhookApplyOutcome>;

    async fn record_orphan_event(&self, event: NewOrphanEvent) -> DbResult<()>;

    // --- refunds ---

    async fn insert_refund(&self, refund: NewRefund) -> DbResult<RefundRecord>;

    async fn get_refund(&self, refund_id: &str) -> DbResult<Option<RefundRecord>>;

    async fn find_refund_by_gateway_ref(
        &self,
        gateway_refund_ref: &str,
    ) -> DbResult<Option<RefundRecord>>;

    /// The single in-flight (`requested` or `submitted`) refund for an
    /// order, if any.
    async fn find_open_refund_for_order(&self, order_id: &str)
        -> DbResult<Option<RefundRecord>>;

    /// Record the gateway's acceptance of a refund: `requested` →
    /// `submitted`, keeping the gateway's refund ref and raw status.
    async fn set_refund_submission(
        &self,
        refund_id: &str,
        gateway_refund_ref: &str,
        provider_status: &str,
    ) -> DbResult<()>;

    /// Resolve a refund to a terminal status, optionally applying the paired
    /// order transition in the same atomic step. Returns the refund row, or
    /// `None` when it was no longer open.
    async fn resolve_refund(
        &self,
        resolution: RefundResolution,
        order_transition: Option<OrderTransition>,
    ) -> DbResult<Option<RefundRecord>>;

    // --- installments ---

    async fn insert_plan(
        &self,
        plan: NewInstallmentPlan,
    ) -> DbResult<(InstallmentPlanRecord, Vec<InstallmentTrancheRecord>)>;

    async fn get_plan(
        &self,
        plan_id: &str,
    ) -> DbResult<Option<(InstallmentPlanRecord, Vec<InstallmentTrancheRecord>)>>;

    async fn get_tranche(&self, tranche_id: &str) -> DbResult<Option<InstallmentTrancheRecord>>;

    /// Scheduled tranches of active auto-debit plans due at or before `now`.
    async fn list_due_tranches(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<DueTranche>>;

    /// Claim a tranche for payment: `scheduled` → `processing`. Returns
    /// false when someone else already holds it.
    async fn claim_tranche(&self, tranche_id: &str) -> DbResult<bool>;

    /// Point a claimed tranche at the order paying it.
    async fn set_tranche_order(&self, tranche_id: &str, order_id: &str) -> DbResult<()>;

    /// Undo a claim whose order never came into existence:
    /// `processing` → `scheduled`, clearing the order pointer.
    async fn release_tranche(&self, tranche_id: &str) -> DbResult<()>;

    /// Terminal tranche update (`paid` or `suspended`), guarded on the
    /// claiming order. Marks the plan completed when its last tranche pays.
    /// Returns false when the tranche/order pairing no longer matches.
    async fn finish_tranche(
        &self,
        tranche_id: &str,
        order_id: &str,
        outcome: &str,
    ) -> DbResult<bool>;
}
