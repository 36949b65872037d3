//! Row types and write descriptors shared by the store implementations.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::FromRow;

/// Refund lifecycle statuses as stored.
pub mod refund_status {
    pub const REQUESTED: &str = "requested";
    pub const SUBMITTED: &str = "submitted";
    pub const CONFIRMED: &str = "confirmed";
    pub const FAILED: &str = "failed";

    /// A refund still awaiting a terminal outcome.
    pub fn is_open(status: &str) -> bool {
        status == REQUESTED || status == SUBMITTED
    }
}

/// Installment tranche statuses as stored.
pub mod tranche_status {
    pub const SCHEDULED: &str = "scheduled";
    pub const PROCESSING: &str = "processing";
    pub const PAID: &str = "paid";
    pub const SUSPENDED: &str = "suspended";
}

/// Installment plan statuses as stored.
pub mod plan_status {
    pub const ACTIVE: &str = "active";
    pub const COMPLETED: &str = "completed";
    pub const CANCELLED: &str = "cancelled";
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PaymentOrderRecord {
    pub id: String,
    pub payer_id: String,
    /// What is being paid for (course or batch reference).
    pub subject_ref: String,
    pub amount_minor: i64,
    pub currency: String,
    pub status: String,
    pub preferred_gateway: Option<String>,
    /// Gateway that currently owns the order's active attempt.
    pub gateway_name: Option<String>,
    pub gateway_order_ref: Option<String>,
    /// Captured payment id, recorded when the order succeeds.
    pub gateway_payment_ref: Option<String>,
    pub checkout_token: Option<String>,
    /// Stored payment instrument for auto-debit submissions.
    pub instrument_ref: Option<String>,
    pub attempt: i32,
    /// Minor units already confirmed refunded against this order.
    pub refunded_minor: i64,
    pub failure_reason: Option<String>,
    /// Set when the order pays an installment tranche.
    pub tranche_id: Option<String>,
    pub attempt_history: JsonValue,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    /// First arrival at `succeeded`, kept through refund transitions.
    pub completed_at: Option<DateTime<Utc>>,
}

impl PaymentOrderRecord {
    /// Minor units still refundable.
    pub fn remaining_minor(&self) -> i64 {
        self.amount_minor - self.refunded_minor
    }
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub id: String,
    pub payer_id: String,
    pub subject_ref: String,
    pub amount_minor: i64,
    pub currency: String,
    pub preferred_gateway: Option<String>,
    pub instrument_ref: Option<String>,
    pub tranche_id: Option<String>,
    pub metadata: JsonValue,
}

/// Field updates carried by a transition. `Some` sets, `None` leaves the
/// column alone.
#[derive(Debug, Clone, Default)]
pub struct OrderPatch {
    pub gateway_name: Option<String>,
    pub gateway_order_ref: Option<String>,
    pub gateway_payment_ref: Option<String>,
    pub checkout_token: Option<String>,
    pub failure_reason: Option<String>,
    /// Added to `refunded_minor` (confirmed refunds only).
    pub add_refunded_minor: Option<i64>,
}

/// A conditional order write. The update applies only while the row still
/// matches `expected_status` and `expected_attempt`; a miss is reported, not
/// forced.
#[derive(Debug, Clone)]
pub struct OrderTransition {
    pub order_id: String,
    pub expected_status: String,
    pub expected_attempt: i32,
    pub new_status: String,
    pub increment_attempt: bool,
    pub patch: OrderPatch,
    /// Entry appended to the order's attempt history.
    pub history_entry: Option<JsonValue>,
}

impl OrderTransition {
    pub fn new(
        order_id: impl Into<String>,
        expected_status: impl Into<String>,
        expected_attempt: i32,
        new_status: impl Into<String>,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            expected_status: expected_status.into(),
            expected_attempt,
            new_status: new_status.into(),
            increment_attempt: false,
            patch: OrderPatch::default(),
            history_entry: None,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WebhookEventRecord {
    pub gateway_name: String,
    pub event_id: String,
    pub order_id: Option<String>,
    pub kind: String,
    pub payload: JsonValue,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub gateway_name: String,
    pub event_id: String,
    pub order_id: Option<String>,
    pub kind: String,
    pub payload: JsonValue,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct OrphanEventRecord {
    pub id: String,
    pub gateway_name: String,
    pub event_id: Option<String>,
    pub gateway_order_ref: String,
    pub payload: JsonValue,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewOrphanEvent {
    pub gateway_name: String,
    pub event_id: Option<String>,
    pub gateway_order_ref: String,
    pub payload: JsonValue,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RefundRecord {
    pub id: String,
    pub order_id: String,
    pub amount_minor: i64,
    pub status: String,
    pub gateway_refund_ref: Option<String>,
    /// Raw status string the gateway reported at submission time.
    pub provider_status: Option<String>,
    /// Caller-supplied justification captured at request time.
    pub reason: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewRefund {
    pub id: String,
    pub order_id: String,
    pub amount_minor: i64,
    pub reason: Option<String>,
}

/// Terminal update for a refund row, optionally paired with an order
/// transition inside the same atomic apply.
#[derive(Debug, Clone)]
pub struct RefundResolution {
    pub refund_id: String,
    pub new_status: String,
    pub gateway_refund_ref: Option<String>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct InstallmentPlanRecord {
    pub id: String,
    pub payer_id: String,
    pub subject_ref: String,
    pub currency: String,
    pub total_amount_minor: i64,
    pub installment_count: i32,
    pub auto_debit: bool,
    pub instrument_ref: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct InstallmentTrancheRecord {
    pub id: String,
    pub plan_id: String,
    pub seq: i32,
    pub amount_minor: i64,
    pub due_at: DateTime<Utc>,
    pub status: String,
    /// Order currently paying (or having paid) this tranche.
    pub active_order_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewInstallmentPlan {
    pub id: String,
    pub payer_id: String,
    pub subject_ref: String,
    pub currency: String,
    pub auto_debit: bool,
    pub instrument_ref: Option<String>,
    pub tranches: Vec<NewTranche>,
}

#[derive(Debug, Clone)]
pub struct NewTranche {
    pub id: String,
    pub seq: i32,
    pub amount_minor: i64,
    pub due_at: DateTime<Utc>,
}

/// A due tranche joined with its plan, as returned by the sweep query.
#[derive(Debug, Clone)]
pub struct DueTranche {
    pub tranche: InstallmentTrancheRecord,
    pub plan: InstallmentPlanRecord,
}
