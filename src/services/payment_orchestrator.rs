//! Payment Orchestrator Service
//!
//! Creates payment orders, drives them through the gateway priority list with
//! failover, and owns the order state machine shared with the webhook
//! reconciler and the reconciliation scheduler.

use crate::database::error::DatabaseError;
use crate::database::models::{
    tranche_status, InstallmentPlanRecord, InstallmentTrancheRecord, NewInstallmentPlan, NewOrder,
    NewTranche, OrderTransition, PaymentOrderRecord,
};
use crate::database::store::OrderStore;
use crate::error::{AppError, AppErrorKind, DomainError, ExternalError, ValidationError};
use crate::gateways::{
    GatewayError, GatewayName, GatewayOrderHandle, GatewayOrderRequest, GatewayPaymentStatus,
    GatewayRegistry, GatewayStatusSnapshot,
};
use crate::services::notification::{NotificationKind, NotificationSink};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

// ============================================================================
// Configuration Types
// ============================================================================

/// Configuration for the payment orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum drive attempts before an order is parked in `hard_failed`
    pub max_attempts: u32,
    /// Base delay for the retry backoff, in seconds
    pub backoff_base_secs: u64,
    /// Ceiling for the retry backoff, in seconds
    pub backoff_cap_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_secs: 30,
            backoff_cap_secs: 3600, // 1 hour
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self {
            max_attempts: std::env::var("ORCHESTRATOR_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            backoff_base_secs: std::env::var("ORCHESTRATOR_BACKOFF_BASE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            backoff_cap_secs: std::env::var("ORCHESTRATOR_BACKOFF_CAP_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3600),
        }
    }
}

// ============================================================================
// Order State Machine
// ============================================================================

/// Lifecycle state of a payment order
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Awaiting gateway confirmation for the active attempt
    Pending,
    /// Funds captured
    Succeeded,
    /// Failed in a retryable way; the scheduler picks it up
    TransientFailed,
    /// Failed permanently; only manual re-initiation continues
    HardFailed,
    /// A refund is in flight against the captured payment
    RefundRequested,
    /// Cumulative confirmed refunds reached the order amount
    Refunded,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_db_status())
    }
}

impl OrderStatus {
    /// Get all valid transitions from this state
    pub fn valid_transitions(&self) -> Vec<OrderStatus> {
        match self {
            OrderStatus::Pending => vec![
                OrderStatus::Succeeded,
                OrderStatus::TransientFailed,
                OrderStatus::HardFailed,
            ],
            OrderStatus::TransientFailed => vec![OrderStatus::Pending, OrderStatus::HardFailed],
            OrderStatus::Succeeded => vec![OrderStatus::RefundRequested],
            // A failed or partial refund releases the order for another
            // refund request.
            OrderStatus::RefundRequested => vec![OrderStatus::Refunded, OrderStatus::Succeeded],
            // Terminal states - no valid transitions
            OrderStatus::HardFailed => vec![],
            OrderStatus::Refunded => vec![],
        }
    }

    pub fn can_transition_to(&self, target: OrderStatus) -> bool {
        self.valid_transitions().contains(&target)
    }

    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::HardFailed | OrderStatus::Refunded)
    }

    /// Check if the scheduler may drive another attempt from this state
    pub fn allows_retry(&self) -> bool {
        matches!(self, OrderStatus::TransientFailed)
    }

    /// Convert from database status string
    pub fn from_db_status(status: &str) -> Option<Self> {
        match status {
            "pending" => Some(OrderStatus::Pending),
            "succeeded" => Some(OrderStatus::Succeeded),
            "transient_failed" => Some(OrderStatus::TransientFailed),
            "hard_failed" => Some(OrderStatus::HardFailed),
            "refund_requested" => Some(OrderStatus::RefundRequested),
            "refunded" => Some(OrderStatus::Refunded),
            _ => None,
        }
    }

    /// Convert to database status string
    pub fn to_db_status(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Succeeded => "succeeded",
            OrderStatus::TransientFailed => "transient_failed",
            OrderStatus::HardFailed => "hard_failed",
            OrderStatus::RefundRequested => "refund_requested",
            OrderStatus::Refunded => "refunded",
        }
    }
}

// ============================================================================
// Request Types
// ============================================================================

/// Order-creation request, accepted verbatim from the API layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    /// Caller-assigned id; generated when absent. Re-submitting an existing
    /// id returns the stored order without contacting any gateway.
    #[serde(default)]
    pub order_id: Option<String>,
    pub payer_id: String,
    /// What is being paid for (course or batch reference)
    pub subject_ref: String,
    pub amount_minor: i64,
    pub currency: String,
    #[serde(default)]
    pub preferred_gateway: Option<String>,
    /// Stored instrument for auto-debit submissions
    #[serde(default)]
    pub instrument_ref: Option<String>,
    /// Set when this order pays an installment tranche
    #[serde(default)]
    pub tranche_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
}

/// Installment-plan creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePlanRequest {
    /// Caller-assigned id; generated when absent
    #[serde(default)]
    pub plan_id: Option<String>,
    pub payer_id: String,
    pub subject_ref: String,
    pub currency: String,
    /// When enabled, the scheduler auto-debits due tranches against
    /// `instrument_ref`
    #[serde(default)]
    pub auto_debit: bool,
    #[serde(default)]
    pub instrument_ref: Option<String>,
    pub tranches: Vec<PlanTrancheRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTrancheRequest {
    pub amount_minor: i64,
    pub due_at: DateTime<Utc>,
}

fn validate_create(request: &CreateOrderRequest) -> Result<(), ValidationError> {
    if request.payer_id.trim().is_empty() {
        return Err(ValidationError::MissingField {
            field: "payer_id".to_string(),
        });
    }
    if request.subject_ref.trim().is_empty() {
        return Err(ValidationError::MissingField {
            field: "subject_ref".to_string(),
        });
    }
    if request.amount_minor <= 0 {
        return Err(ValidationError::InvalidAmount {
            amount: request.amount_minor.to_string(),
            reason: "amount must be a positive number of minor units".to_string(),
        });
    }
    validate_currency(&request.currency)?;
    if let Some(id) = &request.order_id {
        validate_external_id("order_id", id)?;
    }
    Ok(())
}

fn validate_plan(request: &CreatePlanRequest) -> Result<(), ValidationError> {
    if request.payer_id.trim().is_empty() {
        return Err(ValidationError::MissingField {
            field: "payer_id".to_string(),
        });
    }
    if request.subject_ref.trim().is_empty() {
        return Err(ValidationError::MissingField {
            field: "subject_ref".to_string(),
        });
    }
    validate_currency(&request.currency)?;
    if request.tranches.is_empty() {
        return Err(ValidationError::MissingField {
            field: "tranches".to_string(),
        });
    }
    if let Some(t) = request.tranches.iter().find(|t| t.amount_minor <= 0) {
        return Err(ValidationError::InvalidAmount {
            amount: t.amount_minor.to_string(),
            reason: "every tranche amount must be a positive number of minor units".to_string(),
        });
    }
    if request.auto_debit
        && request
            .instrument_ref
            .as_deref()
            .map_or(true, |v| v.trim().is_empty())
    {
        return Err(ValidationError::MissingField {
            field: "instrument_ref".to_string(),
        });
    }
    if let Some(id) = &request.plan_id {
        validate_external_id("plan_id", id)?;
    }
    Ok(())
}

fn validate_currency(raw: &str) -> Result<(), ValidationError> {
    let currency = raw.trim();
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(ValidationError::InvalidCurrency {
            currency: raw.to_string(),
            reason: "expected a 3-letter ISO code".to_string(),
        });
    }
    Ok(())
}

fn validate_external_id(field: &str, id: &str) -> Result<(), ValidationError> {
    if id.trim().is_empty() || id.len() > 64 {
        return Err(ValidationError::InvalidField {
            field: field.to_string(),
            reason: "must be 1-64 characters".to_string(),
        });
    }
    Ok(())
}

// ============================================================================
// Orchestrator Errors
// ============================================================================

/// Errors surfaced by orchestrator operations
#[derive(Debug)]
pub enum OrchestratorError {
    Validation(ValidationError),
    OrderNotFound { order_id: String },
    PlanNotFound { plan_id: String },
    TrancheNotFound { tranche_id: String },
    /// The tranche is already claimed by another driver
    TrancheBusy { tranche_id: String },
    /// A materially different order already exists under the caller's id
    DuplicateOrder { order_id: String },
    /// A conditional write lost its race and the caller should retry
    Conflict { entity_id: String },
    /// Every candidate gateway was skipped or failed transiently
    NoGatewayAvailable { order_id: String },
    /// The named gateway is not in this deployment's registry
    UnknownGateway { gateway: String },
    Gateway(GatewayError),
    Storage(DatabaseError),
}

impl std::fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(e) => write!(f, "Invalid request: {:?}", e),
            Self::OrderNotFound { order_id } => write!(f, "Order not found: {}", order_id),
            Self::PlanNotFound { plan_id } => {
                write!(f, "Installment plan not found: {}", plan_id)
            }
            Self::TrancheNotFound { tranche_id } => {
                write!(f, "Installment tranche not found: {}", tranche_id)
            }
            Self::TrancheBusy { tranche_id } => {
                write!(f, "Tranche already has an active payment: {}", tranche_id)
            }
            Self::DuplicateOrder { order_id } => {
                write!(f, "A different order already exists with id: {}", order_id)
            }
            Self::Conflict { entity_id } => {
                write!(f, "Concurrent modification of: {}", entity_id)
            }
            Self::NoGatewayAvailable { order_id } => {
                write!(f, "No payment gateway available for order: {}", order_id)
            }
            Self::UnknownGateway { gateway } => {
                write!(f, "Gateway is not configured: {}", gateway)
            }
            Self::Gateway(e) => write!(f, "{}", e),
            Self::Storage(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<ValidationError> for OrchestratorError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err)
    }
}

impl From<DatabaseError> for OrchestratorError {
    fn from(err: DatabaseError) -> Self {
        Self::Storage(err)
    }
}

impl From<GatewayError> for OrchestratorError {
    fn from(err: GatewayError) -> Self {
        Self::Gateway(err)
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Validation(e) => AppError::new(AppErrorKind::Validation(e)),
            OrchestratorError::OrderNotFound { order_id } => {
                AppError::new(AppErrorKind::Domain(DomainError::OrderNotFound { order_id }))
            }
            OrchestratorError::PlanNotFound { plan_id } => {
                AppError::new(AppErrorKind::Domain(DomainError::PlanNotFound { plan_id }))
            }
            OrchestratorError::TrancheNotFound { tranche_id } => AppError::new(
                AppErrorKind::Domain(DomainError::TrancheNotFound { tranche_id }),
            ),
            OrchestratorError::TrancheBusy { tranche_id } => AppError::new(AppErrorKind::Domain(
                DomainError::Conflict {
                    entity_id: tranche_id,
                },
            )),
            OrchestratorError::DuplicateOrder { order_id } => AppError::new(AppErrorKind::Domain(
                DomainError::Conflict {
                    entity_id: order_id,
                },
            )),
            OrchestratorError::Conflict { entity_id } => {
                AppError::new(AppErrorKind::Domain(DomainError::Conflict { entity_id }))
            }
            OrchestratorError::NoGatewayAvailable { order_id } => {
                AppError::new(AppErrorKind::External(ExternalError::NoGatewayAvailable {
                    message: format!("no payment gateway could accept order {}", order_id),
                }))
            }
            OrchestratorError::UnknownGateway { gateway } => {
                AppError::new(AppErrorKind::External(ExternalError::Gateway {
                    gateway,
                    message: "gateway is not configured".to_string(),
                    is_retryable: true,
                }))
            }
            OrchestratorError::Gateway(e) => e.into(),
            OrchestratorError::Storage(e) => e.into(),
        }
    }
}

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

// ============================================================================
// Payment Orchestrator
// ============================================================================

/// Orchestrator that owns order creation, gateway failover, scheduled
/// retries, and user-initiated reconciliation
pub struct PaymentOrchestrator {
    store: Arc<dyn OrderStore>,
    registry: Arc<GatewayRegistry>,
    notifier: Arc<dyn NotificationSink>,
    config: OrchestratorConfig,
}

impl PaymentOrchestrator {
    pub fn new(
        store: Arc<dyn OrderStore>,
        registry: Arc<GatewayRegistry>,
        notifier: Arc<dyn NotificationSink>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // =========================================================================
    // Order Creation
    // =========================================================================

    /// Create an order and drive its first attempt through the gateway
    /// priority list.
    pub async fn create_order(
        &self,
        request: CreateOrderRequest,
    ) -> OrchestratorResult<PaymentOrderRecord> {
        validate_create(&request)?;

        let preferred = match &request.preferred_gateway {
            Some(raw) => Some(raw.parse::<GatewayName>().map_err(|_| {
                OrchestratorError::Validation(ValidationError::InvalidField {
                    field: "preferred_gateway".to_string(),
                    reason: "must be a non-empty gateway name".to_string(),
                })
            })?),
            None => None,
        };

        // Tranche-backed orders claim the tranche before anything else, so
        // overlapping sweeps and manual submissions cannot double-debit.
        if let Some(tranche_id) = &request.tranche_id {
            if self.store.get_tranche(tranche_id).await?.is_none() {
                return Err(OrchestratorError::TrancheNotFound {
                    tranche_id: tranche_id.clone(),
                });
            }
            if !self.store.claim_tranche(tranche_id).await? {
                // The claim holder may be this very request, replayed.
                if let Some(existing) = self.replayed_order(&request).await? {
                    return Ok(existing);
                }
                return Err(OrchestratorError::TrancheBusy {
                    tranche_id: tranche_id.clone(),
                });
            }
        }

        let order_id = request
            .order_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let new_order = NewOrder {
            id: order_id.clone(),
            payer_id: request.payer_id.clone(),
            subject_ref: request.subject_ref.clone(),
            amount_minor: request.amount_minor,
            currency: request.currency.trim().to_ascii_uppercase(),
            preferred_gateway: preferred.as_ref().map(|g| g.as_str().to_string()),
            instrument_ref: request.instrument_ref.clone(),
            tranche_id: request.tranche_id.clone(),
            metadata: request.metadata.clone().unwrap_or_else(|| json!({})),
        };

        let order = match self.store.insert_order(new_order).await {
            Ok(order) => order,
            Err(e) if e.is_conflict() => {
                // The caller-assigned id already exists. Undo the claim this
                // request took and answer from the stored row.
                if let Some(tranche_id) = &request.tranche_id {
                    self.release_claim(tranche_id).await;
                }
                return match self.replayed_order(&request).await? {
                    Some(existing) => Ok(existing),
                    None => Err(OrchestratorError::DuplicateOrder { order_id }),
                };
            }
            Err(e) => {
                if let Some(tranche_id) = &request.tranche_id {
                    self.release_claim(tranche_id).await;
                }
                return Err(e.into());
            }
        };

        if let Some(tranche_id) = &request.tranche_id {
            self.store.set_tranche_order(tranche_id, &order.id).await?;
        }

        info!(
            order_id = %order.id,
            payer = %order.payer_id,
            amount = order.amount_minor,
            currency = %order.currency,
            tranche_id = ?order.tranche_id,
            "payment order created"
        );

        self.drive_pending(order, preferred.as_ref()).await
    }

    /// The stored order for a caller-assigned id, when it matches the
    /// request materially. Answers duplicate-create retries idempotently.
    async fn replayed_order(
        &self,
        request: &CreateOrderRequest,
    ) -> OrchestratorResult<Option<PaymentOrderRecord>> {
        let Some(order_id) = &request.order_id else {
            return Ok(None);
        };
        let Some(existing) = self.store.get_order(order_id).await? else {
            return Ok(None);
        };
        if existing.payer_id == request.payer_id
            && existing.amount_minor == request.amount_minor
            && existing.currency == request.currency.trim().to_ascii_uppercase()
            && existing.tranche_id == request.tranche_id
        {
            info!(order_id = %existing.id, "create replayed for an existing order");
            Ok(Some(existing))
        } else {
            Err(OrchestratorError::DuplicateOrder {
                order_id: order_id.clone(),
            })
        }
    }

    // =========================================================================
    // Gateway Drive
    // =========================================================================

    /// Submit a pending order to the first gateway that accepts it.
    ///
    /// `Unavailable` candidates are skipped, `Transient` failures move on to
    /// the next candidate, and a `Rejected` verdict ends the attempt without
    /// failover.
    async fn drive_pending(
        &self,
        order: PaymentOrderRecord,
        preferred: Option<&GatewayName>,
    ) -> OrchestratorResult<PaymentOrderRecord> {
        let request = GatewayOrderRequest {
            order_id: order.id.clone(),
            amount_minor: order.amount_minor,
            currency: order.currency.clone(),
            payer_id: order.payer_id.clone(),
            instrument_ref: order.instrument_ref.clone(),
        };

        let mut skipped: Vec<String> = Vec::new();
        for gateway in self.registry.candidates(preferred) {
            let name = gateway.name();
            match gateway.create_order(request.clone()).await {
                Ok(handle) => {
                    return self.record_submission(order, &name, handle).await;
                }
                Err(e @ GatewayError::Unavailable { .. }) => {
                    warn!(order_id = %order.id, gateway = %name, error = %e, "gateway unusable, skipping");
                    skipped.push(format!("{}: {}", name, e));
                }
                Err(e @ GatewayError::Transient { .. }) => {
                    warn!(order_id = %order.id, gateway = %name, error = %e, "gateway failed transiently, trying next");
                    skipped.push(format!("{}: {}", name, e));
                }
                Err(e @ GatewayError::Rejected { .. }) => {
                    return self.record_rejection(order, &name, e).await;
                }
            }
        }

        self.record_no_gateway(order, skipped).await
    }

    /// Persist a submission the gateway accepted: stay `pending`, consume
    /// the attempt, and remember the provider refs.
    async fn record_submission(
        &self,
        order: PaymentOrderRecord,
        gateway: &GatewayName,
        handle: GatewayOrderHandle,
    ) -> OrchestratorResult<PaymentOrderRecord> {
        let mut t = OrderTransition::new(
            &order.id,
            &order.status,
            order.attempt,
            OrderStatus::Pending.to_db_status(),
        );
        t.increment_attempt = true;
        t.patch.gateway_name = Some(gateway.to_string());
        t.patch.gateway_order_ref = Some(handle.gateway_order_ref.clone());
        t.patch.checkout_token = handle.checkout_token.clone();
        t.history_entry = Some(json!({
            "attempt": order.attempt + 1,
            "gateway": gateway.as_str(),
            "gateway_order_ref": handle.gateway_order_ref,
            "outcome": "submitted",
            "at": Utc::now().to_rfc3339(),
        }));

        match self.store.transition_order(t).await? {
            Some(updated) => {
                info!(
                    order_id = %updated.id,
                    gateway = %gateway,
                    attempt = updated.attempt,
                    "order submitted to gateway"
                );
                Ok(updated)
            }
            None => {
                // A webhook for an earlier attempt landed while the gateway
                // call was in flight. Keep what the ledgered event wrote.
                warn!(order_id = %order.id, "submission write lost a race, keeping the stored order");
                self.read_back(&order.id).await
            }
        }
    }

    /// Persist a terminal gateway rejection. No failover, no auto-retry.
    async fn record_rejection(
        &self,
        order: PaymentOrderRecord,
        gateway: &GatewayName,
        err: GatewayError,
    ) -> OrchestratorResult<PaymentOrderRecord> {
        let reason = match &err {
            GatewayError::Rejected {
                gateway_code: Some(code),
                message,
                ..
            } => format!("{}: {}", code, message),
            other => other.to_string(),
        };

        let mut t = OrderTransition::new(
            &order.id,
            &order.status,
            order.attempt,
            OrderStatus::HardFailed.to_db_status(),
        );
        t.increment_attempt = true;
        t.patch.failure_reason = Some(reason.clone());
        t.history_entry = Some(json!({
            "attempt": order.attempt + 1,
            "gateway": gateway.as_str(),
            "outcome": "rejected",
            "reason": reason,
            "at": Utc::now().to_rfc3339(),
        }));

        match self.store.transition_order(t).await? {
            Some(updated) => {
                error!(
                    order_id = %updated.id,
                    gateway = %gateway,
                    reason = %reason,
                    "gateway rejected the order"
                );
                self.notifier
                    .notify(
                        NotificationKind::OrderFailed,
                        &updated,
                        &format!("{} rejected the payment: {}", gateway, reason),
                    )
                    .await;
                if let Some(tranche_id) = &updated.tranche_id {
                    self.suspend_tranche(tranche_id, &updated.id).await;
                }
                Err(OrchestratorError::Gateway(err))
            }
            None => {
                warn!(order_id = %order.id, "rejection write lost a race, keeping the stored order");
                self.read_back(&order.id).await
            }
        }
    }

    /// Persist an attempt that exhausted every candidate.
    ///
    /// A first attempt for a tranche order hard-fails and releases the claim
    /// so the next sweep drives a fresh order; anything else stays
    /// retryable in `transient_failed`.
    async fn record_no_gateway(
        &self,
        order: PaymentOrderRecord,
        skipped: Vec<String>,
    ) -> OrchestratorResult<PaymentOrderRecord> {
        let fresh_tranche_order = order.tranche_id.is_some() && order.attempt == 0;
        let target = if fresh_tranche_order {
            OrderStatus::HardFailed
        } else {
            OrderStatus::TransientFailed
        };

        let mut t = OrderTransition::new(
            &order.id,
            &order.status,
            order.attempt,
            target.to_db_status(),
        );
        t.increment_attempt = true;
        t.patch.failure_reason = Some("no payment gateway available".to_string());
        t.history_entry = Some(json!({
            "attempt": order.attempt + 1,
            "outcome": "no_gateway",
            "skipped": skipped,
            "at": Utc::now().to_rfc3339(),
        }));

        match self.store.transition_order(t).await? {
            Some(updated) => {
                warn!(
                    order_id = %updated.id,
                    attempt = updated.attempt,
                    status = %updated.status,
                    "no gateway accepted the order"
                );
                if fresh_tranche_order {
                    if let Some(tranche_id) = &updated.tranche_id {
                        self.release_claim(tranche_id).await;
                    }
                }
                Err(OrchestratorError::NoGatewayAvailable {
                    order_id: updated.id,
                })
            }
            None => {
                // A late webhook for an earlier attempt beat this write.
                let current = self.read_back(&order.id).await?;
                if current.status == OrderStatus::Succeeded.to_db_status() {
                    return Ok(current);
                }
                Err(OrchestratorError::NoGatewayAvailable {
                    order_id: current.id,
                })
            }
        }
    }

    // =========================================================================
    // Retry & Reconciliation
    // =========================================================================

    /// Drive one more attempt for an order in `transient_failed`.
    ///
    /// Called by the scheduler sweep. Safe under concurrent sweeps: the
    /// conditional hop back to `pending` admits exactly one driver.
    pub async fn retry_order(&self, order_id: &str) -> OrchestratorResult<PaymentOrderRecord> {
        let order = self.read_back(order_id).await?;
        let Some(status) = OrderStatus::from_db_status(&order.status) else {
            warn!(order_id = %order.id, status = %order.status, "order carries an unknown status");
            return Ok(order);
        };
        if !status.allows_retry() {
            return Ok(order);
        }

        if order.attempt >= self.config.max_attempts as i32 {
            return self.park_exhausted(order).await;
        }

        let mut hop = OrderTransition::new(
            &order.id,
            &order.status,
            order.attempt,
            OrderStatus::Pending.to_db_status(),
        );
        hop.history_entry = Some(json!({
            "attempt": order.attempt,
            "outcome": "retry_started",
            "at": Utc::now().to_rfc3339(),
        }));

        let Some(pending) = self.store.transition_order(hop).await? else {
            // Another sweep or a late webhook got here first.
            return self.read_back(&order.id).await;
        };

        info!(order_id = %pending.id, attempt = pending.attempt, "retrying order");

        let preferred = pending
            .preferred_gateway
            .as_deref()
            .and_then(|raw| raw.parse::<GatewayName>().ok());
        self.drive_pending(pending, preferred.as_ref()).await
    }

    /// Park an order that burned through its attempt budget.
    async fn park_exhausted(
        &self,
        order: PaymentOrderRecord,
    ) -> OrchestratorResult<PaymentOrderRecord> {
        let mut t = OrderTransition::new(
            &order.id,
            &order.status,
            order.attempt,
            OrderStatus::HardFailed.to_db_status(),
        );
        t.patch.failure_reason = Some("retry attempts exhausted".to_string());
        t.history_entry = Some(json!({
            "attempt": order.attempt,
            "outcome": "retries_exhausted",
            "at": Utc::now().to_rfc3339(),
        }));

        match self.store.transition_order(t).await? {
            Some(updated) => {
                error!(
                    order_id = %updated.id,
                    attempt = updated.attempt,
                    "order failed permanently after exhausting retries"
                );
                self.notifier
                    .notify(
                        NotificationKind::OrderFailed,
                        &updated,
                        "payment could not be completed after repeated attempts",
                    )
                    .await;
                if let Some(tranche_id) = &updated.tranche_id {
                    self.suspend_tranche(tranche_id, &updated.id).await;
                }
                Ok(updated)
            }
            None => self.read_back(&order.id).await,
        }
    }

    /// User-initiated reconciliation: poll the owning gateway and apply the
    /// result through the same conditional-update path webhooks use.
    pub async fn sync_order(&self, order_id: &str) -> OrchestratorResult<PaymentOrderRecord> {
        let order = self.read_back(order_id).await?;
        if order.status != OrderStatus::Pending.to_db_status() {
            // Nothing in flight; report the stored state.
            return Ok(order);
        }
        let (Some(gateway_name), Some(gateway_order_ref)) =
            (order.gateway_name.clone(), order.gateway_order_ref.clone())
        else {
            return Ok(order);
        };

        let name = GatewayName::new(&gateway_name);
        let gateway = self
            .registry
            .get(&name)
            .ok_or(OrchestratorError::UnknownGateway {
                gateway: gateway_name,
            })?;

        let snapshot = gateway.fetch_status(&gateway_order_ref).await?;
        info!(
            order_id = %order.id,
            gateway = %name,
            status = %snapshot.status,
            "gateway status fetched"
        );

        match snapshot.status {
            GatewayPaymentStatus::Pending => Ok(order),
            GatewayPaymentStatus::Paid => self.apply_poll_success(order, snapshot).await,
            GatewayPaymentStatus::TransientFailure => {
                self.apply_poll_failure(order, OrderStatus::TransientFailed, snapshot)
                    .await
            }
            GatewayPaymentStatus::HardFailure => {
                self.apply_poll_failure(order, OrderStatus::HardFailed, snapshot)
                    .await
            }
        }
    }

    async fn apply_poll_success(
        &self,
        order: PaymentOrderRecord,
        snapshot: GatewayStatusSnapshot,
    ) -> OrchestratorResult<PaymentOrderRecord> {
        let mut t = OrderTransition::new(
            &order.id,
            &order.status,
            order.attempt,
            OrderStatus::Succeeded.to_db_status(),
        );
        t.patch.gateway_payment_ref = snapshot.gateway_payment_ref.clone();
        t.history_entry = Some(json!({
            "attempt": order.attempt,
            "outcome": "paid",
            "source": "poll",
            "at": Utc::now().to_rfc3339(),
        }));

        match self.store.transition_order(t).await? {
            Some(updated) => {
                info!(order_id = %updated.id, "order confirmed paid by poll");
                self.notifier
                    .notify(NotificationKind::OrderSucceeded, &updated, "payment confirmed")
                    .await;
                if let Some(tranche_id) = &updated.tranche_id {
                    self.settle_tranche(tranche_id, &updated.id).await;
                }
                Ok(updated)
            }
            None => {
                // A webhook applied first; its write stands.
                self.read_back(&order.id).await
            }
        }
    }

    async fn apply_poll_failure(
        &self,
        order: PaymentOrderRecord,
        target: OrderStatus,
        snapshot: GatewayStatusSnapshot,
    ) -> OrchestratorResult<PaymentOrderRecord> {
        let reason = snapshot
            .reason
            .unwrap_or_else(|| "gateway reported failure".to_string());

        let mut t = OrderTransition::new(
            &order.id,
            &order.status,
            order.attempt,
            target.to_db_status(),
        );
        t.patch.failure_reason = Some(reason.clone());
        t.history_entry = Some(json!({
            "attempt": order.attempt,
            "outcome": target.to_db_status(),
            "reason": reason,
            "source": "poll",
            "at": Utc::now().to_rfc3339(),
        }));

        match self.store.transition_order(t).await? {
            Some(updated) => {
                warn!(
                    order_id = %updated.id,
                    status = %updated.status,
                    reason = %reason,
                    "order failed per gateway poll"
                );
                if target == OrderStatus::HardFailed {
                    self.notifier
                        .notify(NotificationKind::OrderFailed, &updated, &reason)
                        .await;
                    if let Some(tranche_id) = &updated.tranche_id {
                        self.suspend_tranche(tranche_id, &updated.id).await;
                    }
                }
                Ok(updated)
            }
            None => self.read_back(&order.id).await,
        }
    }

    pub async fn get_order(&self, order_id: &str) -> OrchestratorResult<PaymentOrderRecord> {
        self.read_back(order_id).await
    }

    // =========================================================================
    // Installment Plans
    // =========================================================================

    /// Create an installment plan with due-dated tranches.
    pub async fn create_installment_plan(
        &self,
        request: CreatePlanRequest,
    ) -> OrchestratorResult<(InstallmentPlanRecord, Vec<InstallmentTrancheRecord>)> {
        validate_plan(&request)?;

        let plan_id = request
            .plan_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let tranches = request
            .tranches
            .iter()
            .enumerate()
            .map(|(idx, t)| NewTranche {
                id: Uuid::new_v4().to_string(),
                seq: (idx + 1) as i32,
                amount_minor: t.amount_minor,
                due_at: t.due_at,
            })
            .collect();

        let plan = NewInstallmentPlan {
            id: plan_id.clone(),
            payer_id: request.payer_id.clone(),
            subject_ref: request.subject_ref.clone(),
            currency: request.currency.trim().to_ascii_uppercase(),
            auto_debit: request.auto_debit,
            instrument_ref: request.instrument_ref.clone(),
            tranches,
        };

        match self.store.insert_plan(plan).await {
            Ok((plan, tranches)) => {
                info!(
                    plan_id = %plan.id,
                    payer = %plan.payer_id,
                    tranches = tranches.len(),
                    auto_debit = plan.auto_debit,
                    "installment plan created"
                );
                Ok((plan, tranches))
            }
            Err(e) if e.is_conflict() => {
                let replay = match &request.plan_id {
                    Some(id) => self
                        .store
                        .get_plan(id)
                        .await?
                        .filter(|(p, _)| p.payer_id == request.payer_id),
                    None => None,
                };
                match replay {
                    Some(existing) => {
                        info!(plan_id = %plan_id, "plan create replayed for an existing plan");
                        Ok(existing)
                    }
                    None => Err(OrchestratorError::Conflict { entity_id: plan_id }),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_installment_plan(
        &self,
        plan_id: &str,
    ) -> OrchestratorResult<(InstallmentPlanRecord, Vec<InstallmentTrancheRecord>)> {
        self.store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| OrchestratorError::PlanNotFound {
                plan_id: plan_id.to_string(),
            })
    }

    // =========================================================================
    // Tranche Bookkeeping
    // =========================================================================

    async fn release_claim(&self, tranche_id: &str) {
        if let Err(e) = self.store.release_tranche(tranche_id).await {
            warn!(tranche_id = %tranche_id, error = %e, "failed to release tranche claim");
        }
    }

    /// Mark a tranche paid; the store completes the plan when it was the
    /// last one.
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

    /// Park a tranche whose driving order failed terminally. The sweep will
    /// not pick it up again without operator action.
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

    async fn read_back(&self, order_id: &str) -> OrchestratorResult<PaymentOrderRecord> {
        self.store
            .get_order(order_id)
            .await?
            .ok_or_else(|| OrchestratorError::OrderNotFound {
                order_id: order_id.to_string(),
            })
    }
}

// ============================================================================
// Tests
// ============================================================================
