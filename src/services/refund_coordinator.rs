//! Refund Coordinator
//!
//! Drives the refund sub-workflow against the gateway that settled the
//! original payment. A request is validated against the order, recorded,
//! and submitted; confirmation arrives through the webhook reconciler. A
//! synchronous gateway failure resolves the request failed with no retry,
//! re-submitting is a human decision.

use crate::database::error::DatabaseError;
use crate::database::models::{
    NewRefund, OrderTransition, PaymentOrderRecord, RefundRecord, RefundResolution, refund_status,
};
use crate::database::store::OrderStore;
use crate::error::{AppError, AppErrorKind, DomainError, ValidationError};
use crate::gateways::{
    GatewayClient, GatewayError, GatewayName, GatewayRefundRequest, GatewayRegistry,
};
use crate::services::notification::{NotificationKind, NotificationSink};
use crate::services::payment_orchestrator::OrderStatus;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

// =============================================================================
// Refund Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum RefundError {
    #[error("Order not found: {0}")]
    OrderNotFound(String),
    #[error("Refund not found: {0}")]
    RefundNotFound(String),
    #[error("Invalid refund amount: {0}")]
    InvalidAmount(i64),
    #[error("Order {order_id} cannot accept a refund: {reason}")]
    NotRefundable { order_id: String, reason: String },
    #[error("Refund of {requested} exceeds the {remaining} remaining on order {order_id}")]
    AmountExceeded {
        order_id: String,
        requested: i64,
        remaining: i64,
    },
    #[error("Order {0} was modified concurrently")]
    Conflict(String),
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
}

impl From<RefundError> for AppError {
    fn from(e: RefundError) -> Self {
        match e {
            RefundError::OrderNotFound(order_id) => {
                AppError::new(AppErrorKind::Domain(DomainError::OrderNotFound { order_id }))
            }
            RefundError::RefundNotFound(refund_id) => {
                AppError::new(AppErrorKind::Domain(DomainError::RefundNotFound { refund_id }))
            }
            RefundError::InvalidAmount(amount) => {
                AppError::new(AppErrorKind::Validation(ValidationError::InvalidAmount {
                    amount: amount.to_string(),
                    reason: "refund amount must be positive".to_string(),
                }))
            }
            RefundError::NotRefundable { order_id, reason } => {
                AppError::new(AppErrorKind::Domain(DomainError::RefundNotAllowed {
                    order_id,
                    reason,
                }))
            }
            RefundError::AmountExceeded {
                order_id,
                requested,
                remaining,
            } => AppError::new(AppErrorKind::Domain(DomainError::RefundAmountExceeded {
                order_id,
                requested,
                remaining,
            })),
            RefundError::Conflict(entity_id) => {
                AppError::new(AppErrorKind::Domain(DomainError::Conflict { entity_id }))
            }
            RefundError::Gateway(e) => e.into(),
            RefundError::Storage(e) => e.into(),
        }
    }
}

pub type RefundResult<T> = Result<T, RefundError>;

// =============================================================================
// Refund Coordinator
// =============================================================================

pub struct RefundCoordinator {
    store: Arc<dyn OrderStore>,
    registry: Arc<GatewayRegistry>,
    notifier: Arc<dyn NotificationSink>,
}

impl RefundCoordinator {
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

    /// Open a refund against a settled order and submit it to the gateway
    /// that captured the payment.
    ///
    /// The order is gated to `refund_requested` before the gateway call, so
    /// a second request (and any concurrent payment write) loses the
    /// conditional update instead of double-spending. The returned record is
    /// `submitted` on the happy path; final settlement comes by webhook.
    pub async fn request_refund(
        &self,
        order_id: &str,
        amount_minor: i64,
        reason: Option<String>,
    ) -> RefundResult<RefundRecord> {
        if amount_minor <= 0 {
            return Err(RefundError::InvalidAmount(amount_minor));
        }

        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| RefundError::OrderNotFound(order_id.to_string()))?;

        if order.status == OrderStatus::RefundRequested.to_db_status() {
            let reason = match self.store.find_open_refund_for_order(&order.id).await? {
                Some(open) => format!("refund {} is already in flight", open.id),
                None => "a refund is already in flight".to_string(),
            };
            return Err(RefundError::NotRefundable {
                order_id: order.id,
                reason,
            });
        }
        if order.status != OrderStatus::Succeeded.to_db_status() {
            return Err(RefundError::NotRefundable {
                order_id: order.id,
                reason: format!("order is {}", order.status),
            });
        }

        let remaining = order.amount_minor - order.refunded_minor;
        if amount_minor > remaining {
            return Err(RefundError::AmountExceeded {
                order_id: order.id,
                requested: amount_minor,
                remaining,
            });
        }

        // Resolve the owning gateway up front. Nothing has been written yet,
        // so a misconfigured order fails the request cleanly.
        let gateway_name = order.gateway_name.clone().ok_or_else(|| {
            RefundError::NotRefundable {
                order_id: order.id.clone(),
                reason: "order has no gateway on record".to_string(),
            }
        })?;
        let gateway_order_ref = order.gateway_order_ref.clone().ok_or_else(|| {
            RefundError::NotRefundable {
                order_id: order.id.clone(),
                reason: "order has no gateway order reference".to_string(),
            }
        })?;
        let client = self
            .registry
            .get(&GatewayName::new(&gateway_name))
            .ok_or_else(|| RefundError::NotRefundable {
                order_id: order.id.clone(),
                reason: format!("gateway {} is not configured", gateway_name),
            })?;

        let refund = self
            .store
            .insert_refund(NewRefund {
                id: Uuid::new_v4().to_string(),
                order_id: order.id.clone(),
                amount_minor,
                reason,
            })
            .await?;

        let mut gate = OrderTransition::new(
            &order.id,
            &order.status,
            order.attempt,
            OrderStatus::RefundRequested.to_db_status(),
        );
        gate.history_entry = Some(json!({
            "attempt": order.attempt,
            "outcome": "refund_requested",
            "refund_id": refund.id,
            "amount_minor": amount_minor,
            "at": Utc::now().to_rfc3339(),
        }));

        let Some(gated) = self.store.transition_order(gate).await? else {
            // Another writer moved the order between the read and the gate.
            // The fresh refund row must not stay open with nothing driving it.
            self.resolve_failed(&refund.id, None, "lost a concurrent update before submission")
                .await?;
            return Err(RefundError::Conflict(order.id));
        };

        info!(
            order_id = %gated.id,
            refund_id = %refund.id,
            amount_minor = amount_minor,
            gateway = %gateway_name,
            "refund requested"
        );

        self.submit(client, gated, refund, gateway_order_ref).await
    }

    pub async fn get_refund(&self, refund_id: &str) -> RefundResult<RefundRecord> {
        self.store
            .get_refund(refund_id)
            .await?
            .ok_or_else(|| RefundError::RefundNotFound(refund_id.to_string()))
    }

    // =========================================================================
    // Gateway Submission
    // =========================================================================

    async fn submit(
        &self,
        client: Arc<dyn GatewayClient>,
        order: PaymentOrderRecord,
        refund: RefundRecord,
        gateway_order_ref: String,
    ) -> RefundResult<RefundRecord> {
        let request = GatewayRefundRequest {
            refund_id: refund.id.clone(),
            gateway_order_ref,
            gateway_payment_ref: order.gateway_payment_ref.clone(),
            amount_minor: refund.amount_minor,
        };

        match client.submit_refund(request).await {
            Ok(submission) => {
                self.store
                    .set_refund_submission(
                        &refund.id,
                        &submission.gateway_refund_ref,
                        &submission.provider_status,
                    )
                    .await?;
                info!(
                    refund_id = %refund.id,
                    gateway_refund_ref = %submission.gateway_refund_ref,
                    provider_status = %submission.provider_status,
                    "refund submitted, awaiting gateway confirmation"
                );
                self.get_refund(&refund.id).await
            }
            Err(e) => {
                error!(
                    refund_id = %refund.id,
                    order_id = %order.id,
                    error = %e,
                    "gateway refused refund submission, resolving failed"
                );
                let release = self.release_transition(&order, &refund);
                self.resolve_failed(&refund.id, Some(release), &e.to_string())
                    .await?;
                if let Some(current) = self.store.get_order(&order.id).await? {
                    self.notifier
                        .notify(
                            NotificationKind::RefundFailed,
                            &current,
                            "refund could not be submitted to the gateway",
                        )
                        .await;
                }
                Err(RefundError::Gateway(e))
            }
        }
    }

    /// Put the order back in `succeeded` so a later request can be made.
    fn release_transition(
        &self,
        order: &PaymentOrderRecord,
        refund: &RefundRecord,
    ) -> OrderTransition {
        let mut t = OrderTransition::new(
            &order.id,
            OrderStatus::RefundRequested.to_db_status(),
            order.attempt,
            OrderStatus::Succeeded.to_db_status(),
        );
        t.history_entry = Some(json!({
            "attempt": order.attempt,
            "outcome": "refund_submit_failed",
            "refund_id": refund.id,
            "at": Utc::now().to_rfc3339(),
        }));
        t
    }

    async fn resolve_failed(
        &self,
        refund_id: &str,
        release: Option<OrderTransition>,
        detail: &str,
    ) -> RefundResult<()> {
        let resolution = RefundResolution {
            refund_id: refund_id.to_string(),
            new_status: refund_status::FAILED.to_string(),
            gateway_refund_ref: None,
            failure_reason: Some(detail.to_string()),
        };
        match self.store.resolve_refund(resolution, release).await? {
            Some(_) => Ok(()),
            None => {
                // The refund or the order moved under us; leave it for the
                // reconciler or an operator.
                warn!(refund_id = %refund_id, "refund could not be resolved failed, state moved");
                Ok(())
            }
        }
    }
}
