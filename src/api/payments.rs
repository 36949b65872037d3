//! Payment orders API
//!
//! HTTP surface over the orchestrator and refund coordinator: order
//! creation, status reads, user-initiated sync, refunds, and installment
//! plans.

use crate::database::models::{
    InstallmentPlanRecord, InstallmentTrancheRecord, PaymentOrderRecord, RefundRecord,
};
use crate::error::AppError;
use crate::middleware::error::get_request_id_from_headers;
use crate::services::payment_orchestrator::{
    CreateOrderRequest, CreatePlanRequest, PaymentOrchestrator,
};
use crate::services::refund_coordinator::RefundCoordinator;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct PaymentApiState {
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub refunds: Arc<RefundCoordinator>,
}

fn tag_request(err: AppError, request_id: Option<String>) -> AppError {
    match request_id {
        Some(req_id) => err.with_request_id(req_id),
        None => err,
    }
}

/// POST /payments/orders
pub async fn create_order(
    State(state): State<PaymentApiState>,
    headers: HeaderMap,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<PaymentOrderRecord>), AppError> {
    let request_id = get_request_id_from_headers(&headers);
    info!(
        payer_id = %request.payer_id,
        subject_ref = %request.subject_ref,
        amount_minor = request.amount_minor,
        "order creation requested"
    );

    match state.orchestrator.create_order(request).await {
        Ok(order) => Ok((StatusCode::CREATED, Json(order))),
        Err(e) => Err(tag_request(e.into(), request_id)),
    }
}

/// GET /payments/orders/{id}
pub async fn get_order(
    State(state): State<PaymentApiState>,
    headers: HeaderMap,
    Path(order_id): Path<String>,
) -> Result<Json<PaymentOrderRecord>, AppError> {
    let request_id = get_request_id_from_headers(&headers);
    match state.orchestrator.get_order(&order_id).await {
        Ok(order) => Ok(Json(order)),
        Err(e) => Err(tag_request(e.into(), request_id)),
    }
}

/// POST /payments/orders/{id}/sync
///
/// User-initiated reconciliation: ask the owning gateway for the current
/// payment status and apply it if the stored state is behind.
pub async fn sync_order(
    State(state): State<PaymentApiState>,
    headers: HeaderMap,
    Path(order_id): Path<String>,
) -> Result<Json<PaymentOrderRecord>, AppError> {
    let request_id = get_request_id_from_headers(&headers);
    info!(order_id = %order_id, "order sync requested");

    match state.orchestrator.sync_order(&order_id).await {
        Ok(order) => Ok(Json(order)),
        Err(e) => Err(tag_request(e.into(), request_id)),
    }
}

#[derive(Debug, Deserialize)]
pub struct RefundApiRequest {
    pub amount_minor: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /payments/orders/{id}/refund
pub async fn request_refund(
    State(state): State<PaymentApiState>,
    headers: HeaderMap,
    Path(order_id): Path<String>,
    Json(request): Json<RefundApiRequest>,
) -> Result<(StatusCode, Json<RefundRecord>), AppError> {
    let request_id = get_request_id_from_headers(&headers);
    info!(
        order_id = %order_id,
        amount_minor = request.amount_minor,
        "refund requested"
    );

    match state
        .refunds
        .request_refund(&order_id, request.amount_minor, request.reason)
        .await
    {
        // Settlement arrives by webhook, so the request is only accepted here.
        Ok(refund) => Ok((StatusCode::ACCEPTED, Json(refund))),
        Err(e) => Err(tag_request(e.into(), request_id)),
    }
}

#[derive(Debug, Serialize)]
pub struct PlanResponse {
    pub plan: InstallmentPlanRecord,
    pub tranches: Vec<InstallmentTrancheRecord>,
}

/// POST /payments/installments
pub async fn create_installment_plan(
    State(state): State<PaymentApiState>,
    headers: HeaderMap,
    Json(request): Json<CreatePlanRequest>,
) -> Result<(StatusCode, Json<PlanResponse>), AppError> {
    let request_id = get_request_id_from_headers(&headers);
    info!(
        payer_id = %request.payer_id,
        tranches = request.tranches.len(),
        auto_debit = request.auto_debit,
        "installment plan requested"
    );

    match state.orchestrator.create_installment_plan(request).await {
        Ok((plan, tranches)) => Ok((StatusCode::CREATED, Json(PlanResponse { plan, tranches }))),
        Err(e) => Err(tag_request(e.into(), request_id)),
    }
}

/// GET /payments/installments/{id}
pub async fn get_installment_plan(
    State(state): State<PaymentApiState>,
    headers: HeaderMap,
    Path(plan_id): Path<String>,
) -> Result<Json<PlanResponse>, AppError> {
    let request_id = get_request_id_from_headers(&headers);
    match state.orchestrator.get_installment_plan(&plan_id).await {
        Ok((plan, tranches)) => Ok(Json(PlanResponse { plan, tranches })),
        Err(e) => Err(tag_request(e.into(), request_id)),
    }
}
