//! Services module for order orchestration and gateway workflows

pub mod notification;
pub mod payment_orchestrator;
pub mod refund_coordinator;
pub mod webhook_reconciler;

// Re-export the types the API layer and workers consume
pub use crate::services::notification::{
    NotificationKind, NotificationSink, TracingNotificationSink,
};
pub use crate::services::payment_orchestrator::{
    CreateOrderRequest, CreatePlanRequest, OrchestratorConfig, OrchestratorError,
    OrchestratorResult, OrderStatus, PaymentOrchestrator, PlanTrancheRequest,
};
pub use crate::services::refund_coordinator::{RefundCoordinator, RefundError, RefundResult};
pub use crate::services::webhook_reconciler::{
    ReconcilerError, ReconciliationResult, WebhookReconciler,
};
