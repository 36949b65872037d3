//! Refund workflow tests: submission against the capturing gateway, amount
//! guards, and asynchronous settlement through refund webhooks.

mod common;

use common::{payment_event_body, refund_event_body, RecordingSink, ScriptedGateway};
use std::sync::Arc;

use Coursepay_backend::database::models::PaymentOrderRecord;
use Coursepay_backend::database::{MemoryOrderStore, OrderStore};
use Coursepay_backend::gateways::{GatewayClient, GatewayError, GatewayRegistry};
use Coursepay_backend::services::{
    CreateOrderRequest, NotificationKind, OrchestratorConfig, PaymentOrchestrator,
    ReconciliationResult, RefundCoordinator, RefundError, WebhookReconciler,
};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct World {
    store: Arc<MemoryOrderStore>,
    sink: Arc<RecordingSink>,
    orchestrator: PaymentOrchestrator,
    reconciler: WebhookReconciler,
    refunds: RefundCoordinator,
}

fn world(gateways: Vec<Arc<dyn GatewayClient>>) -> World {
    let store = Arc::new(MemoryOrderStore::new());
    let sink = RecordingSink::new();
    let registry = Arc::new(GatewayRegistry::with_clients(gateways));
    let orchestrator = PaymentOrchestrator::new(
        store.clone(),
        registry.clone(),
        sink.clone(),
        OrchestratorConfig::default(),
    );
    let reconciler = WebhookReconciler::new(store.clone(), registry.clone(), sink.clone());
    let refunds = RefundCoordinator::new(store.clone(), registry, sink.clone());
    World {
        store,
        sink,
        orchestrator,
        reconciler,
        refunds,
    }
}

fn order_request(order_id: &str) -> CreateOrderRequest {
    CreateOrderRequest {
        order_id: Some(order_id.to_string()),
        payer_id: "payer-1".to_string(),
        subject_ref: "course-101".to_string(),
        amount_minor: 500_000,
        currency: "INR".to_string(),
        preferred_gateway: None,
        instrument_ref: None,
        tranche_id: None,
        metadata: None,
    }
}

/// Create an order and settle it paid through a webhook, returning the
/// settled row.
async fn settled_order(w: &World, order_id: &str) -> PaymentOrderRecord {
    let order = w
        .orchestrator
        .create_order(order_request(order_id))
        .await
        .expect("create");
    let gateway_ref = order.gateway_order_ref.expect("submitted");

    let body = payment_event_body(
        Some(&format!("evt-settle-{}", order_id)),
        &gateway_ref,
        "paid",
        Some(&format!("pay_{}", order_id)),
    );
    let gateway = order.gateway_name.expect("gateway on record");
    let result = w
        .reconciler
        .handle(&gateway, &body, None, None)
        .await
        .expect("settle");
    assert_eq!(result, ReconciliationResult::Applied);

    w.store.get_order(order_id).await.unwrap().unwrap()
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn refund_submits_to_the_gateway_that_captured_the_payment() {
    let razorpay = ScriptedGateway::accepting("razorpay");
    let cashfree = ScriptedGateway::accepting("cashfree");
    let w = world(vec![
        razorpay.clone() as Arc<dyn GatewayClient>,
        cashfree.clone(),
    ]);
    let order = settled_order(&w, "ord-rf").await;

    let refund = w
        .refunds
        .request_refund("ord-rf", 200_000, Some("duplicate charge".to_string()))
        .await
        .expect("refund accepted");

    assert_eq!(refund.status, "submitted");
    assert_eq!(refund.amount_minor, 200_000);
    assert_eq!(refund.reason.as_deref(), Some("duplicate charge"));
    assert_eq!(
        refund.gateway_refund_ref.as_deref(),
        Some(format!("rfnd_{}", refund.id).as_str())
    );

    // Only the capturing gateway was asked, with the captured payment ref.
    let calls = razorpay.refund_calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].gateway_order_ref, order.gateway_order_ref.unwrap());
    assert_eq!(calls[0].gateway_payment_ref.as_deref(), Some("pay_ord-rf"));
    assert_eq!(calls[0].amount_minor, 200_000);
    assert!(cashfree.refund_calls.lock().unwrap().is_empty());

    let gated = w.store.get_order("ord-rf").await.unwrap().unwrap();
    assert_eq!(gated.status, "refund_requested");
}

#[tokio::test]
async fn refund_amounts_are_validated_against_the_remaining_balance() {
    let razorpay = ScriptedGateway::accepting("razorpay");
    let w = world(vec![razorpay as Arc<dyn GatewayClient>]);
    settled_order(&w, "ord-val").await;

    let err = w
        .refunds
        .request_refund("ord-val", 0, None)
        .await
        .expect_err("zero amount");
    assert!(matches!(err, RefundError::InvalidAmount(0)));

    let err = w
        .refunds
        .request_refund("ord-val", 600_000, None)
        .await
        .expect_err("over the order amount");
    match err {
        RefundError::AmountExceeded {
            requested,
            remaining,
            ..
        } => {
            assert_eq!(requested, 600_000);
            assert_eq!(remaining, 500_000);
        }
        other => panic!("expected AmountExceeded, got {:?}", other),
    }

    // Neither rejection touched the order.
    let order = w.store.get_order("ord-val").await.unwrap().unwrap();
    assert_eq!(order.status, "succeeded");
}

#[tokio::test]
async fn only_settled_orders_can_be_refunded() {
    let razorpay = ScriptedGateway::accepting("razorpay");
    let w = world(vec![razorpay as Arc<dyn GatewayClient>]);
    w.orchestrator
        .create_order(order_request("ord-open"))
        .await
        .expect("create");

    let err = w
        .refunds
        .request_refund("ord-open", 100_000, None)
        .await
        .expect_err("still pending");
    match err {
        RefundError::NotRefundable { reason, .. } => assert!(reason.contains("pending")),
        other => panic!("expected NotRefundable, got {:?}", other),
    }

    let err = w
        .refunds
        .request_refund("ord-missing", 100_000, None)
        .await
        .expect_err("unknown order");
    assert!(matches!(err, RefundError::OrderNotFound(_)));
}

#[tokio::test]
async fn a_second_refund_while_one_is_open_is_rejected() {
    let razorpay = ScriptedGateway::accepting("razorpay");
    let w = world(vec![razorpay as Arc<dyn GatewayClient>]);
    settled_order(&w, "ord-twice").await;

    let first = w
        .refunds
        .request_refund("ord-twice", 100_000, None)
        .await
        .expect("first refund");

    let err = w
        .refunds
        .request_refund("ord-twice", 100_000, None)
        .await
        .expect_err("one refund at a time");
    match err {
        RefundError::NotRefundable { reason, .. } => assert!(reason.contains(&first.id)),
        other => panic!("expected NotRefundable, got {:?}", other),
    }
}

#[tokio::test]
async fn gateway_refusal_resolves_the_refund_failed_and_releases_the_order() {
    let razorpay = ScriptedGateway::accepting("razorpay");
    razorpay.push_refund(Err(GatewayError::rejected(
        "razorpay",
        Some("REFUND_WINDOW_CLOSED".to_string()),
        "refund refused",
    )));
    let w = world(vec![razorpay as Arc<dyn GatewayClient>]);
    settled_order(&w, "ord-refused").await;

    let err = w
        .refunds
        .request_refund("ord-refused", 100_000, None)
        .await
        .expect_err("gateway refused");
    assert!(matches!(err, RefundError::Gateway(_)));

    // The order is released for a later request and nothing stays open.
    let order = w.store.get_order("ord-refused").await.unwrap().unwrap();
    assert_eq!(order.status, "succeeded");
    assert_eq!(order.refunded_minor, 0);
    assert!(w
        .store
        .find_open_refund_for_order("ord-refused")
        .await
        .unwrap()
        .is_none());
    assert_eq!(w.sink.count(NotificationKind::RefundFailed), 1);

    // A fresh request now goes through on the empty script fallback.
    let retry = w
        .refunds
        .request_refund("ord-refused", 100_000, None)
        .await
        .expect("second attempt");
    assert_eq!(retry.status, "submitted");
}

// ---------------------------------------------------------------------------
// Webhook settlement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn partial_then_full_confirmations_walk_the_order_to_refunded() {
    let razorpay = ScriptedGateway::accepting("razorpay");
    let w = world(vec![razorpay as Arc<dyn GatewayClient>]);
    let order = settled_order(&w, "ord-walk").await;
    let gateway_ref = order.gateway_order_ref.clone().unwrap();

    // Partial refund of 200k out of 500k.
    let partial = w
        .refunds
        .request_refund("ord-walk", 200_000, None)
        .await
        .expect("partial refund");
    let body = refund_event_body(
        "evt-rf-1",
        partial.gateway_refund_ref.as_deref().unwrap(),
        &gateway_ref,
        "confirmed",
    );
    let result = w.reconciler.handle("razorpay", &body, None, None).await.expect("confirm");
    assert_eq!(result, ReconciliationResult::Applied);

    let released = w.store.get_order("ord-walk").await.unwrap().unwrap();
    assert_eq!(released.status, "succeeded");
    assert_eq!(released.refunded_minor, 200_000);
    assert_eq!(released.remaining_minor(), 300_000);
    assert_eq!(w.sink.count(NotificationKind::RefundConfirmed), 1);

    let partial = w.refunds.get_refund(&partial.id).await.expect("stored");
    assert_eq!(partial.status, "confirmed");
    assert!(partial.resolved_at.is_some());

    // The remainder empties the order, which parks it refunded.
    let rest = w
        .refunds
        .request_refund("ord-walk", 300_000, None)
        .await
        .expect("second refund");
    let body = refund_event_body(
        "evt-rf-2",
        rest.gateway_refund_ref.as_deref().unwrap(),
        &gateway_ref,
        "confirmed",
    );
    w.reconciler.handle("razorpay", &body, None, None).await.expect("confirm");

    let emptied = w.store.get_order("ord-walk").await.unwrap().unwrap();
    assert_eq!(emptied.status, "refunded");
    assert_eq!(emptied.refunded_minor, 500_000);
    assert_eq!(w.sink.count(NotificationKind::RefundConfirmed), 2);

    // Terminal: no further refunds.
    let err = w
        .refunds
        .request_refund("ord-walk", 1, None)
        .await
        .expect_err("order is refunded");
    assert!(matches!(err, RefundError::NotRefundable { .. }));
}

#[tokio::test]
async fn failed_refund_webhook_releases_the_order_without_crediting() {
    let razorpay = ScriptedGateway::accepting("razorpay");
    let w = world(vec![razorpay as Arc<dyn GatewayClient>]);
    let order = settled_order(&w, "ord-rfail").await;
    let gateway_ref = order.gateway_order_ref.clone().unwrap();

    let refund = w
        .refunds
        .request_refund("ord-rfail", 150_000, None)
        .await
        .expect("refund");
    let body = refund_event_body(
        "evt-rf-bad",
        refund.gateway_refund_ref.as_deref().unwrap(),
        &gateway_ref,
        "failed",
    );
    let result = w.reconciler.handle("razorpay", &body, None, None).await.expect("handled");
    assert_eq!(result, ReconciliationResult::Applied);

    let released = w.store.get_order("ord-rfail").await.unwrap().unwrap();
    assert_eq!(released.status, "succeeded");
    assert_eq!(released.refunded_minor, 0);
    assert_eq!(w.sink.count(NotificationKind::RefundFailed), 1);

    let resolved = w.refunds.get_refund(&refund.id).await.expect("stored");
    assert_eq!(resolved.status, "failed");

    // Released means requestable again.
    w.refunds
        .request_refund("ord-rfail", 150_000, None)
        .await
        .expect("second attempt");
}

#[tokio::test]
async fn replayed_confirmation_does_not_credit_twice() {
    let razorpay = ScriptedGateway::accepting("razorpay");
    let w = world(vec![razorpay as Arc<dyn GatewayClient>]);
    let order = settled_order(&w, "ord-replay").await;
    let gateway_ref = order.gateway_order_ref.clone().unwrap();

    let refund = w
        .refunds
        .request_refund("ord-replay", 200_000, None)
        .await
        .expect("refund");
    let body = refund_event_body(
        "evt-rf-dup",
        refund.gateway_refund_ref.as_deref().unwrap(),
        &gateway_ref,
        "confirmed",
    );

    w.reconciler.handle("razorpay", &body, None, None).await.expect("confirm");
    let ledgered = w.store.webhook_event_count().await;

    let replay = w.reconciler.handle("razorpay", &body, None, None).await.expect("replay");
    assert_eq!(replay, ReconciliationResult::AlreadyProcessed);
    assert_eq!(w.store.webhook_event_count().await, ledgered);

    let current = w.store.get_order("ord-replay").await.unwrap().unwrap();
    assert_eq!(current.refunded_minor, 200_000);
    assert_eq!(w.sink.count(NotificationKind::RefundConfirmed), 1);
}

#[tokio::test]
async fn terminal_report_under_a_fresh_event_id_is_ledgered_stale() {
    let razorpay = ScriptedGateway::accepting("razorpay");
    let w = world(vec![razorpay as Arc<dyn GatewayClient>]);
    let order = settled_order(&w, "ord-stale").await;
    let gateway_ref = order.gateway_order_ref.clone().unwrap();

    let refund = w
        .refunds
        .request_refund("ord-stale", 500_000, None)
        .await
        .expect("refund");
    let rfnd_ref = refund.gateway_refund_ref.clone().unwrap();

    let body = refund_event_body("evt-rf-1", &rfnd_ref, &gateway_ref, "confirmed");
    w.reconciler.handle("razorpay", &body, None, None).await.expect("confirm");

    // The provider re-reports the terminal outcome under a new event id.
    let body = refund_event_body("evt-rf-2", &rfnd_ref, &gateway_ref, "confirmed");
    let result = w.reconciler.handle("razorpay", &body, None, None).await.expect("handled");
    assert_eq!(result, ReconciliationResult::Stale);

    let current = w.store.get_order("ord-stale").await.unwrap().unwrap();
    assert_eq!(current.status, "refunded");
    assert_eq!(current.refunded_minor, 500_000);
    assert_eq!(w.sink.count(NotificationKind::RefundConfirmed), 1);
}

#[tokio::test]
async fn refund_report_for_an_unknown_refund_is_recorded_for_review() {
    let razorpay = ScriptedGateway::accepting("razorpay");
    let w = world(vec![razorpay as Arc<dyn GatewayClient>]);

    let body = refund_event_body("evt-rf-ghost", "rfnd_ghost", "razorpay_ghost", "confirmed");
    let result = w.reconciler.handle("razorpay", &body, None, None).await.expect("handled");
    assert_eq!(result, ReconciliationResult::UnknownOrder);

    let orphans = w.store.orphan_events().await;
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].gateway_order_ref, "razorpay_ghost");
}
