//! Gateway webhook intake
//!
//! Raw-body endpoint for provider push notifications. Providers redeliver
//! until they see a 2xx, so this handler returns success only after the
//! reconciler has either applied the event or confirmed an intentional
//! no-op; transient outcomes get a retryable status instead.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::services::webhook_reconciler::{
    ReconcilerError, ReconciliationResult, WebhookReconciler,
};

pub struct WebhookState {
    pub reconciler: Arc<WebhookReconciler>,
}

/// POST /webhooks/{gateway}
pub async fn handle_webhook(
    State(state): State<Arc<WebhookState>>,
    Path(gateway): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    info!(gateway = %gateway, bytes = body.len(), "received webhook");

    // Each provider names its signature headers differently; the adapters
    // decide what a missing value means.
    let (signature, timestamp) = extract_signature_headers(&gateway, &headers);

    let outcome = state
        .reconciler
        .handle(&gateway, &body, signature.as_deref(), timestamp.as_deref())
        .await;

    match outcome {
        Ok(ReconciliationResult::UnknownOrder) => {
            // The order may simply not be visible yet; a redelivery can land.
            warn!(gateway = %gateway, "webhook did not match a known order");
            (StatusCode::SERVICE_UNAVAILABLE, "Unknown order").into_response()
        }
        Ok(result) => {
            let status = match result {
                ReconciliationResult::Applied => "applied",
                ReconciliationResult::AlreadyProcessed => "already_processed",
                ReconciliationResult::Ignored => "ignored",
                ReconciliationResult::Stale => "stale",
                ReconciliationResult::UnknownOrder => unreachable!(),
            };
            info!(gateway = %gateway, status = status, "webhook handled");
            (StatusCode::OK, Json(json!({ "status": status }))).into_response()
        }
        Err(ReconcilerError::UnknownGateway(name)) => {
            warn!(gateway = %name, "webhook for unknown gateway");
            (StatusCode::NOT_FOUND, "Unknown gateway").into_response()
        }
        Err(ReconcilerError::InvalidSignature(_)) => {
            warn!(gateway = %gateway, "invalid webhook signature");
            (StatusCode::UNAUTHORIZED, "Invalid signature").into_response()
        }
        Err(ReconcilerError::MalformedPayload(e)) => {
            error!(gateway = %gateway, error = %e, "malformed webhook payload");
            (StatusCode::BAD_REQUEST, "Malformed payload").into_response()
        }
        Err(e @ ReconcilerError::Conflict { .. }) => {
            warn!(gateway = %gateway, error = %e, "webhook lost a write race, awaiting redelivery");
            (StatusCode::SERVICE_UNAVAILABLE, "Conflict, retry").into_response()
        }
        Err(ReconcilerError::Storage(e)) => {
            error!(gateway = %gateway, error = %e, "storage failure during webhook handling");
            (StatusCode::INTERNAL_SERVER_ERROR, "Storage failure").into_response()
        }
    }
}

fn extract_signature_headers(
    gateway: &str,
    headers: &HeaderMap,
) -> (Option<String>, Option<String>) {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };

    match gateway {
        "razorpay" => (header("x-razorpay-signature"), None),
        "cashfree" => (
            header("x-webhook-signature"),
            header("x-webhook-timestamp"),
        ),
        _ => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn signature_headers_are_provider_specific() {
        let mut headers = HeaderMap::new();
        headers.insert("x-razorpay-signature", HeaderValue::from_static("sig-a"));
        headers.insert("x-webhook-signature", HeaderValue::from_static("sig-b"));
        headers.insert("x-webhook-timestamp", HeaderValue::from_static("12345"));

        let (sig, ts) = extract_signature_headers("razorpay", &headers);
        assert_eq!(sig.as_deref(), Some("sig-a"));
        assert!(ts.is_none());

        let (sig, ts) = extract_signature_headers("cashfree", &headers);
        assert_eq!(sig.as_deref(), Some("sig-b"));
        assert_eq!(ts.as_deref(), Some("12345"));

        let (sig, ts) = extract_signature_headers("stripe", &headers);
        assert!(sig.is_none() && ts.is_none());
    }
}
