//! Payer-facing notification fan-out for terminal payment outcomes.

use crate::database::models::PaymentOrderRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    OrderSucceeded,
    OrderFailed,
    RefundConfirmed,
    RefundFailed,
}

/// Receives exactly one call per terminal outcome of an order or refund.
/// Callers only notify on transitions they actually applied, so replays and
/// lost races never reach the sink.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, kind: NotificationKind, order: &PaymentOrderRecord, message: &str);
}

/// Default sink: structured log lines until a real channel (email, SMS,
/// push) is wired up.
#[derive(Default)]
pub struct TracingNotificationSink;

impl TracingNotificationSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn notify(&self, kind: NotificationKind, order: &PaymentOrderRecord, message: &str) {
        match kind {
            NotificationKind::OrderSucceeded => {
                info!(
                    order_id = %order.id,
                    payer = %order.payer_id,
                    amount = %order.amount_minor,
                    currency = %order.currency,
                    "🔔 NOTIFICATION: Payment Succeeded - {}", message
                );
            }
            NotificationKind::OrderFailed => {
                error!(
                    order_id = %order.id,
                    payer = %order.payer_id,
                    "🔔 NOTIFICATION: Payment Failed - {}", message
                );
            }
            NotificationKind::RefundConfirmed => {
                info!(
                    order_id = %order.id,
                    payer = %order.payer_id,
                    refunded = %order.refunded_minor,
                    currency = %order.currency,
                    "🔔 NOTIFICATION: Refund Confirmed - {}", message
                );
            }
            NotificationKind::RefundFailed => {
                error!(
                    order_id = %order.id,
                    payer = %order.payer_id,
                    "🔔 NOTIFICATION: Refund Failed - {}", message
                );
            }
        }
    }
}
