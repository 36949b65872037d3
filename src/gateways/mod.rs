//! Payment gateway integration layer.
//!
//! Everything provider-specific lives behind the [`GatewayClient`] trait:
//! adapters normalize wire formats, statuses, and webhook payloads at this
//! boundary, and the rest of the service reasons only about the closed
//! [`GatewayError`] taxonomy.

pub mod adapters;
pub mod client;
pub mod error;
pub mod registry;
pub mod types;
pub mod utils;

pub use client::GatewayClient;
pub use error::{GatewayError, GatewayResult};
pub use registry::GatewayRegistry;
pub use types::{
    GatewayName, GatewayOrderHandle, GatewayOrderRequest, GatewayPaymentStatus,
    GatewayRefundOutcome, GatewayRefundRequest, GatewayStatusSnapshot, GatewayWebhook,
    RefundSubmission, SignatureCheck, WebhookKind,
};
