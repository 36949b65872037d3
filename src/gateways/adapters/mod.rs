//! Concrete gateway clients.
//!
//! Each adapter owns one provider's wire format, credentials, and webhook
//! signature scheme, and exposes nothing but the `GatewayClient` surface.

pub mod cashfree;
pub mod razorpay;

pub use cashfree::{CashfreeConfig, CashfreeGateway, CASHFREE};
pub use razorpay::{RazorpayConfig, RazorpayGateway, RAZORPAY};
