//! HTTP handlers, grouped by surface

pub mod payments;
pub mod webhooks;
