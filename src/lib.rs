//! Coursepay backend library
//!
//! Payment order orchestration over interchangeable gateway providers:
//! order creation with failover, webhook reconciliation, refunds, and
//! installment auto-debits.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod gateways;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod services;
pub mod workers;
