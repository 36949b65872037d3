//! HTTP middleware: error responses and request logging

pub mod error;
pub mod logging;
