pub mod reconciliation_scheduler;

pub use reconciliation_scheduler::{backoff_delay, ReconciliationScheduler, SchedulerConfig};
