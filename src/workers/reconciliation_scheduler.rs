//! Reconciliation scheduler.
//!
//! Periodic loop with two duties per tick: re-drive orders parked in
//! `transient_failed` once their backoff window has passed, and raise
//! auto-debit orders for installment tranches that have come due. Every
//! mutation goes through the same conditional updates the request path
//! uses, so an overlapping tick loses the write and skips instead of
//! double-driving an order.

use crate::database::models::{DueTranche, PaymentOrderRecord};
use crate::database::store::OrderStore;
use crate::services::payment_orchestrator::{
    CreateOrderRequest, OrchestratorError, OrderStatus, PaymentOrchestrator,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Whether main spawns the loop at all.
    pub enabled: bool,
    /// How often the scheduler wakes up to sweep.
    pub tick_interval: Duration,
    /// Maximum `transient_failed` orders examined per tick.
    pub retry_batch: i64,
    /// Maximum due tranches examined per tick.
    pub installment_batch: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval: Duration::from_secs(60),
            retry_batch: 100,
            installment_batch: 100,
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.enabled = std::env::var("SCHEDULER_ENABLED")
            .ok()
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(cfg.enabled);
        cfg.tick_interval = Duration::from_secs(
            std::env::var("SCHEDULER_TICK_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.tick_interval.as_secs()),
        );
        cfg.retry_batch = std::env::var("SCHEDULER_RETRY_BATCH")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(cfg.retry_batch);
        cfg.installment_batch = std::env::var("SCHEDULER_INSTALLMENT_BATCH")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(cfg.installment_batch);
        cfg
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct ReconciliationScheduler {
    store: Arc<dyn OrderStore>,
    orchestrator: Arc<PaymentOrchestrator>,
    config: SchedulerConfig,
}

impl ReconciliationScheduler {
    pub fn new(
        store: Arc<dyn OrderStore>,
        orchestrator: Arc<PaymentOrchestrator>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            orchestrator,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            tick_secs = self.config.tick_interval.as_secs(),
            retry_batch = self.config.retry_batch,
            installment_batch = self.config.installment_batch,
            "reconciliation scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("reconciliation scheduler stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.tick_interval) => {
                    if let Err(e) = self.run_cycle().await {
                        warn!(error = %e, "reconciliation cycle failed");
                    }
                }
            }
        }

        info!("reconciliation scheduler stopped");
    }

    async fn run_cycle(&self) -> anyhow::Result<()> {
        self.retry_sweep().await?;
        self.installment_sweep().await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Retry sweep
    // -----------------------------------------------------------------------

    async fn retry_sweep(&self) -> anyhow::Result<()> {
        let candidates = self
            .store
            .list_retry_candidates(self.config.retry_batch)
            .await?;
        if candidates.is_empty() {
            return Ok(());
        }

        let cfg = self.orchestrator.config();
        let (max_attempts, base_secs, cap_secs) =
            (cfg.max_attempts, cfg.backoff_base_secs, cfg.backoff_cap_secs);
        let now = Utc::now();
        let mut retried = 0usize;
        let mut parked = 0usize;
        let mut waiting = 0usize;

        for order in candidates {
            let attempt = order.attempt.max(0) as u32;
            // Over-ceiling orders go straight to the orchestrator so they get
            // parked instead of waiting out a backoff that will never fire.
            if attempt < max_attempts && !is_due_for_retry(&order, base_secs, cap_secs, now) {
                waiting += 1;
                continue;
            }

            match self.orchestrator.retry_order(&order.id).await {
                Ok(updated) if updated.status == OrderStatus::HardFailed.to_db_status() => {
                    parked += 1;
                }
                Ok(_) => retried += 1,
                Err(OrchestratorError::NoGatewayAvailable { .. }) => {
                    // Attempt counted against the ceiling; the order stays
                    // transient_failed with a fresh transition time.
                    retried += 1;
                }
                Err(OrchestratorError::Gateway(_)) => {
                    // Rejected mid-drive; the orchestrator already parked it.
                    parked += 1;
                }
                Err(e) => {
                    warn!(order_id = %order.id, error = %e, "retry attempt failed");
                }
            }
        }

        if retried > 0 || parked > 0 {
            info!(retried, parked, waiting, "retry sweep finished");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Installment sweep
    // -----------------------------------------------------------------------

    async fn installment_sweep(&self) -> anyhow::Result<()> {
        let due = self
            .store
            .list_due_tranches(Utc::now(), self.config.installment_batch)
            .await?;
        if due.is_empty() {
            return Ok(());
        }

        let mut debited = 0usize;
        let mut busy = 0usize;

        for DueTranche { tranche, plan } in due {
            let request = CreateOrderRequest {
                order_id: None,
                payer_id: plan.payer_id.clone(),
                subject_ref: plan.subject_ref.clone(),
                amount_minor: tranche.amount_minor,
                currency: plan.currency.clone(),
                preferred_gateway: None,
                instrument_ref: plan.instrument_ref.clone(),
                tranche_id: Some(tranche.id.clone()),
                metadata: Some(json!({
                    "plan_id": plan.id,
                    "tranche_seq": tranche.seq,
                })),
            };

            match self.orchestrator.create_order(request).await {
                Ok(order) => {
                    debited += 1;
                    info!(
                        tranche_id = %tranche.id,
                        plan_id = %plan.id,
                        seq = tranche.seq,
                        order_id = %order.id,
                        "auto-debit order created for due tranche"
                    );
                }
                Err(OrchestratorError::TrancheBusy { .. }) => {
                    // An overlapping tick claimed it first.
                    busy += 1;
                }
                Err(OrchestratorError::NoGatewayAvailable { .. }) => {
                    warn!(
                        tranche_id = %tranche.id,
                        plan_id = %plan.id,
                        "no gateway accepted the auto-debit, tranche released for the next sweep"
                    );
                }
                Err(OrchestratorError::Gateway(e)) => {
                    warn!(
                        tranche_id = %tranche.id,
                        plan_id = %plan.id,
                        error = %e,
                        "gateway rejected the auto-debit, tranche suspended"
                    );
                }
                Err(e) => {
                    warn!(tranche_id = %tranche.id, error = %e, "auto-debit attempt failed");
                }
            }
        }

        if debited > 0 || busy > 0 {
            info!(debited, busy, "installment sweep finished");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Backoff helpers
// ---------------------------------------------------------------------------

/// Delay a `transient_failed` order must wait before retry attempt
/// `attempt + 1`. Doubles per completed attempt from `base_secs`, capped at
/// `cap_secs`.
pub fn backoff_delay(attempt: u32, base_secs: u64, cap_secs: u64) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    let delay = base_secs.saturating_mul(1u64 << exp);
    Duration::from_secs(delay.min(cap_secs))
}

/// Returns `true` once `last_transition_at` is older than the backoff window
/// for the order's attempt count.
fn is_due_for_retry(
    order: &PaymentOrderRecord,
    base_secs: u64,
    cap_secs: u64,
    now: DateTime<Utc>,
) -> bool {
    let attempt = order.attempt.max(0) as u32;
    let delay = backoff_delay(attempt, base_secs, cap_secs);
    let elapsed = now - order.last_transition_at;
    elapsed.to_std().map(|d| d >= delay).unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
