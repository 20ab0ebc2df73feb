//! Stale-Resource Reaper
//!
//! Periodic sweeps that force timeout transitions:
//! 1. Cancel transactions still `pending` after the pending timeout
//! 2. Delete abandoned deposit requests after the deposit timeout
//! 3. Complete shipped transactions whose dispute window elapsed
//!
//! Deadlines are wall-clock values checked on each run; there is no
//! per-transaction timer. Every sweep is a conditional update per row, so
//! overlapping runs never act on the same row twice.

use chrono::Duration;
use serde::Serialize;
use std::sync::Arc;
use tokio::{sync::watch, task::JoinHandle, time::interval};
use tracing::{error, info};

use crate::{
    config::ReaperConfig, deposits::DepositService, time::TimeSource,
    transaction_manager::TransactionManager, EscrowResult,
};

/// Rows affected by one reaper run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub cancelled_transactions: usize,
    pub purged_deposits: usize,
    pub completed_transactions: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.cancelled_transactions + self.purged_deposits + self.completed_transactions
    }
}

pub struct StaleResourceReaper {
    config: ReaperConfig,
    manager: Arc<TransactionManager>,
    deposits: Arc<DepositService>,
    time: Arc<dyn TimeSource>,
}

impl StaleResourceReaper {
    pub fn new(
        config: ReaperConfig,
        manager: Arc<TransactionManager>,
        deposits: Arc<DepositService>,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            config,
            manager,
            deposits,
            time,
        }
    }

    /// Cancel pending transactions older than the pending timeout
    pub async fn sweep_stale_transactions(&self) -> EscrowResult<usize> {
        let cutoff = self.time.now() - Duration::minutes(self.config.pending_timeout_minutes);
        let cancelled = self.manager.cancel_stale_pending(cutoff).await?;
        if !cancelled.is_empty() {
            info!(count = cancelled.len(), %cutoff, "Cancelled stale pending transactions");
        }
        Ok(cancelled.len())
    }

    /// Delete abandoned deposits older than the deposit timeout
    pub async fn sweep_stale_deposits(&self) -> usize {
        let cutoff = self.time.now() - Duration::minutes(self.config.deposit_timeout_minutes);
        let purged = self
            .deposits
            .purge_stale(cutoff, self.config.deposit_policy)
            .await;
        if purged > 0 {
            info!(
                count = purged,
                policy = ?self.config.deposit_policy,
                "Purged stale deposits"
            );
        }
        purged
    }

    /// Settle shipped transactions nobody disputed in time
    pub async fn sweep_elapsed_dispute_windows(&self) -> EscrowResult<usize> {
        let completed = self
            .manager
            .complete_elapsed_shipping(self.time.now())
            .await?;
        if !completed.is_empty() {
            info!(count = completed.len(), "Auto-completed transactions after dispute window");
        }
        Ok(completed.len())
    }

    /// Run every sweep once. A failing sweep is logged and does not stop
    /// the others.
    pub async fn run_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.sweep_stale_transactions().await {
            Ok(count) => report.cancelled_transactions = count,
            Err(e) => error!(error = %e, "Stale transaction sweep failed"),
        }

        report.purged_deposits = self.sweep_stale_deposits().await;

        if self.config.auto_complete_shipping {
            match self.sweep_elapsed_dispute_windows().await {
                Ok(count) => report.completed_transactions = count,
                Err(e) => error!(error = %e, "Dispute window sweep failed"),
            }
        }

        report
    }

    /// Run the sweeps on the configured interval until `shutdown` flips
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let interval_secs = self.config.interval_secs.max(1);
            info!(
                interval_secs,
                pending_timeout_minutes = self.config.pending_timeout_minutes,
                deposit_timeout_minutes = self.config.deposit_timeout_minutes,
                "Stale-resource reaper started"
            );

            let mut ticker = interval(std::time::Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Shutdown signal received, stopping reaper");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let report = self.run_once().await;
                        info!(
                            cancelled_transactions = report.cancelled_transactions,
                            purged_deposits = report.purged_deposits,
                            completed_transactions = report.completed_transactions,
                            "Reaper run finished"
                        );
                    }
                }
            }

            info!("Stale-resource reaper stopped");
        })
    }
}
