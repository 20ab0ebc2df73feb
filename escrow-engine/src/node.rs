//! Main Escrow Node - High-level API for the escrow system
//!
//! Wires every component from one [`EscrowSettings`] and exposes them to the
//! hosting process together with health and shutdown handling.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    admin::AdminService,
    audit::AuditTrail,
    chat::ChatService,
    config::EscrowSettings,
    deposits::DepositService,
    dispute::DisputeArbitration,
    ip_gate::{self, HttpIpGate, InMemoryIpBanList, IpGate},
    ledger::{Account, InMemoryLedger, IntegrityReport, Ledger, LedgerEntry},
    models::{Amount, Transaction, TransactionLog, TransactionStatus},
    realtime::RealtimeHub,
    reaper::StaleResourceReaper,
    time::{SystemTimeSource, TimeSource},
    transaction_manager::{TransactionManager, TransactionManagerConfig},
    withdrawals::{WithdrawalConfig, WithdrawalService},
    EscrowResult,
};

/// Transaction with its history and money movements
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    pub transaction: Transaction,
    pub logs: Vec<TransactionLog>,
    pub ledger_entries: Vec<LedgerEntry>,
}

/// Node health status
#[derive(Debug, Clone)]
pub struct NodeHealth {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub ledger: IntegrityReport,
    pub open_disputes: usize,
    pub deposits_awaiting_confirmation: usize,
    pub realtime_channels: usize,
    pub timestamp: DateTime<Utc>,
}

/// Main escrow node that coordinates all components
pub struct EscrowNode {
    settings: EscrowSettings,
    time: Arc<dyn TimeSource>,
    ledger: Arc<InMemoryLedger>,
    hub: Arc<RealtimeHub>,
    transactions: Arc<TransactionManager>,
    disputes: Arc<DisputeArbitration>,
    deposits: Arc<DepositService>,
    withdrawals: Arc<WithdrawalService>,
    admin: Arc<AdminService>,
    chat: Arc<ChatService>,
    ip_gate: Arc<dyn IpGate>,
    reaper: Arc<StaleResourceReaper>,
    shutdown_tx: watch::Sender<bool>,
}

impl EscrowNode {
    /// Create a node on the system clock
    pub fn new(settings: EscrowSettings) -> EscrowResult<Self> {
        Self::with_time_source(settings, Arc::new(SystemTimeSource))
    }

    /// Create a node with all components initialized
    pub fn with_time_source(
        settings: EscrowSettings,
        time: Arc<dyn TimeSource>,
    ) -> EscrowResult<Self> {
        settings.validate()?;
        info!(
            fee_percent = %settings.platform.fee_percent,
            min_transaction_amount = settings.platform.min_transaction_amount,
            "Initializing escrow node"
        );

        let ledger = Arc::new(InMemoryLedger::new(time.clone()));
        let hub = Arc::new(RealtimeHub::new(settings.realtime.channel_capacity));
        let audit = Arc::new(AuditTrail::new(settings.audit.clone(), time.clone()));

        let transactions = Arc::new(TransactionManager::new(
            TransactionManagerConfig::from(&settings.platform),
            ledger.clone(),
            hub.clone(),
            time.clone(),
        ));
        let disputes = Arc::new(DisputeArbitration::new(transactions.clone(), audit.clone()));
        let deposits = Arc::new(DepositService::new(
            ledger.clone(),
            audit.clone(),
            time.clone(),
        ));
        let withdrawals = Arc::new(WithdrawalService::new(
            WithdrawalConfig::from(&settings.platform),
            ledger.clone(),
            audit.clone(),
            time.clone(),
        ));
        let admin = Arc::new(AdminService::new(ledger.clone(), audit, time.clone()));
        let chat = Arc::new(ChatService::new(
            transactions.clone(),
            hub.clone(),
            time.clone(),
        ));

        let ip_gate: Arc<dyn IpGate> = match settings.ip_gate.lookup_url {
            Some(_) => Arc::new(HttpIpGate::new(&settings.ip_gate)?),
            None => Arc::new(InMemoryIpBanList::new()),
        };

        let reaper = Arc::new(StaleResourceReaper::new(
            settings.reaper.clone(),
            transactions.clone(),
            deposits.clone(),
            time.clone(),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        info!("Escrow node initialized successfully");

        Ok(Self {
            settings,
            time,
            ledger,
            hub,
            transactions,
            disputes,
            deposits,
            withdrawals,
            admin,
            chat,
            ip_gate,
            reaper,
            shutdown_tx,
        })
    }

    pub fn settings(&self) -> &EscrowSettings {
        &self.settings
    }

    pub fn ledger(&self) -> &Arc<InMemoryLedger> {
        &self.ledger
    }

    pub fn realtime(&self) -> &Arc<RealtimeHub> {
        &self.hub
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    pub fn disputes(&self) -> &Arc<DisputeArbitration> {
        &self.disputes
    }

    pub fn deposits(&self) -> &Arc<DepositService> {
        &self.deposits
    }

    pub fn withdrawals(&self) -> &Arc<WithdrawalService> {
        &self.withdrawals
    }

    pub fn admin(&self) -> &Arc<AdminService> {
        &self.admin
    }

    pub fn chat(&self) -> &Arc<ChatService> {
        &self.chat
    }

    pub fn reaper(&self) -> &Arc<StaleResourceReaper> {
        &self.reaper
    }

    /// Get a transaction with its log and ledger entries
    pub async fn get_transaction_info(&self, transaction_id: Uuid) -> EscrowResult<TransactionInfo> {
        let transaction = self.transactions.get_transaction(transaction_id).await?;
        let logs = self.transactions.get_transaction_logs(transaction_id).await?;
        let ledger_entries = self.ledger.entries_for(transaction_id).await?;

        Ok(TransactionInfo {
            transaction,
            logs,
            ledger_entries,
        })
    }

    pub async fn get_user_balance(&self, user_id: Uuid) -> EscrowResult<Amount> {
        self.ledger.balance(Account::User(user_id)).await
    }

    /// Ban check for a new session; `true` means the session is refused
    pub async fn check_session_start<'a, I>(&self, headers: I) -> bool
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        ip_gate::check_session_start(self.ip_gate.as_ref(), headers).await
    }

    /// Start the periodic reaper; it stops on [`EscrowNode::shutdown`]
    pub fn start_reaper(&self) -> JoinHandle<()> {
        self.reaper.clone().spawn(self.shutdown_tx.subscribe())
    }

    /// Health check for the escrow node
    pub async fn health_check(&self) -> EscrowResult<NodeHealth> {
        let mut issues = Vec::new();

        let ledger = self.ledger.verify_integrity().await;
        if !ledger.unbalanced_events.is_empty() {
            issues.push(format!(
                "{} ledger events do not balance",
                ledger.unbalanced_events.len()
            ));
        }
        if !ledger.drifted_accounts.is_empty() {
            issues.push(format!(
                "{} account balances drifted from the ledger",
                ledger.drifted_accounts.len()
            ));
        }

        let mut held: Amount = 0;
        for status in TransactionStatus::ALL.into_iter().filter(|s| s.holds_funds()) {
            for tx in self.transactions.get_by_status(status).await {
                let escrow = self.ledger.balance(Account::Escrow(tx.id)).await?;
                if escrow != tx.amount {
                    issues.push(format!("escrow of {} does not match its amount", tx.code));
                }
                held += escrow;
            }
        }

        let open_disputes = self
            .transactions
            .get_by_status(TransactionStatus::Disputed)
            .await
            .len();
        let deposits_awaiting_confirmation = self.deposits.pending_queue().await.len();

        if !issues.is_empty() {
            warn!(issues = ?issues, "Escrow node unhealthy");
        }
        info!(held_in_escrow = held, open_disputes, "Health check finished");

        Ok(NodeHealth {
            healthy: issues.is_empty(),
            issues,
            ledger,
            open_disputes,
            deposits_awaiting_confirmation,
            realtime_channels: self.hub.channel_count().await,
            timestamp: self.time.now(),
        })
    }

    /// Shutdown the escrow node gracefully
    pub async fn shutdown(&self) -> EscrowResult<()> {
        info!("Shutting down escrow node");

        if self.shutdown_tx.send(true).is_err() {
            // No reaper was started.
            info!("No background tasks to stop");
        }
        let pruned = self.hub.prune().await;
        if pruned > 0 {
            info!(pruned, "Closed idle realtime channels");
        }

        let report = self.ledger.verify_integrity().await;
        if !report.is_consistent() {
            error!(?report, "Ledger inconsistent at shutdown");
        }

        info!("Escrow node shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{Actor, Role},
        transaction_manager::{CreateTransactionRequest, TransitionRequest},
    };

    #[tokio::test]
    async fn test_node_initialization() {
        let node = EscrowNode::new(EscrowSettings::default()).unwrap();
        let health = node.health_check().await.unwrap();
        assert!(health.healthy);
        assert_eq!(health.open_disputes, 0);
    }

    #[tokio::test]
    async fn test_invalid_settings_rejected() {
        let mut settings = EscrowSettings::default();
        settings.realtime.channel_capacity = 0;
        assert!(EscrowNode::new(settings).is_err());
    }

    #[tokio::test]
    async fn test_transaction_info_includes_ledger_entries() {
        let node = EscrowNode::new(EscrowSettings::default()).unwrap();
        let admin = Actor::new(Uuid::new_v4(), Role::Admin);
        let buyer = Actor::member(Uuid::new_v4());
        node.admin()
            .adjust_balance(crate::admin::AdjustBalanceRequest {
                request_id: Uuid::new_v4(),
                actor: admin,
                user_id: buyer.user_id,
                amount: 100_000,
                note: "top up".to_string(),
            })
            .await
            .unwrap();

        let tx = node
            .transactions()
            .create_transaction(CreateTransactionRequest {
                buyer,
                seller_id: Uuid::new_v4(),
                product_name: "Camera".to_string(),
                amount: 60_000,
                category: "electronics".to_string(),
                dispute_window_hours: None,
            })
            .await
            .unwrap();
        node.transactions()
            .fund_transaction(TransitionRequest::new(tx.id, TransactionStatus::Pending, buyer))
            .await
            .unwrap();

        let info = node.get_transaction_info(tx.id).await.unwrap();
        assert_eq!(info.logs.len(), 2);
        assert_eq!(info.ledger_entries.len(), 2);
        assert_eq!(node.get_user_balance(buyer.user_id).await.unwrap(), 40_000);
        assert!(node.health_check().await.unwrap().healthy);
    }

    #[tokio::test]
    async fn test_shutdown_stops_reaper() {
        let node = EscrowNode::new(EscrowSettings::default()).unwrap();
        let handle = node.start_reaper();
        node.shutdown().await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_session_check_without_headers_allows() {
        let node = EscrowNode::new(EscrowSettings::default()).unwrap();
        assert!(!node.check_session_start(Vec::new()).await);
    }
}
