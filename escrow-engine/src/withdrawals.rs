//! Withdrawal requests
//!
//! A request moves the amount from the user's balance into a per-withdrawal
//! hold account, so escrow funding can never spend money promised to a
//! payout. `pending -> completed` pays the hold out; `pending -> rejected`
//! returns it to the user. Either happens once; later calls on a resolved
//! id fail.

use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    admin::ensure_privileged,
    audit::AuditTrail,
    config::PlatformSettings,
    error::EscrowError,
    ledger::{Account, Ledger},
    models::{Actor, AdminActionType, Amount, BankDestination, Withdrawal, WithdrawalStatus},
    time::TimeSource,
    EscrowResult,
};

/// Configuration for withdrawal requests
#[derive(Debug, Clone)]
pub struct WithdrawalConfig {
    /// Minimum payout, in minor units
    pub min_amount: Amount,
}

impl Default for WithdrawalConfig {
    fn default() -> Self {
        Self::from(&PlatformSettings::default())
    }
}

impl From<&PlatformSettings> for WithdrawalConfig {
    fn from(settings: &PlatformSettings) -> Self {
        Self {
            min_amount: settings.min_withdrawal_amount,
        }
    }
}

pub struct WithdrawalService {
    config: WithdrawalConfig,
    withdrawals: Arc<RwLock<HashMap<Uuid, Withdrawal>>>,
    ledger: Arc<dyn Ledger>,
    audit: Arc<AuditTrail>,
    time: Arc<dyn TimeSource>,
}

impl WithdrawalService {
    pub fn new(
        config: WithdrawalConfig,
        ledger: Arc<dyn Ledger>,
        audit: Arc<AuditTrail>,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            config,
            withdrawals: Arc::new(RwLock::new(HashMap::new())),
            ledger,
            audit,
            time,
        }
    }

    /// Spendable balance; pending payouts are already held aside
    pub async fn available_balance(&self, user_id: Uuid) -> EscrowResult<Amount> {
        self.ledger.balance(Account::User(user_id)).await
    }

    /// Ask for a payout to a bank account
    pub async fn request_withdrawal(
        &self,
        actor: Actor,
        amount: Amount,
        destination: BankDestination,
    ) -> EscrowResult<Withdrawal> {
        if amount < self.config.min_amount {
            return Err(EscrowError::validation(format!(
                "Minimum withdrawal is {}",
                self.config.min_amount
            )));
        }
        if destination.bank_name.trim().is_empty()
            || destination.account_number.trim().is_empty()
            || destination.account_holder.trim().is_empty()
        {
            return Err(EscrowError::validation("Bank destination is incomplete"));
        }

        let withdrawal = Withdrawal::new(actor.user_id, amount, destination, self.time.now());
        // The ledger checks the balance and books the hold in one step.
        self.ledger.reserve_withdrawal(&withdrawal).await?;
        self.withdrawals
            .write()
            .await
            .insert(withdrawal.id, withdrawal.clone());

        info!(
            withdrawal_id = %withdrawal.id,
            user_id = %withdrawal.user_id,
            amount,
            "Withdrawal requested"
        );
        Ok(withdrawal)
    }

    /// Admin marks the payout as sent; the hold is paid out
    pub async fn confirm_withdrawal(
        &self,
        actor: Actor,
        withdrawal_id: Uuid,
    ) -> EscrowResult<Withdrawal> {
        ensure_privileged(&actor)?;

        let mut withdrawals = self.withdrawals.write().await;
        let withdrawal = lookup_pending(&mut withdrawals, withdrawal_id)?;

        if let Err(err) = self.ledger.debit_withdrawal(withdrawal).await {
            warn!(%withdrawal_id, error = %err, "Withdrawal debit failed");
            return Err(err);
        }

        withdrawal.status = WithdrawalStatus::Completed;
        withdrawal.completed_at = Some(self.time.now());
        let completed = withdrawal.clone();
        drop(withdrawals);

        self.audit
            .record(
                &actor,
                Some(completed.user_id),
                AdminActionType::ConfirmWithdrawal,
                serde_json::json!({
                    "withdrawal_id": completed.id,
                    "amount": completed.amount,
                    "bank_name": completed.destination.bank_name,
                }),
                None,
            )
            .await;

        info!(
            %withdrawal_id,
            user_id = %completed.user_id,
            amount = completed.amount,
            "Withdrawal completed"
        );
        Ok(completed)
    }

    /// Admin declines the payout; the hold returns to the user and the
    /// reason is kept as the admin note
    pub async fn reject_withdrawal(
        &self,
        actor: Actor,
        withdrawal_id: Uuid,
        reason: &str,
    ) -> EscrowResult<Withdrawal> {
        ensure_privileged(&actor)?;
        if reason.trim().is_empty() {
            return Err(EscrowError::validation("A rejection reason is required"));
        }

        let rejected = {
            let mut withdrawals = self.withdrawals.write().await;
            let withdrawal = lookup_pending(&mut withdrawals, withdrawal_id)?;
            if let Err(err) = self.ledger.release_withdrawal(withdrawal).await {
                warn!(%withdrawal_id, error = %err, "Withdrawal release failed");
                return Err(err);
            }
            withdrawal.status = WithdrawalStatus::Rejected;
            withdrawal.admin_note = Some(reason.trim().to_string());
            withdrawal.completed_at = Some(self.time.now());
            withdrawal.clone()
        };

        self.audit
            .record(
                &actor,
                Some(rejected.user_id),
                AdminActionType::RejectWithdrawal,
                serde_json::json!({ "withdrawal_id": rejected.id, "amount": rejected.amount }),
                rejected.admin_note.clone(),
            )
            .await;

        info!(%withdrawal_id, "Withdrawal rejected");
        Ok(rejected)
    }

    pub async fn get_withdrawal(&self, withdrawal_id: Uuid) -> EscrowResult<Withdrawal> {
        self.withdrawals
            .read()
            .await
            .get(&withdrawal_id)
            .cloned()
            .ok_or_else(|| EscrowError::not_found(format!("Withdrawal {} not found", withdrawal_id)))
    }

    /// Pending payouts, oldest first
    pub async fn list_pending(&self) -> Vec<Withdrawal> {
        let mut pending: Vec<Withdrawal> = self
            .withdrawals
            .read()
            .await
            .values()
            .filter(|w| w.status == WithdrawalStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|w| w.created_at);
        pending
    }
}

fn lookup_pending(
    withdrawals: &mut HashMap<Uuid, Withdrawal>,
    withdrawal_id: Uuid,
) -> EscrowResult<&mut Withdrawal> {
    let withdrawal = withdrawals
        .get_mut(&withdrawal_id)
        .ok_or_else(|| EscrowError::not_found(format!("Withdrawal {} not found", withdrawal_id)))?;
    if withdrawal.status != WithdrawalStatus::Pending {
        return Err(EscrowError::validation(format!(
            "Withdrawal {} is already {:?}",
            withdrawal_id, withdrawal.status
        )));
    }
    Ok(withdrawal)
}
