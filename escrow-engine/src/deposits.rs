//! Deposit requests
//!
//! A deposit starts as an intent. The user marks it submitted once the
//! transfer is made; only then does it reach the admin confirmation queue.
//! Confirmation credits the ledger exactly once.

use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    admin::ensure_privileged,
    audit::AuditTrail,
    config::DepositSweepPolicy,
    error::EscrowError,
    ledger::Ledger,
    models::{Actor, AdminActionType, Amount, Deposit, DepositStatus},
    time::TimeSource,
    EscrowResult,
};

pub struct DepositService {
    deposits: Arc<RwLock<HashMap<Uuid, Deposit>>>,
    ledger: Arc<dyn Ledger>,
    audit: Arc<AuditTrail>,
    time: Arc<dyn TimeSource>,
}

impl DepositService {
    pub fn new(ledger: Arc<dyn Ledger>, audit: Arc<AuditTrail>, time: Arc<dyn TimeSource>) -> Self {
        Self {
            deposits: Arc::new(RwLock::new(HashMap::new())),
            ledger,
            audit,
            time,
        }
    }

    /// Open a deposit request
    pub async fn create_deposit(
        &self,
        actor: Actor,
        amount: Amount,
        payment_method: &str,
    ) -> EscrowResult<Deposit> {
        if amount <= 0 {
            return Err(EscrowError::validation("Deposit amount must be positive"));
        }
        if payment_method.trim().is_empty() {
            return Err(EscrowError::validation("Payment method is required"));
        }

        let deposit = Deposit::new(
            actor.user_id,
            amount,
            payment_method.trim().to_string(),
            self.time.now(),
        );
        self.deposits.write().await.insert(deposit.id, deposit.clone());

        info!(deposit_id = %deposit.id, user_id = %deposit.user_id, amount, "Deposit created");
        Ok(deposit)
    }

    /// The user asserts the transfer was made
    pub async fn submit_deposit(&self, actor: Actor, deposit_id: Uuid) -> EscrowResult<Deposit> {
        let mut deposits = self.deposits.write().await;
        let deposit = lookup(&mut deposits, deposit_id)?;

        if deposit.user_id != actor.user_id {
            return Err(EscrowError::unauthorized("Deposit belongs to another user"));
        }
        if deposit.status != DepositStatus::Pending {
            return Err(EscrowError::validation(format!(
                "Deposit {} is already {:?}",
                deposit_id, deposit.status
            )));
        }
        if !deposit.is_submitted {
            deposit.is_submitted = true;
            deposit.submitted_at = Some(self.time.now());
            info!(%deposit_id, "Deposit submitted for confirmation");
        }
        Ok(deposit.clone())
    }

    /// Admin confirms a submitted deposit and credits the user
    pub async fn confirm_deposit(
        &self,
        actor: Actor,
        deposit_id: Uuid,
        note: Option<String>,
    ) -> EscrowResult<Deposit> {
        ensure_privileged(&actor)?;

        // Held across the ledger call so a concurrent confirm, reject or
        // purge cannot interleave with the credit.
        let mut deposits = self.deposits.write().await;
        let deposit = lookup(&mut deposits, deposit_id)?;

        if deposit.status != DepositStatus::Pending {
            return Err(EscrowError::validation(format!(
                "Deposit {} is already {:?}",
                deposit_id, deposit.status
            )));
        }
        if !deposit.is_submitted {
            return Err(EscrowError::validation(
                "Deposit has not been submitted by the user",
            ));
        }

        self.ledger.credit_deposit(deposit).await?;

        deposit.status = DepositStatus::Confirmed;
        deposit.admin_note = note.clone();
        deposit.resolved_at = Some(self.time.now());
        let confirmed = deposit.clone();
        drop(deposits);

        self.audit
            .record(
                &actor,
                Some(confirmed.user_id),
                AdminActionType::ConfirmDeposit,
                serde_json::json!({
                    "deposit_id": confirmed.id,
                    "amount": confirmed.amount,
                    "payment_method": confirmed.payment_method,
                }),
                note,
            )
            .await;

        info!(
            %deposit_id,
            user_id = %confirmed.user_id,
            amount = confirmed.amount,
            "Deposit confirmed"
        );
        Ok(confirmed)
    }

    /// Admin rejects a deposit; nothing is credited
    pub async fn reject_deposit(
        &self,
        actor: Actor,
        deposit_id: Uuid,
        reason: &str,
    ) -> EscrowResult<Deposit> {
        ensure_privileged(&actor)?;
        if reason.trim().is_empty() {
            return Err(EscrowError::validation("A rejection reason is required"));
        }

        let rejected = {
            let mut deposits = self.deposits.write().await;
            let deposit = lookup(&mut deposits, deposit_id)?;
            if deposit.status != DepositStatus::Pending {
                return Err(EscrowError::validation(format!(
                    "Deposit {} is already {:?}",
                    deposit_id, deposit.status
                )));
            }
            deposit.status = DepositStatus::Rejected;
            deposit.admin_note = Some(reason.trim().to_string());
            deposit.resolved_at = Some(self.time.now());
            deposit.clone()
        };

        self.audit
            .record(
                &actor,
                Some(rejected.user_id),
                AdminActionType::RejectDeposit,
                serde_json::json!({ "deposit_id": rejected.id, "amount": rejected.amount }),
                rejected.admin_note.clone(),
            )
            .await;

        info!(%deposit_id, "Deposit rejected");
        Ok(rejected)
    }

    /// Submitted pending deposits, oldest first
    pub async fn pending_queue(&self) -> Vec<Deposit> {
        let mut queue: Vec<Deposit> = self
            .deposits
            .read()
            .await
            .values()
            .filter(|deposit| deposit.awaiting_confirmation())
            .cloned()
            .collect();
        queue.sort_by_key(|deposit| deposit.created_at);
        queue
    }

    pub async fn get_deposit(&self, deposit_id: Uuid) -> EscrowResult<Deposit> {
        self.deposits
            .read()
            .await
            .get(&deposit_id)
            .cloned()
            .ok_or_else(|| EscrowError::not_found(format!("Deposit {} not found", deposit_id)))
    }

    pub async fn get_user_deposits(&self, user_id: Uuid) -> Vec<Deposit> {
        let mut deposits: Vec<Deposit> = self
            .deposits
            .read()
            .await
            .values()
            .filter(|deposit| deposit.user_id == user_id)
            .cloned()
            .collect();
        deposits.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        deposits
    }

    /// Delete pending deposits created before `cutoff`.
    ///
    /// One conditional delete under the write lock; rows confirmed or
    /// rejected in the meantime do not match. Returns the number removed.
    pub async fn purge_stale(&self, cutoff: DateTime<Utc>, policy: DepositSweepPolicy) -> usize {
        let mut deposits = self.deposits.write().await;
        let before = deposits.len();
        deposits.retain(|_, deposit| {
            let stale = deposit.status == DepositStatus::Pending
                && deposit.created_at < cutoff
                && match policy {
                    DepositSweepPolicy::UnsubmittedOnly => !deposit.is_submitted,
                    DepositSweepPolicy::AllPending => true,
                };
            if stale {
                debug!(deposit_id = %deposit.id, submitted = deposit.is_submitted, "Purging stale deposit");
            }
            !stale
        });
        before - deposits.len()
    }
}

fn lookup(deposits: &mut HashMap<Uuid, Deposit>, deposit_id: Uuid) -> EscrowResult<&mut Deposit> {
    deposits
        .get_mut(&deposit_id)
        .ok_or_else(|| EscrowError::not_found(format!("Deposit {} not found", deposit_id)))
}
