//! Ledger - the only path through which balances change
//!
//! Balances are never stored as mutable counters that callers write to.
//! Every money movement is a batch of signed postings appended under a
//! causal [`EventKey`]; a balance is the sum of the postings against its
//! account. Batches are double-entry (they sum to zero) and idempotent: a
//! batch whose key was already applied is a no-op.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::EscrowError,
    models::{Amount, Deposit, Transaction, Withdrawal},
    time::{SystemTimeSource, TimeSource},
    EscrowResult,
};

/// Account a posting is booked against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum Account {
    /// Spendable balance of a user
    User(Uuid),
    /// Funds held for one escrow transaction
    Escrow(Uuid),
    /// Funds reserved for one requested payout
    WithdrawalHold(Uuid),
    /// Fees collected by the platform
    PlatformRevenue,
    /// Counterpart for money entering or leaving the platform
    External,
}

impl Account {
    /// Accounts that may never go below zero
    fn is_guarded(&self) -> bool {
        matches!(
            self,
            Self::User(_) | Self::Escrow(_) | Self::WithdrawalHold(_)
        )
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{}", id),
            Self::Escrow(id) => write!(f, "escrow:{}", id),
            Self::WithdrawalHold(id) => write!(f, "withdrawal_hold:{}", id),
            Self::PlatformRevenue => f.write_str("platform_revenue"),
            Self::External => f.write_str("external"),
        }
    }
}

/// Kind of causal event a batch belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEventKind {
    EscrowHold,
    Settlement,
    Refund,
    DepositCredit,
    WithdrawalReserve,
    WithdrawalDebit,
    WithdrawalRelease,
    Adjustment,
}

/// Idempotency key of a ledger batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub source_id: Uuid,
    pub kind: LedgerEventKind,
}

impl EventKey {
    pub fn new(source_id: Uuid, kind: LedgerEventKind) -> Self {
        Self { source_id, kind }
    }
}

/// Signed amount booked against one account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub account: Account,
    pub amount: Amount,
}

impl Posting {
    pub fn new(account: Account, amount: Amount) -> Self {
        Self { account, amount }
    }
}

/// A set of postings applied as one unit of work
#[derive(Debug, Clone)]
pub struct PostingBatch {
    pub key: EventKey,
    pub postings: Vec<Posting>,
    pub note: String,
}

/// Persisted ledger line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub sequence: u64,
    pub key: EventKey,
    pub account: Account,
    pub amount: Amount,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

/// Result of posting a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    Applied,
    /// The event was booked before; nothing changed
    AlreadyApplied,
}

/// Platform fee for `amount` at `fee_percent` percent, rounded toward zero
pub fn fee_for(amount: Amount, fee_percent: Decimal) -> EscrowResult<Amount> {
    if fee_percent < Decimal::ZERO || fee_percent >= Decimal::ONE_HUNDRED {
        return Err(EscrowError::validation(format!(
            "fee percent {} out of range",
            fee_percent
        )));
    }
    (Decimal::from(amount) * fee_percent / Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::ToZero)
        .to_i64()
        .ok_or_else(|| EscrowError::internal(format!("fee for {} overflows", amount)))
}

/// Ledger interface used by every component that moves money.
///
/// Implementors provide atomic, idempotent batch posting; the money
/// operations of the platform are built on top of it.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Apply a batch atomically; a repeated key is a no-op
    async fn post(&self, batch: PostingBatch) -> EscrowResult<LedgerOutcome>;

    /// Current balance of an account
    async fn balance(&self, account: Account) -> EscrowResult<Amount>;

    /// Whether the event was already booked
    async fn is_applied(&self, key: EventKey) -> EscrowResult<bool>;

    /// Entries produced by events of one source (transaction, deposit...)
    async fn entries_for(&self, source_id: Uuid) -> EscrowResult<Vec<LedgerEntry>>;

    /// Direct administrative credit or debit of a user's balance
    async fn adjust_balance(
        &self,
        request_id: Uuid,
        user_id: Uuid,
        amount: Amount,
        note: &str,
    ) -> EscrowResult<LedgerOutcome> {
        if amount == 0 {
            return Err(EscrowError::validation("adjustment amount must be non-zero"));
        }
        let counter = amount
            .checked_neg()
            .ok_or_else(|| EscrowError::validation(format!("adjustment {} is out of range", amount)))?;
        self.post(PostingBatch {
            key: EventKey::new(request_id, LedgerEventKind::Adjustment),
            postings: vec![
                Posting::new(Account::User(user_id), amount),
                Posting::new(Account::External, counter),
            ],
            note: note.to_string(),
        })
        .await
    }

    /// Debit the buyer and hold the amount for the transaction
    async fn hold_funds(&self, transaction: &Transaction) -> EscrowResult<LedgerOutcome> {
        self.post(PostingBatch {
            key: EventKey::new(transaction.id, LedgerEventKind::EscrowHold),
            postings: vec![
                Posting::new(Account::User(transaction.buyer_id), -transaction.amount),
                Posting::new(Account::Escrow(transaction.id), transaction.amount),
            ],
            note: format!("escrow hold {}", transaction.code),
        })
        .await
    }

    /// Release held funds: seller receives the amount minus the fee, which
    /// is booked as platform revenue
    async fn settle_transaction(&self, transaction: &Transaction) -> EscrowResult<LedgerOutcome> {
        let fee = transaction.fee_amount()?;
        let mut postings = vec![
            Posting::new(Account::Escrow(transaction.id), -transaction.amount),
            Posting::new(Account::User(transaction.seller_id), transaction.amount - fee),
        ];
        if fee > 0 {
            postings.push(Posting::new(Account::PlatformRevenue, fee));
        }
        self.post(PostingBatch {
            key: EventKey::new(transaction.id, LedgerEventKind::Settlement),
            postings,
            note: format!("settlement {}", transaction.code),
        })
        .await
    }

    /// Return the full held amount to the buyer, no fee
    async fn refund_transaction(&self, transaction: &Transaction) -> EscrowResult<LedgerOutcome> {
        self.post(PostingBatch {
            key: EventKey::new(transaction.id, LedgerEventKind::Refund),
            postings: vec![
                Posting::new(Account::Escrow(transaction.id), -transaction.amount),
                Posting::new(Account::User(transaction.buyer_id), transaction.amount),
            ],
            note: format!("refund {}", transaction.code),
        })
        .await
    }

    /// Credit a confirmed deposit
    async fn credit_deposit(&self, deposit: &Deposit) -> EscrowResult<LedgerOutcome> {
        self.post(PostingBatch {
            key: EventKey::new(deposit.id, LedgerEventKind::DepositCredit),
            postings: vec![
                Posting::new(Account::User(deposit.user_id), deposit.amount),
                Posting::new(Account::External, -deposit.amount),
            ],
            note: format!("deposit via {}", deposit.payment_method),
        })
        .await
    }

    /// Move a requested payout out of the spendable balance
    async fn reserve_withdrawal(&self, withdrawal: &Withdrawal) -> EscrowResult<LedgerOutcome> {
        self.post(PostingBatch {
            key: EventKey::new(withdrawal.id, LedgerEventKind::WithdrawalReserve),
            postings: vec![
                Posting::new(Account::User(withdrawal.user_id), -withdrawal.amount),
                Posting::new(Account::WithdrawalHold(withdrawal.id), withdrawal.amount),
            ],
            note: format!("withdrawal reserved for {}", withdrawal.destination.bank_name),
        })
        .await
    }

    /// Pay out a reserved withdrawal
    async fn debit_withdrawal(&self, withdrawal: &Withdrawal) -> EscrowResult<LedgerOutcome> {
        self.post(PostingBatch {
            key: EventKey::new(withdrawal.id, LedgerEventKind::WithdrawalDebit),
            postings: vec![
                Posting::new(Account::WithdrawalHold(withdrawal.id), -withdrawal.amount),
                Posting::new(Account::External, withdrawal.amount),
            ],
            note: format!("withdrawal to {}", withdrawal.destination.bank_name),
        })
        .await
    }

    /// Return a reserved withdrawal to the user
    async fn release_withdrawal(&self, withdrawal: &Withdrawal) -> EscrowResult<LedgerOutcome> {
        self.post(PostingBatch {
            key: EventKey::new(withdrawal.id, LedgerEventKind::WithdrawalRelease),
            postings: vec![
                Posting::new(Account::WithdrawalHold(withdrawal.id), -withdrawal.amount),
                Posting::new(Account::User(withdrawal.user_id), withdrawal.amount),
            ],
            note: "withdrawal rejected".to_string(),
        })
        .await
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    entries: Vec<LedgerEntry>,
    balances: HashMap<Account, Amount>,
    applied: HashMap<EventKey, DateTime<Utc>>,
}

/// Findings of an integrity check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    pub entries: usize,
    pub events: usize,
    /// Events whose postings do not sum to zero
    pub unbalanced_events: Vec<EventKey>,
    /// Accounts whose cached balance differs from the fold of entries
    pub drifted_accounts: Vec<Account>,
}

impl IntegrityReport {
    pub fn is_consistent(&self) -> bool {
        self.unbalanced_events.is_empty() && self.drifted_accounts.is_empty()
    }
}

/// In-memory ledger; one write lock makes each batch a single unit of work
pub struct InMemoryLedger {
    state: Arc<RwLock<LedgerState>>,
    time: Arc<dyn TimeSource>,
}

impl InMemoryLedger {
    pub fn new(time: Arc<dyn TimeSource>) -> Self {
        Self {
            state: Arc::new(RwLock::new(LedgerState::default())),
            time,
        }
    }

    /// Re-fold every entry and compare with the cached balances
    pub async fn verify_integrity(&self) -> IntegrityReport {
        let state = self.state.read().await;

        let mut folded: HashMap<Account, Amount> = HashMap::new();
        let mut per_event: HashMap<EventKey, Amount> = HashMap::new();
        for entry in &state.entries {
            let balance = folded.entry(entry.account).or_default();
            *balance = balance.wrapping_add(entry.amount);
            let sum = per_event.entry(entry.key).or_default();
            *sum = sum.wrapping_add(entry.amount);
        }

        let mut report = IntegrityReport {
            entries: state.entries.len(),
            events: state.applied.len(),
            ..IntegrityReport::default()
        };
        report.unbalanced_events = per_event
            .into_iter()
            .filter(|(_, sum)| *sum != 0)
            .map(|(key, _)| key)
            .collect();
        for (account, cached) in &state.balances {
            if folded.get(account).copied().unwrap_or(0) != *cached {
                report.drifted_accounts.push(*account);
            }
        }

        if !report.is_consistent() {
            warn!(
                unbalanced = report.unbalanced_events.len(),
                drifted = report.drifted_accounts.len(),
                "Ledger integrity check failed"
            );
        }
        report
    }

    pub async fn platform_revenue(&self) -> Amount {
        self.state
            .read()
            .await
            .balances
            .get(&Account::PlatformRevenue)
            .copied()
            .unwrap_or(0)
    }
}

fn out_of_range(key: &EventKey) -> EscrowError {
    EscrowError::validation(format!("ledger batch {:?} overflows an account balance", key))
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new(Arc::new(SystemTimeSource))
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn post(&self, batch: PostingBatch) -> EscrowResult<LedgerOutcome> {
        if batch.postings.is_empty() {
            return Err(EscrowError::validation("ledger batch has no postings"));
        }
        let total = batch
            .postings
            .iter()
            .try_fold(0 as Amount, |sum, p| sum.checked_add(p.amount))
            .ok_or_else(|| out_of_range(&batch.key))?;
        if total != 0 {
            return Err(EscrowError::internal(format!(
                "ledger batch {:?} does not balance",
                batch.key
            )));
        }

        let mut state = self.state.write().await;

        if state.applied.contains_key(&batch.key) {
            debug!(key = ?batch.key, "Ledger event already applied");
            return Ok(LedgerOutcome::AlreadyApplied);
        }

        // Net effect per account, so a batch touching one account twice is
        // checked against its combined movement.
        let mut net: HashMap<Account, Amount> = HashMap::new();
        for posting in &batch.postings {
            let delta = net.entry(posting.account).or_default();
            *delta = delta
                .checked_add(posting.amount)
                .ok_or_else(|| out_of_range(&batch.key))?;
        }

        // Every resulting balance is computed before anything is written.
        let mut updated: Vec<(Account, Amount)> = Vec::with_capacity(net.len());
        for (account, delta) in &net {
            let available = state.balances.get(account).copied().unwrap_or(0);
            let after = available
                .checked_add(*delta)
                .ok_or_else(|| out_of_range(&batch.key))?;
            if after < 0 && account.is_guarded() {
                return match account {
                    Account::User(_) => Err(EscrowError::InsufficientBalance {
                        required: delta.saturating_neg(),
                        available,
                    }),
                    _ => Err(EscrowError::internal(format!(
                        "{} holds {} but {} was requested",
                        account,
                        available,
                        delta.saturating_neg()
                    ))),
                };
            }
            updated.push((*account, after));
        }

        let now = self.time.now();
        for posting in &batch.postings {
            let sequence = state.entries.len() as u64 + 1;
            state.entries.push(LedgerEntry {
                sequence,
                key: batch.key,
                account: posting.account,
                amount: posting.amount,
                note: batch.note.clone(),
                created_at: now,
            });
        }
        state.balances.extend(updated);
        state.applied.insert(batch.key, now);

        info!(
            key = ?batch.key,
            postings = batch.postings.len(),
            note = %batch.note,
            "Ledger event applied"
        );
        Ok(LedgerOutcome::Applied)
    }

    async fn balance(&self, account: Account) -> EscrowResult<Amount> {
        Ok(self
            .state
            .read()
            .await
            .balances
            .get(&account)
            .copied()
            .unwrap_or(0))
    }

    async fn is_applied(&self, key: EventKey) -> EscrowResult<bool> {
        Ok(self.state.read().await.applied.contains_key(&key))
    }

    async fn entries_for(&self, source_id: Uuid) -> EscrowResult<Vec<LedgerEntry>> {
        Ok(self
            .state
            .read()
            .await
            .entries
            .iter()
            .filter(|entry| entry.key.source_id == source_id)
            .cloned()
            .collect())
    }
}
