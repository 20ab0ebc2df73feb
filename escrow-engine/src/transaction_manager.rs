//! Transaction Manager - owns the lifecycle of every escrow trade
//!
//! All status changes go through [`TransactionManager::transition`], which
//! serialises writers per transaction, rejects requests whose expected
//! status is stale, applies the ledger effect of the target state and only
//! then commits the new status, the audit log entry and the realtime delta.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::{PlatformSettings, MAX_DISPUTE_WINDOW_HOURS},
    error::EscrowError,
    ledger::{Ledger, LedgerOutcome},
    models::{
        Actor, Amount, LedgerAction, Role, Transaction, TransactionLog, TransactionStatus,
        TransitionEvent,
    },
    realtime::{Channel, RealtimeEvent, RealtimeHub, UserNotification},
    time::TimeSource,
    EscrowResult,
};

/// Configuration for the transaction manager
#[derive(Debug, Clone)]
pub struct TransactionManagerConfig {
    /// Smallest accepted amount, in minor units
    pub min_transaction_amount: Amount,
    /// Fee captured on new transactions, in percent
    pub fee_percent: Decimal,
    /// Dispute window applied when the buyer does not choose one
    pub default_dispute_window_hours: u32,
}

impl Default for TransactionManagerConfig {
    fn default() -> Self {
        Self::from(&PlatformSettings::default())
    }
}

impl From<&PlatformSettings> for TransactionManagerConfig {
    fn from(settings: &PlatformSettings) -> Self {
        Self {
            min_transaction_amount: settings.min_transaction_amount,
            fee_percent: settings.fee_percent,
            default_dispute_window_hours: settings.default_dispute_window_hours,
        }
    }
}

/// Transaction creation request
#[derive(Debug, Clone)]
pub struct CreateTransactionRequest {
    pub buyer: Actor,
    pub seller_id: Uuid,
    pub product_name: String,
    pub amount: Amount,
    pub category: String,
    pub dispute_window_hours: Option<u32>,
}

/// Request to move a transaction out of `expected_status`
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub transaction_id: Uuid,
    /// Status the caller last observed; a mismatch is a conflict
    pub expected_status: TransactionStatus,
    pub actor: Actor,
    pub note: Option<String>,
}

impl TransitionRequest {
    pub fn new(transaction_id: Uuid, expected_status: TransactionStatus, actor: Actor) -> Self {
        Self {
            transaction_id,
            expected_status,
            actor,
            note: None,
        }
    }

    pub fn with_note<S: Into<String>>(mut self, note: S) -> Self {
        self.note = Some(note.into());
        self
    }
}

type TransactionHandle = Arc<Mutex<Transaction>>;

/// Main transaction manager that coordinates the trade lifecycle
pub struct TransactionManager {
    config: TransactionManagerConfig,
    /// One lock per row; writers of the same transaction are serialised
    transactions: Arc<RwLock<HashMap<Uuid, TransactionHandle>>>,
    /// Append-only transition log
    logs: Arc<RwLock<Vec<TransactionLog>>>,
    ledger: Arc<dyn Ledger>,
    hub: Arc<RealtimeHub>,
    time: Arc<dyn TimeSource>,
}

impl TransactionManager {
    /// Create a new transaction manager
    pub fn new(
        config: TransactionManagerConfig,
        ledger: Arc<dyn Ledger>,
        hub: Arc<RealtimeHub>,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            config,
            transactions: Arc::new(RwLock::new(HashMap::new())),
            logs: Arc::new(RwLock::new(Vec::new())),
            ledger,
            hub,
            time,
        }
    }

    pub fn time(&self) -> &Arc<dyn TimeSource> {
        &self.time
    }

    /// Create a new pending transaction on behalf of the buyer
    pub async fn create_transaction(
        &self,
        request: CreateTransactionRequest,
    ) -> EscrowResult<Transaction> {
        self.validate_create_request(&request)?;

        let now = self.time.now();
        let transaction = Transaction::new(
            request.buyer.user_id,
            request.seller_id,
            request.product_name.trim().to_string(),
            request.amount,
            self.config.fee_percent,
            request.category,
            request
                .dispute_window_hours
                .unwrap_or(self.config.default_dispute_window_hours),
            now,
        );

        self.transactions
            .write()
            .await
            .insert(transaction.id, Arc::new(Mutex::new(transaction.clone())));
        self.append_log(
            &transaction,
            None,
            &request.buyer,
            "transaction created".to_string(),
            now,
        )
        .await;

        self.hub
            .publish(
                Channel::User(transaction.seller_id),
                RealtimeEvent::Notification(UserNotification::TransactionUpdated {
                    transaction_id: transaction.id,
                    status: transaction.status,
                }),
            )
            .await;

        info!(
            transaction_id = %transaction.id,
            code = %transaction.code,
            amount = transaction.amount,
            "Created transaction"
        );

        Ok(transaction)
    }

    /// Buyer funds the escrow: pending -> deposited
    pub async fn fund_transaction(&self, request: TransitionRequest) -> EscrowResult<Transaction> {
        let actor = request.actor;
        self.transition(&request, TransitionEvent::Fund, |tx, _| {
            if actor.user_id != tx.buyer_id {
                return Err(EscrowError::unauthorized("only the buyer can fund the escrow"));
            }
            Ok(())
        })
        .await
    }

    /// Cancel a transaction.
    ///
    /// While pending any party, an admin or the system may cancel. Once
    /// funded only the seller (declining the trade) or an admin may, and the
    /// held amount is refunded.
    pub async fn cancel_transaction(&self, request: TransitionRequest) -> EscrowResult<Transaction> {
        let actor = request.actor;
        self.transition(&request, TransitionEvent::Cancel, |tx, _| {
            let allowed = match tx.status {
                TransactionStatus::Pending => {
                    tx.is_party(actor.user_id)
                        || actor.role.is_privileged()
                        || actor.role == Role::System
                }
                _ => actor.user_id == tx.seller_id || actor.role.is_privileged(),
            };
            if !allowed {
                return Err(EscrowError::unauthorized(format!(
                    "actor may not cancel a {} transaction",
                    tx.status
                )));
            }
            Ok(())
        })
        .await
    }

    /// Seller marks the goods as shipped: deposited -> shipping
    pub async fn mark_shipped(&self, request: TransitionRequest) -> EscrowResult<Transaction> {
        let actor = request.actor;
        self.transition(&request, TransitionEvent::Ship, |tx, now| {
            if actor.user_id != tx.seller_id {
                return Err(EscrowError::unauthorized("only the seller can mark as shipped"));
            }
            tx.shipped_at = Some(now);
            Ok(())
        })
        .await
    }

    /// Buyer confirms receipt: shipping -> completed, seller is paid
    pub async fn confirm_receipt(&self, request: TransitionRequest) -> EscrowResult<Transaction> {
        let actor = request.actor;
        self.transition(&request, TransitionEvent::ConfirmReceipt, |tx, _| {
            if actor.user_id != tx.buyer_id {
                return Err(EscrowError::unauthorized("only the buyer can confirm receipt"));
            }
            Ok(())
        })
        .await
    }

    /// A moderator joins the transaction to assist the parties
    pub async fn join_as_moderator(
        &self,
        transaction_id: Uuid,
        actor: Actor,
    ) -> EscrowResult<Transaction> {
        if !(actor.role == Role::Moderator || actor.role.is_privileged()) {
            return Err(EscrowError::unauthorized("only moderators can join"));
        }
        self.update_participants(transaction_id, &actor, "moderator joined", |tx| {
            tx.set_moderator(actor.user_id)
        })
        .await
    }

    /// Record the arbiter of a transaction
    pub(crate) async fn record_arbiter(
        &self,
        transaction_id: Uuid,
        actor: &Actor,
    ) -> EscrowResult<Transaction> {
        let arbiter_id = actor.user_id;
        self.update_participants(transaction_id, actor, "arbiter assigned", |tx| {
            tx.set_arbiter(arbiter_id)
        })
        .await
    }

    /// Cancel every pending transaction created before `cutoff`.
    ///
    /// Conditional per row: a transaction that left `pending` after it was
    /// selected no longer matches and is skipped.
    pub async fn cancel_stale_pending(
        &self,
        cutoff: DateTime<Utc>,
    ) -> EscrowResult<Vec<Transaction>> {
        let candidates = self
            .select(|tx| tx.status == TransactionStatus::Pending && tx.created_at < cutoff)
            .await;

        let mut cancelled = Vec::new();
        for candidate in candidates {
            let request =
                TransitionRequest::new(candidate.id, TransactionStatus::Pending, Actor::system())
                    .with_note("pending timeout elapsed");
            match self
                .transition(&request, TransitionEvent::Cancel, |_, _| Ok(()))
                .await
            {
                Ok(tx) => cancelled.push(tx),
                Err(err) => skip_or_log(candidate.id, err),
            }
        }
        Ok(cancelled)
    }

    /// Complete shipped transactions whose dispute window has elapsed
    pub async fn complete_elapsed_shipping(
        &self,
        now: DateTime<Utc>,
    ) -> EscrowResult<Vec<Transaction>> {
        let candidates = self
            .select(|tx| tx.status == TransactionStatus::Shipping && !tx.dispute_window_open(now))
            .await;

        let mut completed = Vec::new();
        for candidate in candidates {
            let request =
                TransitionRequest::new(candidate.id, TransactionStatus::Shipping, Actor::system())
                    .with_note("dispute window elapsed without objection");
            let result = self
                .transition(&request, TransitionEvent::DisputeWindowElapsed, |tx, _| {
                    if tx.dispute_window_open(now) {
                        return Err(EscrowError::validation("dispute window still open"));
                    }
                    Ok(())
                })
                .await;
            match result {
                Ok(tx) => completed.push(tx),
                Err(err) => skip_or_log(candidate.id, err),
            }
        }
        Ok(completed)
    }

    /// Get a transaction by ID
    pub async fn get_transaction(&self, transaction_id: Uuid) -> EscrowResult<Transaction> {
        let handle = self.handle(transaction_id).await?;
        let transaction = handle.lock().await.clone();
        Ok(transaction)
    }

    /// Get a transaction by its human-readable code
    pub async fn get_by_code(&self, code: &str) -> EscrowResult<Transaction> {
        self.select(|tx| tx.code.eq_ignore_ascii_case(code))
            .await
            .into_iter()
            .next()
            .ok_or_else(|| EscrowError::not_found(format!("Transaction {} not found", code)))
    }

    /// Get all transactions a user takes part in
    pub async fn get_user_transactions(&self, user_id: Uuid) -> EscrowResult<Vec<Transaction>> {
        let mut transactions = self.select(|tx| tx.is_participant(user_id)).await;
        transactions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(transactions)
    }

    /// Get transactions currently in `status`
    pub async fn get_by_status(&self, status: TransactionStatus) -> Vec<Transaction> {
        self.select(|tx| tx.status == status).await
    }

    /// Transition log of a transaction, oldest first
    pub async fn get_transaction_logs(
        &self,
        transaction_id: Uuid,
    ) -> EscrowResult<Vec<TransactionLog>> {
        Ok(self
            .logs
            .read()
            .await
            .iter()
            .filter(|log| log.transaction_id == transaction_id)
            .cloned()
            .collect())
    }

    /// Drive one transition.
    ///
    /// `prepare` runs on a copy of the row after the status check; it
    /// enforces actor guards and sets event-specific fields. The new status
    /// is committed only once its ledger effect succeeded, so a failed or
    /// ambiguous ledger call leaves the transaction untouched and the same
    /// request can be retried (ledger batches are keyed by transaction id and
    /// effect, which makes the retry idempotent).
    pub(crate) async fn transition<F>(
        &self,
        request: &TransitionRequest,
        event: TransitionEvent,
        prepare: F,
    ) -> EscrowResult<Transaction>
    where
        F: FnOnce(&mut Transaction, DateTime<Utc>) -> EscrowResult<()>,
    {
        let handle = self.handle(request.transaction_id).await?;
        let mut current = handle.lock().await;

        if current.status != request.expected_status {
            warn!(
                transaction_id = %current.id,
                expected = %request.expected_status,
                actual = %current.status,
                %event,
                "Rejected stale transition"
            );
            return Err(EscrowError::conflict(
                request.expected_status.as_str(),
                current.status.as_str(),
            ));
        }

        let next = current.validate_transition(event)?;
        let now = self.time.now();

        let mut candidate = current.clone();
        prepare(&mut candidate, now)?;
        candidate.status = next;
        candidate.updated_at = now;
        candidate.version += 1;
        if next.is_terminal() {
            candidate.completed_at = Some(now);
        }

        if let Some(action) = LedgerAction::for_transition(current.status, next) {
            if let Err(err) = self.apply_ledger(action, &candidate).await {
                error!(
                    transaction_id = %candidate.id,
                    from = %current.status,
                    to = %next,
                    error = %err,
                    "Ledger effect failed, transition not committed"
                );
                return Err(err);
            }
        }

        let before = std::mem::replace(&mut *current, candidate.clone());
        let note = request.note.clone().unwrap_or_else(|| event.to_string());
        self.append_log(&candidate, Some(before.status), &request.actor, note, now)
            .await;
        self.hub.publish_transaction_change(&before, &candidate).await;

        info!(
            transaction_id = %candidate.id,
            from = %before.status,
            to = %candidate.status,
            actor = %request.actor.user_id,
            "Transaction transitioned"
        );

        Ok(candidate)
    }

    async fn apply_ledger(
        &self,
        action: LedgerAction,
        transaction: &Transaction,
    ) -> EscrowResult<LedgerOutcome> {
        let outcome = match action {
            LedgerAction::Hold => self.ledger.hold_funds(transaction).await?,
            LedgerAction::Settle => self.ledger.settle_transaction(transaction).await?,
            LedgerAction::Refund => self.ledger.refund_transaction(transaction).await?,
        };
        if outcome == LedgerOutcome::AlreadyApplied {
            debug!(
                transaction_id = %transaction.id,
                ?action,
                "Ledger effect already booked by an earlier attempt"
            );
        }
        Ok(outcome)
    }

    async fn update_participants<F>(
        &self,
        transaction_id: Uuid,
        actor: &Actor,
        note: &str,
        update: F,
    ) -> EscrowResult<Transaction>
    where
        F: FnOnce(&mut Transaction) -> EscrowResult<bool>,
    {
        let handle = self.handle(transaction_id).await?;
        let mut current = handle.lock().await;

        if current.status.is_terminal() {
            return Err(EscrowError::validation(format!(
                "transaction {} is already {}",
                current.code, current.status
            )));
        }

        let mut candidate = current.clone();
        if !update(&mut candidate)? {
            return Ok(candidate);
        }
        let now = self.time.now();
        candidate.updated_at = now;
        candidate.version += 1;

        let before = std::mem::replace(&mut *current, candidate.clone());
        self.append_log(
            &candidate,
            Some(before.status),
            actor,
            note.to_string(),
            now,
        )
        .await;
        self.hub.publish_transaction_change(&before, &candidate).await;

        info!(transaction_id = %candidate.id, actor = %actor.user_id, "{}", note);
        Ok(candidate)
    }

    async fn handle(&self, transaction_id: Uuid) -> EscrowResult<TransactionHandle> {
        self.transactions
            .read()
            .await
            .get(&transaction_id)
            .cloned()
            .ok_or_else(|| {
                EscrowError::not_found(format!("Transaction {} not found", transaction_id))
            })
    }

    /// Snapshot of every row matching `filter`
    async fn select<P>(&self, filter: P) -> Vec<Transaction>
    where
        P: Fn(&Transaction) -> bool,
    {
        let handles: Vec<TransactionHandle> =
            self.transactions.read().await.values().cloned().collect();

        let mut matching = Vec::new();
        for handle in handles {
            let tx = handle.lock().await;
            if filter(&tx) {
                matching.push(tx.clone());
            }
        }
        matching
    }

    async fn append_log(
        &self,
        transaction: &Transaction,
        old_status: Option<TransactionStatus>,
        actor: &Actor,
        note: String,
        now: DateTime<Utc>,
    ) {
        self.logs.write().await.push(TransactionLog {
            id: Uuid::new_v4(),
            transaction_id: transaction.id,
            old_status,
            new_status: transaction.status,
            actor_id: actor.user_id,
            actor_role: actor.role,
            note,
            created_at: now,
        });
    }

    /// Validate transaction creation request
    fn validate_create_request(&self, request: &CreateTransactionRequest) -> EscrowResult<()> {
        if request.buyer.role == Role::System {
            return Err(EscrowError::validation("transactions are created by buyers"));
        }

        if request.product_name.trim().is_empty() {
            return Err(EscrowError::validation("Product name cannot be empty"));
        }

        if request.buyer.user_id == request.seller_id {
            return Err(EscrowError::validation("Buyer and seller must differ"));
        }

        if request.amount < self.config.min_transaction_amount {
            return Err(EscrowError::validation(format!(
                "Amount {} is below the platform minimum {}",
                request.amount, self.config.min_transaction_amount
            )));
        }

        if let Some(hours) = request.dispute_window_hours {
            if hours == 0 || hours > MAX_DISPUTE_WINDOW_HOURS {
                return Err(EscrowError::validation(format!(
                    "Dispute window must be between 1 and {} hours",
                    MAX_DISPUTE_WINDOW_HOURS
                )));
            }
        }

        Ok(())
    }
}

/// Rows that stopped matching a sweep filter are expected; anything else is
/// logged and left for the next run.
fn skip_or_log(transaction_id: Uuid, err: EscrowError) {
    match err {
        EscrowError::Conflict { .. } | EscrowError::StateTransition { .. } => {
            debug!(%transaction_id, "Row no longer matches sweep filter");
        }
        EscrowError::Validation(_) => {
            debug!(%transaction_id, error = %err, "Sweep guard declined row");
        }
        other => {
            error!(%transaction_id, error = %other, "Sweep transition failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ledger::{Account, EventKey, InMemoryLedger, LedgerEntry, PostingBatch},
        time::ManualTimeSource,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Ledger whose first `failures` posts fail after being applied, like a
    /// timeout on a call that actually committed.
    struct AmbiguousLedger {
        inner: InMemoryLedger,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl Ledger for AmbiguousLedger {
        async fn post(&self, batch: PostingBatch) -> EscrowResult<LedgerOutcome> {
            let outcome = self.inner.post(batch).await?;
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(EscrowError::integration("ledger call timed out"));
            }
            Ok(outcome)
        }

        async fn balance(&self, account: Account) -> EscrowResult<Amount> {
            self.inner.balance(account).await
        }

        async fn is_applied(&self, key: EventKey) -> EscrowResult<bool> {
            self.inner.is_applied(key).await
        }

        async fn entries_for(&self, source_id: Uuid) -> EscrowResult<Vec<LedgerEntry>> {
            self.inner.entries_for(source_id).await
        }
    }

    struct Fixture {
        manager: TransactionManager,
        ledger: Arc<dyn Ledger>,
        buyer: Actor,
        seller: Actor,
    }

    async fn fixture_with(ledger: Arc<dyn Ledger>) -> Fixture {
        let time: Arc<dyn TimeSource> = Arc::new(ManualTimeSource::default());
        let manager = TransactionManager::new(
            TransactionManagerConfig::default(),
            ledger.clone(),
            Arc::new(RealtimeHub::new(16)),
            time,
        );
        let buyer = Actor::member(Uuid::new_v4());
        ledger
            .adjust_balance(Uuid::new_v4(), buyer.user_id, 1_000_000, "seed")
            .await
            .unwrap();
        Fixture {
            manager,
            ledger,
            buyer,
            seller: Actor::member(Uuid::new_v4()),
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(Arc::new(InMemoryLedger::default())).await
    }

    async fn create(f: &Fixture, amount: Amount) -> EscrowResult<Transaction> {
        f.manager
            .create_transaction(CreateTransactionRequest {
                buyer: f.buyer,
                seller_id: f.seller.user_id,
                product_name: "Console".to_string(),
                amount,
                category: "electronics".to_string(),
                dispute_window_hours: None,
            })
            .await
    }

    #[tokio::test]
    async fn test_create_below_minimum_rejected() {
        let f = fixture().await;
        let err = create(&f, 9_999).await.unwrap_err();
        assert!(matches!(err, EscrowError::Validation(ref msg) if msg.contains("minimum")));
        assert!(f.manager.get_by_status(TransactionStatus::Pending).await.is_empty());
    }

    #[tokio::test]
    async fn test_fund_moves_buyer_balance() {
        let f = fixture().await;
        let tx = create(&f, 500_000).await.unwrap();
        let funded = f
            .manager
            .fund_transaction(TransitionRequest::new(tx.id, TransactionStatus::Pending, f.buyer))
            .await
            .unwrap();

        assert_eq!(funded.status, TransactionStatus::Deposited);
        assert_eq!(funded.version, 1);
        assert_eq!(f.ledger.balance(Account::User(f.buyer.user_id)).await.unwrap(), 500_000);
        assert_eq!(f.ledger.balance(Account::Escrow(tx.id)).await.unwrap(), 500_000);
    }

    #[tokio::test]
    async fn test_insufficient_balance_keeps_pending() {
        let f = fixture().await;
        let tx = create(&f, 2_000_000).await.unwrap();
        let err = f
            .manager
            .fund_transaction(TransitionRequest::new(tx.id, TransactionStatus::Pending, f.buyer))
            .await
            .unwrap_err();

        assert!(matches!(err, EscrowError::InsufficientBalance { .. }));
        let stored = f.manager.get_transaction(tx.id).await.unwrap();
        assert_eq!(stored.status, TransactionStatus::Pending);
        assert_eq!(f.manager.get_transaction_logs(tx.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_expected_status_is_conflict() {
        let f = fixture().await;
        let tx = create(&f, 50_000).await.unwrap();
        f.manager
            .fund_transaction(TransitionRequest::new(tx.id, TransactionStatus::Pending, f.buyer))
            .await
            .unwrap();

        let err = f
            .manager
            .cancel_transaction(TransitionRequest::new(tx.id, TransactionStatus::Pending, f.buyer))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Conflict { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_only_seller_ships() {
        let f = fixture().await;
        let tx = create(&f, 50_000).await.unwrap();
        f.manager
            .fund_transaction(TransitionRequest::new(tx.id, TransactionStatus::Pending, f.buyer))
            .await
            .unwrap();

        let err = f
            .manager
            .mark_shipped(TransitionRequest::new(tx.id, TransactionStatus::Deposited, f.buyer))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Unauthorized(_)));

        let shipped = f
            .manager
            .mark_shipped(TransitionRequest::new(tx.id, TransactionStatus::Deposited, f.seller))
            .await
            .unwrap();
        assert_eq!(shipped.status, TransactionStatus::Shipping);
        assert!(shipped.shipped_at.is_some());
    }

    #[tokio::test]
    async fn test_seller_decline_refunds_buyer() {
        let f = fixture().await;
        let tx = create(&f, 80_000).await.unwrap();
        f.manager
            .fund_transaction(TransitionRequest::new(tx.id, TransactionStatus::Pending, f.buyer))
            .await
            .unwrap();

        let buyer_cancel = f
            .manager
            .cancel_transaction(TransitionRequest::new(tx.id, TransactionStatus::Deposited, f.buyer))
            .await;
        assert!(matches!(buyer_cancel, Err(EscrowError::Unauthorized(_))));

        let cancelled = f
            .manager
            .cancel_transaction(
                TransitionRequest::new(tx.id, TransactionStatus::Deposited, f.seller)
                    .with_note("out of stock"),
            )
            .await
            .unwrap();
        assert_eq!(cancelled.status, TransactionStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());
        assert_eq!(
            f.ledger.balance(Account::User(f.buyer.user_id)).await.unwrap(),
            1_000_000
        );
    }

    #[tokio::test]
    async fn test_ambiguous_ledger_failure_is_retryable() {
        let ledger = Arc::new(AmbiguousLedger {
            inner: InMemoryLedger::default(),
            failures: AtomicUsize::new(0),
        });
        let f = fixture_with(ledger.clone()).await;
        let tx = create(&f, 100_000).await.unwrap();

        ledger.failures.store(1, Ordering::SeqCst);
        let request = TransitionRequest::new(tx.id, TransactionStatus::Pending, f.buyer);
        let err = f.manager.fund_transaction(request.clone()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            f.manager.get_transaction(tx.id).await.unwrap().status,
            TransactionStatus::Pending
        );

        let funded = f.manager.fund_transaction(request).await.unwrap();
        assert_eq!(funded.status, TransactionStatus::Deposited);
        assert_eq!(
            f.ledger.balance(Account::User(f.buyer.user_id)).await.unwrap(),
            900_000
        );
    }

    #[tokio::test]
    async fn test_every_transition_logged() {
        let f = fixture().await;
        let tx = create(&f, 40_000).await.unwrap();
        f.manager
            .fund_transaction(TransitionRequest::new(tx.id, TransactionStatus::Pending, f.buyer))
            .await
            .unwrap();
        f.manager
            .mark_shipped(TransitionRequest::new(tx.id, TransactionStatus::Deposited, f.seller))
            .await
            .unwrap();
        f.manager
            .confirm_receipt(TransitionRequest::new(tx.id, TransactionStatus::Shipping, f.buyer))
            .await
            .unwrap();

        let logs = f.manager.get_transaction_logs(tx.id).await.unwrap();
        let path: Vec<_> = logs.iter().map(|l| (l.old_status, l.new_status)).collect();
        assert_eq!(
            path,
            vec![
                (None, TransactionStatus::Pending),
                (Some(TransactionStatus::Pending), TransactionStatus::Deposited),
                (Some(TransactionStatus::Deposited), TransactionStatus::Shipping),
                (Some(TransactionStatus::Shipping), TransactionStatus::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn test_moderator_join_is_append_only() {
        let f = fixture().await;
        let tx = create(&f, 40_000).await.unwrap();
        let moderator = Actor::new(Uuid::new_v4(), Role::Moderator);

        let joined = f.manager.join_as_moderator(tx.id, moderator).await.unwrap();
        assert_eq!(joined.moderator_id, Some(moderator.user_id));
        let again = f.manager.join_as_moderator(tx.id, moderator).await.unwrap();
        assert_eq!(again.version, joined.version);

        let other = Actor::new(Uuid::new_v4(), Role::Moderator);
        assert!(f.manager.join_as_moderator(tx.id, other).await.is_err());
        assert!(f
            .manager
            .join_as_moderator(tx.id, Actor::member(Uuid::new_v4()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_concurrent_ship_and_cancel_one_wins() {
        let f = Arc::new(fixture().await);
        let tx = create(&f, 60_000).await.unwrap();
        f.manager
            .fund_transaction(TransitionRequest::new(tx.id, TransactionStatus::Pending, f.buyer))
            .await
            .unwrap();

        let ship = {
            let f = f.clone();
            tokio::spawn(async move {
                f.manager
                    .mark_shipped(TransitionRequest::new(
                        tx.id,
                        TransactionStatus::Deposited,
                        f.seller,
                    ))
                    .await
            })
        };
        let cancel = {
            let f = f.clone();
            tokio::spawn(async move {
                f.manager
                    .cancel_transaction(TransitionRequest::new(
                        tx.id,
                        TransactionStatus::Deposited,
                        f.seller,
                    ))
                    .await
            })
        };

        let results = [ship.await.unwrap(), cancel.await.unwrap()];
        let successes = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(EscrowError::Conflict { .. }))));
    }
}
