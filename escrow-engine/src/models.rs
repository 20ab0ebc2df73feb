//! Core data models for the escrow system
//!
//! This module contains the persisted records (transactions, deposits,
//! withdrawals, audit trails), the transaction state machine, and the
//! participant identity types shared by every component.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{error::EscrowError, ledger::fee_for, EscrowResult};

/// Money in integer minor units
pub type Amount = i64;

/// Privilege tier of an actor, as established by the session layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Member,
    Moderator,
    Admin,
    SuperAdmin,
    /// Scheduled jobs and other non-human callers
    System,
}

impl Role {
    pub fn is_privileged(&self) -> bool {
        matches!(self, Self::Admin | Self::SuperAdmin)
    }

    pub fn is_highest_tier(&self) -> bool {
        matches!(self, Self::SuperAdmin)
    }

    pub fn can_arbitrate(&self) -> bool {
        self.is_privileged()
    }
}

/// Authenticated caller of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: Uuid, role: Role) -> Self {
        Self { user_id, role }
    }

    pub fn member(user_id: Uuid) -> Self {
        Self::new(user_id, Role::Member)
    }

    pub fn system() -> Self {
        Self::new(Uuid::nil(), Role::System)
    }
}

/// Transaction state machine enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Created by the buyer, no funds held
    Pending,
    /// Buyer funds held in escrow
    Deposited,
    /// Seller marked the goods as shipped
    Shipping,
    /// Under arbitration
    Disputed,
    /// Funds released to the seller
    Completed,
    /// Abandoned before or right after funding
    Cancelled,
    /// Funds returned to the buyer after arbitration
    Refunded,
}

impl TransactionStatus {
    pub const ALL: [TransactionStatus; 7] = [
        Self::Pending,
        Self::Deposited,
        Self::Shipping,
        Self::Disputed,
        Self::Completed,
        Self::Cancelled,
        Self::Refunded,
    ];

    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Refunded)
    }

    /// Check if funds are currently held in escrow for this state
    pub fn holds_funds(&self) -> bool {
        matches!(self, Self::Deposited | Self::Shipping | Self::Disputed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Deposited => "deposited",
            Self::Shipping => "shipping",
            Self::Disputed => "disputed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }

    /// Apply an event to this state.
    ///
    /// Total over every (state, event) pair: pairs outside the transition
    /// table yield a `StateTransition` error instead of a new state.
    pub fn next(self, event: TransitionEvent) -> EscrowResult<TransactionStatus> {
        use TransactionStatus::*;
        use TransitionEvent::*;

        let next = match (self, event) {
            (Pending, Fund) => Some(Deposited),
            (Pending, Cancel) => Some(Cancelled),
            (Deposited, Cancel) => Some(Cancelled),
            (Deposited, Ship) => Some(Shipping),
            (Deposited, RaiseDispute) | (Shipping, RaiseDispute) => Some(Disputed),
            (Shipping, ConfirmReceipt) | (Shipping, DisputeWindowElapsed) => Some(Completed),
            (Disputed, ResolveForSeller) => Some(Completed),
            (Disputed, ResolveForBuyer) => Some(Refunded),
            _ => None,
        };

        next.ok_or_else(|| {
            EscrowError::state_transition(
                self.as_str().to_string(),
                event.target_hint().to_string(),
                format!("{} is not allowed from {}", event, self),
            )
        })
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trigger of a state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionEvent {
    Fund,
    Cancel,
    Ship,
    RaiseDispute,
    ConfirmReceipt,
    DisputeWindowElapsed,
    ResolveForSeller,
    ResolveForBuyer,
}

impl TransitionEvent {
    pub const ALL: [TransitionEvent; 8] = [
        Self::Fund,
        Self::Cancel,
        Self::Ship,
        Self::RaiseDispute,
        Self::ConfirmReceipt,
        Self::DisputeWindowElapsed,
        Self::ResolveForSeller,
        Self::ResolveForBuyer,
    ];

    fn target_hint(&self) -> &'static str {
        match self {
            Self::Fund => "deposited",
            Self::Cancel => "cancelled",
            Self::Ship => "shipping",
            Self::RaiseDispute => "disputed",
            Self::ConfirmReceipt | Self::DisputeWindowElapsed | Self::ResolveForSeller => {
                "completed"
            }
            Self::ResolveForBuyer => "refunded",
        }
    }
}

impl fmt::Display for TransitionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Fund => "fund",
            Self::Cancel => "cancel",
            Self::Ship => "ship",
            Self::RaiseDispute => "raise_dispute",
            Self::ConfirmReceipt => "confirm_receipt",
            Self::DisputeWindowElapsed => "dispute_window_elapsed",
            Self::ResolveForSeller => "resolve_for_seller",
            Self::ResolveForBuyer => "resolve_for_buyer",
        };
        f.write_str(name)
    }
}

/// Money effect attached to a committed transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerAction {
    /// Debit the buyer and hold the amount in escrow
    Hold,
    /// Release the held amount to the seller minus the platform fee
    Settle,
    /// Return the held amount to the buyer
    Refund,
}

impl LedgerAction {
    /// Ledger effect for moving from `from` to `to`, if any
    pub fn for_transition(from: TransactionStatus, to: TransactionStatus) -> Option<Self> {
        use TransactionStatus::*;
        match (from, to) {
            (Pending, Deposited) => Some(Self::Hold),
            (_, Completed) => Some(Self::Settle),
            (_, Refunded) => Some(Self::Refund),
            (from, Cancelled) if from.holds_funds() => Some(Self::Refund),
            _ => None,
        }
    }
}

/// A single escrow trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    /// Human-readable reference shown to participants
    pub code: String,

    // Parties
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    pub moderator_id: Option<Uuid>,
    pub arbiter_id: Option<Uuid>,

    // Commercial
    pub product_name: String,
    pub amount: Amount,
    pub fee_percent: Decimal,
    pub category: String,

    // Lifecycle
    pub status: TransactionStatus,
    pub dispute_reason: Option<String>,
    pub disputed_by: Option<Uuid>,
    pub dispute_window_hours: u32,
    /// Incremented on every committed mutation
    pub version: u64,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Create a new pending transaction
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        buyer_id: Uuid,
        seller_id: Uuid,
        product_name: String,
        amount: Amount,
        fee_percent: Decimal,
        category: String,
        dispute_window_hours: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            code: transaction_code(&id),
            buyer_id,
            seller_id,
            moderator_id: None,
            arbiter_id: None,
            product_name,
            amount,
            fee_percent,
            category,
            status: TransactionStatus::Pending,
            dispute_reason: None,
            disputed_by: None,
            dispute_window_hours,
            version: 0,
            created_at: now,
            updated_at: now,
            shipped_at: None,
            completed_at: None,
        }
    }

    pub fn is_party(&self, user_id: Uuid) -> bool {
        self.buyer_id == user_id || self.seller_id == user_id
    }

    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.is_party(user_id)
            || self.moderator_id == Some(user_id)
            || self.arbiter_id == Some(user_id)
    }

    /// Platform fee charged on settlement
    pub fn fee_amount(&self) -> EscrowResult<Amount> {
        fee_for(self.amount, self.fee_percent)
    }

    /// Amount credited to the seller on settlement
    pub fn seller_net(&self) -> EscrowResult<Amount> {
        Ok(self.amount - self.fee_amount()?)
    }

    /// End of the dispute window, once the goods have shipped
    pub fn dispute_deadline(&self) -> Option<DateTime<Utc>> {
        self.shipped_at
            .map(|shipped| shipped + Duration::hours(i64::from(self.dispute_window_hours)))
    }

    /// Whether a dispute may still be raised at `now`
    pub fn dispute_window_open(&self, now: DateTime<Utc>) -> bool {
        match self.dispute_deadline() {
            Some(deadline) => now < deadline,
            None => true,
        }
    }

    /// Record the moderator; once set it can never be replaced or cleared
    pub fn set_moderator(&mut self, moderator_id: Uuid) -> EscrowResult<bool> {
        append_only(&mut self.moderator_id, moderator_id, "moderator")
    }

    /// Record the arbiter; once set it can never be replaced or cleared
    pub fn set_arbiter(&mut self, arbiter_id: Uuid) -> EscrowResult<bool> {
        append_only(&mut self.arbiter_id, arbiter_id, "arbiter")
    }

    /// Validate a state transition
    pub fn validate_transition(&self, event: TransitionEvent) -> EscrowResult<TransactionStatus> {
        if self.status.is_terminal() {
            return Err(EscrowError::state_transition(
                self.status.as_str().to_string(),
                event.target_hint().to_string(),
                "transaction is already closed".to_string(),
            ));
        }
        self.status.next(event)
    }
}

fn append_only(slot: &mut Option<Uuid>, value: Uuid, label: &str) -> EscrowResult<bool> {
    match *slot {
        None => {
            *slot = Some(value);
            Ok(true)
        }
        Some(existing) if existing == value => Ok(false),
        Some(existing) => Err(EscrowError::conflict(
            format!("no {} or {} {}", label, label, value),
            format!("{} {} already assigned", label, existing),
        )),
    }
}

fn transaction_code(id: &Uuid) -> String {
    let simple = id.simple().to_string().to_uppercase();
    format!("TX-{}", &simple[..8])
}

/// Append-only audit record of a status transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionLog {
    pub id: Uuid,
    pub transaction_id: Uuid,
    /// `None` for the creation entry
    pub old_status: Option<TransactionStatus>,
    pub new_status: TransactionStatus,
    pub actor_id: Uuid,
    pub actor_role: Role,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

/// Deposit status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    Pending,
    Confirmed,
    Rejected,
}

/// A buyer's funding request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deposit {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: Amount,
    pub payment_method: String,
    pub status: DepositStatus,
    /// User asserted the transfer was made
    pub is_submitted: bool,
    pub admin_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Deposit {
    pub fn new(user_id: Uuid, amount: Amount, payment_method: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            amount,
            payment_method,
            status: DepositStatus::Pending,
            is_submitted: false,
            admin_note: None,
            created_at: now,
            submitted_at: None,
            resolved_at: None,
        }
    }

    /// Only submitted pending deposits are live requests for an admin
    pub fn awaiting_confirmation(&self) -> bool {
        self.status == DepositStatus::Pending && self.is_submitted
    }
}

/// Withdrawal status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Completed,
    Rejected,
}

/// Bank account a payout is sent to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankDestination {
    pub bank_name: String,
    pub account_number: String,
    pub account_holder: String,
}

/// A payout request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: Amount,
    pub destination: BankDestination,
    pub status: WithdrawalStatus,
    pub admin_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Withdrawal {
    pub fn new(
        user_id: Uuid,
        amount: Amount,
        destination: BankDestination,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            amount,
            destination,
            status: WithdrawalStatus::Pending,
            admin_note: None,
            created_at: now,
            completed_at: None,
        }
    }
}

/// Kind of privileged mutation recorded in the admin audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminActionType {
    AdjustBalance,
    ConfirmDeposit,
    RejectDeposit,
    ConfirmWithdrawal,
    RejectWithdrawal,
    ResolveDispute,
    ResolveRiskAlert,
    DeleteRiskAlert,
}

/// Append-only audit record of a privileged mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminActionLog {
    pub id: Uuid,
    pub actor_id: Uuid,
    pub target_user_id: Option<Uuid>,
    pub action: AdminActionType,
    pub details: serde_json::Value,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Flag raised against a user or transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAlert {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub transaction_id: Option<Uuid>,
    pub severity: RiskSeverity,
    pub description: String,
    pub is_resolved: bool,
    pub resolved_by: Option<Uuid>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Chat message posted on a transaction channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub sender_id: Uuid,
    pub body: String,
    /// Temporary id chosen by the sending client for optimistic display
    pub client_ref: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}
