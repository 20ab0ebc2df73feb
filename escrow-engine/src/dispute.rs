//! Dispute arbitration
//!
//! Layered on the transaction state machine. A party opens a dispute with a
//! mandatory reason while the dispute window is open; from then on only an
//! arbiter may close it, either paying the seller or refunding the buyer.
//! There is no partial settlement.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::{
    audit::AuditTrail,
    error::EscrowError,
    models::{Actor, AdminActionType, Transaction, TransactionStatus, TransitionEvent},
    transaction_manager::{TransactionManager, TransitionRequest},
    EscrowResult,
};

/// Outcome chosen by the arbiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeResolution {
    /// Release the held amount to the seller minus the fee
    ReleaseToSeller,
    /// Return the full held amount to the buyer
    RefundBuyer,
}

/// Dispute opening request
#[derive(Debug, Clone)]
pub struct RaiseDisputeRequest {
    pub transaction_id: Uuid,
    pub expected_status: TransactionStatus,
    pub actor: Actor,
    pub reason: String,
}

/// Dispute resolution request
#[derive(Debug, Clone)]
pub struct ResolveDisputeRequest {
    pub transaction_id: Uuid,
    pub actor: Actor,
    pub resolution: DisputeResolution,
    pub note: Option<String>,
}

pub struct DisputeArbitration {
    manager: Arc<TransactionManager>,
    audit: Arc<AuditTrail>,
}

impl DisputeArbitration {
    pub fn new(manager: Arc<TransactionManager>, audit: Arc<AuditTrail>) -> Self {
        Self { manager, audit }
    }

    /// Buyer or seller opens a dispute: deposited/shipping -> disputed
    pub async fn raise_dispute(&self, request: RaiseDisputeRequest) -> EscrowResult<Transaction> {
        let reason = request.reason.trim().to_string();
        if reason.is_empty() {
            return Err(EscrowError::dispute("A dispute reason is required"));
        }

        let actor = request.actor;
        let transition = TransitionRequest::new(
            request.transaction_id,
            request.expected_status,
            request.actor,
        )
        .with_note(format!("dispute raised: {}", reason));

        let disputed = self
            .manager
            .transition(&transition, TransitionEvent::RaiseDispute, |tx, now| {
                if !tx.is_party(actor.user_id) {
                    return Err(EscrowError::unauthorized(
                        "only the buyer or seller can raise a dispute",
                    ));
                }
                if !tx.dispute_window_open(now) {
                    return Err(EscrowError::dispute(format!(
                        "the {} hour dispute window has closed",
                        tx.dispute_window_hours
                    )));
                }
                tx.dispute_reason = Some(reason);
                tx.disputed_by = Some(actor.user_id);
                Ok(())
            })
            .await?;

        info!(
            transaction_id = %disputed.id,
            raised_by = %actor.user_id,
            "Dispute raised"
        );
        Ok(disputed)
    }

    /// An arbiter takes ownership of a disputed transaction
    pub async fn assign_arbiter(
        &self,
        transaction_id: Uuid,
        actor: Actor,
    ) -> EscrowResult<Transaction> {
        Self::ensure_arbiter_role(&actor)?;

        let current = self.manager.get_transaction(transaction_id).await?;
        if current.status != TransactionStatus::Disputed {
            return Err(EscrowError::dispute(format!(
                "transaction {} is {}, not disputed",
                current.code, current.status
            )));
        }
        self.manager.record_arbiter(transaction_id, &actor).await
    }

    /// Close a dispute: disputed -> completed or refunded
    pub async fn resolve_dispute(
        &self,
        request: ResolveDisputeRequest,
    ) -> EscrowResult<Transaction> {
        Self::ensure_arbiter_role(&request.actor)?;

        let current = self.manager.get_transaction(request.transaction_id).await?;
        match current.arbiter_id {
            Some(arbiter) if arbiter != request.actor.user_id => {
                return Err(EscrowError::unauthorized(
                    "dispute is assigned to another arbiter",
                ));
            }
            Some(_) => {}
            None if current.status == TransactionStatus::Disputed => {
                // Losing a race to another arbiter surfaces as a conflict.
                self.manager
                    .record_arbiter(request.transaction_id, &request.actor)
                    .await
                    .map_err(|err| match err {
                        EscrowError::Validation(_) => EscrowError::conflict(
                            TransactionStatus::Disputed.as_str().to_string(),
                            "resolved by another arbiter".to_string(),
                        ),
                        other => other,
                    })?;
            }
            None => {}
        }

        let event = match request.resolution {
            DisputeResolution::ReleaseToSeller => TransitionEvent::ResolveForSeller,
            DisputeResolution::RefundBuyer => TransitionEvent::ResolveForBuyer,
        };
        let note = request
            .note
            .clone()
            .unwrap_or_else(|| format!("dispute resolved: {:?}", request.resolution));
        let transition = TransitionRequest::new(
            request.transaction_id,
            TransactionStatus::Disputed,
            request.actor,
        )
        .with_note(note.clone());

        let arbiter_id = request.actor.user_id;
        let resolved = self
            .manager
            .transition(&transition, event, |tx, _| {
                if tx.dispute_reason.is_none() {
                    return Err(EscrowError::dispute("dispute has no recorded reason"));
                }
                if tx.arbiter_id != Some(arbiter_id) {
                    return Err(EscrowError::unauthorized(
                        "dispute is assigned to another arbiter",
                    ));
                }
                Ok(())
            })
            .await?;

        self.audit
            .record(
                &request.actor,
                Some(match request.resolution {
                    DisputeResolution::ReleaseToSeller => resolved.seller_id,
                    DisputeResolution::RefundBuyer => resolved.buyer_id,
                }),
                AdminActionType::ResolveDispute,
                serde_json::json!({
                    "transaction_id": resolved.id,
                    "code": resolved.code,
                    "resolution": request.resolution,
                    "amount": resolved.amount,
                }),
                Some(note),
            )
            .await;

        info!(
            transaction_id = %resolved.id,
            arbiter = %arbiter_id,
            status = %resolved.status,
            "Dispute resolved"
        );
        Ok(resolved)
    }

    fn ensure_arbiter_role(actor: &Actor) -> EscrowResult<()> {
        if !actor.role.can_arbitrate() {
            return Err(EscrowError::unauthorized("only arbiters can resolve disputes"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AuditConfig,
        ledger::{Account, InMemoryLedger, Ledger},
        models::Role,
        realtime::RealtimeHub,
        time::{ManualTimeSource, TimeSource},
        transaction_manager::{CreateTransactionRequest, TransactionManagerConfig},
    };
    use chrono::Duration;

    struct Fixture {
        manager: Arc<TransactionManager>,
        arbitration: DisputeArbitration,
        ledger: Arc<InMemoryLedger>,
        audit: Arc<AuditTrail>,
        clock: Arc<ManualTimeSource>,
        buyer: Actor,
        seller: Actor,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualTimeSource::default());
        let time: Arc<dyn TimeSource> = clock.clone();
        let ledger = Arc::new(InMemoryLedger::new(time.clone()));
        let manager = Arc::new(TransactionManager::new(
            TransactionManagerConfig::default(),
            ledger.clone(),
            Arc::new(RealtimeHub::new(16)),
            time.clone(),
        ));
        let audit = Arc::new(AuditTrail::new(AuditConfig::default(), time));
        let buyer = Actor::member(Uuid::new_v4());
        ledger
            .adjust_balance(Uuid::new_v4(), buyer.user_id, 500_000, "seed")
            .await
            .unwrap();
        Fixture {
            arbitration: DisputeArbitration::new(manager.clone(), audit.clone()),
            manager,
            ledger,
            audit,
            clock,
            buyer,
            seller: Actor::member(Uuid::new_v4()),
        }
    }

    async fn shipped(f: &Fixture, amount: i64) -> Transaction {
        let tx = f
            .manager
            .create_transaction(CreateTransactionRequest {
                buyer: f.buyer,
                seller_id: f.seller.user_id,
                product_name: "Phone".to_string(),
                amount,
                category: "electronics".to_string(),
                dispute_window_hours: Some(24),
            })
            .await
            .unwrap();
        f.manager
            .fund_transaction(TransitionRequest::new(tx.id, TransactionStatus::Pending, f.buyer))
            .await
            .unwrap();
        f.manager
            .mark_shipped(TransitionRequest::new(tx.id, TransactionStatus::Deposited, f.seller))
            .await
            .unwrap()
    }

    fn dispute(f: &Fixture, tx: &Transaction, reason: &str) -> RaiseDisputeRequest {
        RaiseDisputeRequest {
            transaction_id: tx.id,
            expected_status: TransactionStatus::Shipping,
            actor: f.buyer,
            reason: reason.to_string(),
        }
    }

    #[tokio::test]
    async fn test_reason_is_mandatory() {
        let f = fixture().await;
        let tx = shipped(&f, 100_000).await;
        let err = f.arbitration.raise_dispute(dispute(&f, &tx, "   ")).await.unwrap_err();
        assert!(matches!(err, EscrowError::Dispute(_)));
    }

    #[tokio::test]
    async fn test_window_closed_rejects_dispute() {
        let f = fixture().await;
        let tx = shipped(&f, 100_000).await;
        f.clock.advance(Duration::hours(25));
        let err = f
            .arbitration
            .raise_dispute(dispute(&f, &tx, "never arrived"))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Dispute(ref msg) if msg.contains("window")));
        assert_eq!(
            f.manager.get_transaction(tx.id).await.unwrap().status,
            TransactionStatus::Shipping
        );
    }

    #[tokio::test]
    async fn test_refund_resolution_returns_full_amount() {
        let f = fixture().await;
        let tx = shipped(&f, 100_000).await;
        f.arbitration
            .raise_dispute(dispute(&f, &tx, "wrong item"))
            .await
            .unwrap();

        let arbiter = Actor::new(Uuid::new_v4(), Role::Admin);
        let resolved = f
            .arbitration
            .resolve_dispute(ResolveDisputeRequest {
                transaction_id: tx.id,
                actor: arbiter,
                resolution: DisputeResolution::RefundBuyer,
                note: None,
            })
            .await
            .unwrap();

        assert_eq!(resolved.status, TransactionStatus::Refunded);
        assert_eq!(resolved.arbiter_id, Some(arbiter.user_id));
        assert_eq!(resolved.dispute_reason.as_deref(), Some("wrong item"));
        assert_eq!(f.ledger.balance(Account::User(f.buyer.user_id)).await.unwrap(), 500_000);
        assert_eq!(f.ledger.balance(Account::User(f.seller.user_id)).await.unwrap(), 0);
        assert_eq!(f.ledger.platform_revenue().await, 0);
        assert_eq!(f.audit.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_parties_and_moderators_cannot_resolve() {
        let f = fixture().await;
        let tx = shipped(&f, 100_000).await;
        f.arbitration
            .raise_dispute(dispute(&f, &tx, "damaged"))
            .await
            .unwrap();

        for actor in [f.buyer, f.seller, Actor::new(Uuid::new_v4(), Role::Moderator)] {
            let err = f
                .arbitration
                .resolve_dispute(ResolveDisputeRequest {
                    transaction_id: tx.id,
                    actor,
                    resolution: DisputeResolution::ReleaseToSeller,
                    note: None,
                })
                .await
                .unwrap_err();
            assert!(matches!(err, EscrowError::Unauthorized(_)));
        }
    }

    #[tokio::test]
    async fn test_assigned_arbiter_is_exclusive() {
        let f = fixture().await;
        let tx = shipped(&f, 100_000).await;
        f.arbitration
            .raise_dispute(dispute(&f, &tx, "damaged"))
            .await
            .unwrap();

        let first = Actor::new(Uuid::new_v4(), Role::Admin);
        let second = Actor::new(Uuid::new_v4(), Role::Admin);
        f.arbitration.assign_arbiter(tx.id, first).await.unwrap();

        let err = f
            .arbitration
            .resolve_dispute(ResolveDisputeRequest {
                transaction_id: tx.id,
                actor: second,
                resolution: DisputeResolution::ReleaseToSeller,
                note: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Unauthorized(_)));

        let resolved = f
            .arbitration
            .resolve_dispute(ResolveDisputeRequest {
                transaction_id: tx.id,
                actor: first,
                resolution: DisputeResolution::ReleaseToSeller,
                note: Some("tracking shows delivery".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(resolved.status, TransactionStatus::Completed);
        assert_eq!(f.ledger.balance(Account::User(f.seller.user_id)).await.unwrap(), 95_000);
        assert_eq!(f.ledger.platform_revenue().await, 5_000);
    }

    #[tokio::test]
    async fn test_second_arbiter_claim_is_conflict() {
        let f = fixture().await;
        let tx = shipped(&f, 100_000).await;
        f.arbitration
            .raise_dispute(dispute(&f, &tx, "damaged"))
            .await
            .unwrap();

        let first = Actor::new(Uuid::new_v4(), Role::Admin);
        let second = Actor::new(Uuid::new_v4(), Role::Admin);
        f.arbitration.assign_arbiter(tx.id, first).await.unwrap();
        let err = f.arbitration.assign_arbiter(tx.id, second).await.unwrap_err();
        assert!(matches!(err, EscrowError::Conflict { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_concurrent_resolutions_settle_once() {
        let f = fixture().await;
        let tx = shipped(&f, 100_000).await;
        f.arbitration
            .raise_dispute(dispute(&f, &tx, "damaged"))
            .await
            .unwrap();

        let resolve = |actor: Actor, resolution: DisputeResolution| ResolveDisputeRequest {
            transaction_id: tx.id,
            actor,
            resolution,
            note: None,
        };
        let (a, b) = tokio::join!(
            f.arbitration.resolve_dispute(resolve(
                Actor::new(Uuid::new_v4(), Role::Admin),
                DisputeResolution::RefundBuyer
            )),
            f.arbitration.resolve_dispute(resolve(
                Actor::new(Uuid::new_v4(), Role::Admin),
                DisputeResolution::ReleaseToSeller
            )),
        );

        let (winner, loser) = match (a, b) {
            (Ok(tx), Err(err)) | (Err(err), Ok(tx)) => (tx, err),
            other => panic!("expected exactly one resolution, got {:?}", other),
        };
        assert!(matches!(
            loser,
            EscrowError::Conflict { .. } | EscrowError::Unauthorized(_)
        ));
        let stored = f.manager.get_transaction(tx.id).await.unwrap();
        assert_eq!(stored.status, winner.status);
        assert_eq!(stored.arbiter_id, winner.arbiter_id);
    }

    #[tokio::test]
    async fn test_super_admin_resolution_not_audited() {
        let f = fixture().await;
        let tx = shipped(&f, 100_000).await;
        f.arbitration
            .raise_dispute(dispute(&f, &tx, "damaged"))
            .await
            .unwrap();

        let root = Actor::new(Uuid::new_v4(), Role::SuperAdmin);
        f.arbitration
            .resolve_dispute(ResolveDisputeRequest {
                transaction_id: tx.id,
                actor: root,
                resolution: DisputeResolution::RefundBuyer,
                note: None,
            })
            .await
            .unwrap();
        assert!(f.audit.entries().await.is_empty());
        let logs = f.manager.get_transaction_logs(tx.id).await.unwrap();
        assert_eq!(logs.last().unwrap().new_status, TransactionStatus::Refunded);
    }
}
