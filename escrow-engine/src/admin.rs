//! Privileged operations: balance adjustments and risk alerts

use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    audit::AuditTrail,
    error::EscrowError,
    ledger::{Ledger, LedgerOutcome},
    models::{Actor, AdminActionLog, AdminActionType, Amount, RiskAlert, RiskSeverity},
    time::TimeSource,
    EscrowResult,
};

/// Balance adjustment request; `request_id` makes retries idempotent
#[derive(Debug, Clone)]
pub struct AdjustBalanceRequest {
    pub request_id: Uuid,
    pub actor: Actor,
    pub user_id: Uuid,
    /// Signed amount in minor units
    pub amount: Amount,
    pub note: String,
}

/// Risk alert raise request
#[derive(Debug, Clone)]
pub struct RaiseRiskAlertRequest {
    pub user_id: Option<Uuid>,
    pub transaction_id: Option<Uuid>,
    pub severity: RiskSeverity,
    pub description: String,
}

pub struct AdminService {
    ledger: Arc<dyn Ledger>,
    audit: Arc<AuditTrail>,
    alerts: Arc<RwLock<HashMap<Uuid, RiskAlert>>>,
    time: Arc<dyn TimeSource>,
}

impl AdminService {
    pub fn new(ledger: Arc<dyn Ledger>, audit: Arc<AuditTrail>, time: Arc<dyn TimeSource>) -> Self {
        Self {
            ledger,
            audit,
            alerts: Arc::new(RwLock::new(HashMap::new())),
            time,
        }
    }

    /// Credit or debit a user's balance directly.
    ///
    /// A debit can never take the balance below zero. Replaying the same
    /// `request_id` is a no-op and is not audited again.
    pub async fn adjust_balance(&self, request: AdjustBalanceRequest) -> EscrowResult<LedgerOutcome> {
        ensure_privileged(&request.actor)?;
        if request.note.trim().is_empty() {
            return Err(EscrowError::validation("An adjustment note is required"));
        }
        if request.amount == Amount::MIN {
            return Err(EscrowError::validation(format!(
                "Adjustment {} is out of range",
                request.amount
            )));
        }

        let outcome = self
            .ledger
            .adjust_balance(request.request_id, request.user_id, request.amount, &request.note)
            .await?;

        if outcome == LedgerOutcome::Applied {
            self.audit
                .record(
                    &request.actor,
                    Some(request.user_id),
                    AdminActionType::AdjustBalance,
                    serde_json::json!({
                        "request_id": request.request_id,
                        "amount": request.amount,
                    }),
                    Some(request.note.clone()),
                )
                .await;
            info!(
                user_id = %request.user_id,
                amount = request.amount,
                actor = %request.actor.user_id,
                "Balance adjusted"
            );
        }

        Ok(outcome)
    }

    /// Raise a new risk alert
    pub async fn raise_risk_alert(&self, request: RaiseRiskAlertRequest) -> EscrowResult<RiskAlert> {
        if request.user_id.is_none() && request.transaction_id.is_none() {
            return Err(EscrowError::validation(
                "A risk alert must reference a user or a transaction",
            ));
        }
        if request.description.trim().is_empty() {
            return Err(EscrowError::validation("Risk alert description cannot be empty"));
        }

        let alert = RiskAlert {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            transaction_id: request.transaction_id,
            severity: request.severity,
            description: request.description.trim().to_string(),
            is_resolved: false,
            resolved_by: None,
            resolved_at: None,
            resolution_note: None,
            created_at: self.time.now(),
        };
        self.alerts.write().await.insert(alert.id, alert.clone());

        warn!(
            alert_id = %alert.id,
            severity = ?alert.severity,
            user_id = ?alert.user_id,
            transaction_id = ?alert.transaction_id,
            "Risk alert raised"
        );
        Ok(alert)
    }

    /// Resolve an alert; a second resolution is rejected
    pub async fn resolve_risk_alert(
        &self,
        actor: Actor,
        alert_id: Uuid,
        note: Option<String>,
    ) -> EscrowResult<RiskAlert> {
        ensure_privileged(&actor)?;

        let resolved = {
            let mut alerts = self.alerts.write().await;
            let alert = alerts
                .get_mut(&alert_id)
                .ok_or_else(|| EscrowError::not_found(format!("Risk alert {} not found", alert_id)))?;
            if alert.is_resolved {
                return Err(EscrowError::validation(format!(
                    "Risk alert {} is already resolved",
                    alert_id
                )));
            }
            alert.is_resolved = true;
            alert.resolved_by = Some(actor.user_id);
            alert.resolved_at = Some(self.time.now());
            alert.resolution_note = note.clone();
            alert.clone()
        };

        self.audit
            .record(
                &actor,
                resolved.user_id,
                AdminActionType::ResolveRiskAlert,
                serde_json::json!({ "alert_id": alert_id }),
                note,
            )
            .await;
        info!(%alert_id, actor = %actor.user_id, "Risk alert resolved");
        Ok(resolved)
    }

    /// Delete an alert outright
    pub async fn delete_risk_alert(&self, actor: Actor, alert_id: Uuid) -> EscrowResult<()> {
        ensure_privileged(&actor)?;

        let removed = self
            .alerts
            .write()
            .await
            .remove(&alert_id)
            .ok_or_else(|| EscrowError::not_found(format!("Risk alert {} not found", alert_id)))?;

        self.audit
            .record(
                &actor,
                removed.user_id,
                AdminActionType::DeleteRiskAlert,
                serde_json::json!({
                    "alert_id": alert_id,
                    "severity": removed.severity,
                    "was_resolved": removed.is_resolved,
                }),
                None,
            )
            .await;
        info!(%alert_id, actor = %actor.user_id, "Risk alert deleted");
        Ok(())
    }

    /// Alerts, unresolved first then most severe first
    pub async fn list_risk_alerts(&self, include_resolved: bool) -> Vec<RiskAlert> {
        let mut alerts: Vec<RiskAlert> = self
            .alerts
            .read()
            .await
            .values()
            .filter(|alert| include_resolved || !alert.is_resolved)
            .cloned()
            .collect();
        alerts.sort_by(|a, b| {
            a.is_resolved
                .cmp(&b.is_resolved)
                .then(b.severity.cmp(&a.severity))
                .then(b.created_at.cmp(&a.created_at))
        });
        alerts
    }

    pub async fn admin_log(&self) -> Vec<AdminActionLog> {
        self.audit.entries().await
    }
}

pub(crate) fn ensure_privileged(actor: &Actor) -> EscrowResult<()> {
    if !actor.role.is_privileged() {
        return Err(EscrowError::unauthorized("Administrator privileges required"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AuditConfig,
        ledger::{Account, InMemoryLedger},
        models::Role,
        time::{ManualTimeSource, TimeSource},
    };

    struct Fixture {
        service: AdminService,
        ledger: Arc<InMemoryLedger>,
        admin: Actor,
    }

    fn fixture() -> Fixture {
        let time: Arc<dyn TimeSource> = Arc::new(ManualTimeSource::default());
        let ledger = Arc::new(InMemoryLedger::new(time.clone()));
        let audit = Arc::new(AuditTrail::new(AuditConfig::default(), time.clone()));
        Fixture {
            service: AdminService::new(ledger.clone(), audit, time),
            ledger,
            admin: Actor::new(Uuid::new_v4(), Role::Admin),
        }
    }

    fn adjustment(actor: Actor, user_id: Uuid, amount: Amount) -> AdjustBalanceRequest {
        AdjustBalanceRequest {
            request_id: Uuid::new_v4(),
            actor,
            user_id,
            amount,
            note: "manual correction".to_string(),
        }
    }

    #[tokio::test]
    async fn test_adjust_balance_is_idempotent_and_audited_once() {
        let f = fixture();
        let user = Uuid::new_v4();
        let request = adjustment(f.admin, user, 25_000);

        assert_eq!(
            f.service.adjust_balance(request.clone()).await.unwrap(),
            LedgerOutcome::Applied
        );
        assert_eq!(
            f.service.adjust_balance(request).await.unwrap(),
            LedgerOutcome::AlreadyApplied
        );
        assert_eq!(f.ledger.balance(Account::User(user)).await.unwrap(), 25_000);
        assert_eq!(f.service.admin_log().await.len(), 1);
    }

    #[tokio::test]
    async fn test_adjust_balance_requires_privilege() {
        let f = fixture();
        let member = Actor::member(Uuid::new_v4());
        let err = f
            .service
            .adjust_balance(adjustment(member, member.user_id, 1_000))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_debit_cannot_overdraw() {
        let f = fixture();
        let user = Uuid::new_v4();
        f.service
            .adjust_balance(adjustment(f.admin, user, 5_000))
            .await
            .unwrap();
        let err = f
            .service
            .adjust_balance(adjustment(f.admin, user, -6_000))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InsufficientBalance { .. }));
        assert_eq!(f.ledger.balance(Account::User(user)).await.unwrap(), 5_000);
    }

    #[tokio::test]
    async fn test_out_of_range_adjustments_rejected() {
        let f = fixture();
        let user = Uuid::new_v4();
        let err = f
            .service
            .adjust_balance(adjustment(f.admin, user, Amount::MIN))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Validation(_)));

        f.service
            .adjust_balance(adjustment(f.admin, user, Amount::MAX))
            .await
            .unwrap();
        let err = f
            .service
            .adjust_balance(adjustment(f.admin, user, Amount::MAX))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Validation(_)));
        assert_eq!(f.ledger.balance(Account::User(user)).await.unwrap(), Amount::MAX);
        assert_eq!(f.service.admin_log().await.len(), 1);
        assert!(f.ledger.verify_integrity().await.is_consistent());
    }

    #[tokio::test]
    async fn test_risk_alert_resolves_once() {
        let f = fixture();
        let alert = f
            .service
            .raise_risk_alert(RaiseRiskAlertRequest {
                user_id: Some(Uuid::new_v4()),
                transaction_id: None,
                severity: RiskSeverity::High,
                description: "many failed deposits".to_string(),
            })
            .await
            .unwrap();

        let resolved = f
            .service
            .resolve_risk_alert(f.admin, alert.id, Some("verified by phone".to_string()))
            .await
            .unwrap();
        assert!(resolved.is_resolved);
        assert_eq!(resolved.resolved_by, Some(f.admin.user_id));

        let err = f
            .service
            .resolve_risk_alert(f.admin, alert.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Validation(_)));
        assert!(f.service.list_risk_alerts(false).await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_risk_alert() {
        let f = fixture();
        let alert = f
            .service
            .raise_risk_alert(RaiseRiskAlertRequest {
                user_id: None,
                transaction_id: Some(Uuid::new_v4()),
                severity: RiskSeverity::Low,
                description: "price far above category median".to_string(),
            })
            .await
            .unwrap();

        f.service.delete_risk_alert(f.admin, alert.id).await.unwrap();
        assert!(f.service.list_risk_alerts(true).await.is_empty());
        assert!(matches!(
            f.service.delete_risk_alert(f.admin, alert.id).await,
            Err(EscrowError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_alerts_sorted_by_severity() {
        let f = fixture();
        for severity in [RiskSeverity::Low, RiskSeverity::Critical, RiskSeverity::Medium] {
            f.service
                .raise_risk_alert(RaiseRiskAlertRequest {
                    user_id: Some(Uuid::new_v4()),
                    transaction_id: None,
                    severity,
                    description: "flag".to_string(),
                })
                .await
                .unwrap();
        }
        let severities: Vec<_> = f
            .service
            .list_risk_alerts(false)
            .await
            .iter()
            .map(|a| a.severity)
            .collect();
        assert_eq!(
            severities,
            vec![RiskSeverity::Critical, RiskSeverity::Medium, RiskSeverity::Low]
        );
    }
}
