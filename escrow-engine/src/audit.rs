//! Audit trail of privileged mutations
//!
//! Actions taken by the highest privilege tier are not recorded unless
//! `AuditConfig::log_super_admin_actions` is set.

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::{
    config::AuditConfig,
    models::{Actor, AdminActionLog, AdminActionType},
    time::TimeSource,
};

pub struct AuditTrail {
    config: AuditConfig,
    entries: Arc<RwLock<Vec<AdminActionLog>>>,
    time: Arc<dyn TimeSource>,
}

impl AuditTrail {
    pub fn new(config: AuditConfig, time: Arc<dyn TimeSource>) -> Self {
        Self {
            config,
            entries: Arc::new(RwLock::new(Vec::new())),
            time,
        }
    }

    /// Append an entry; returns `None` when the actor is exempt
    pub async fn record(
        &self,
        actor: &Actor,
        target_user_id: Option<Uuid>,
        action: AdminActionType,
        details: serde_json::Value,
        note: Option<String>,
    ) -> Option<AdminActionLog> {
        if actor.role.is_highest_tier() && !self.config.log_super_admin_actions {
            debug!(actor = %actor.user_id, ?action, "Audit skipped for highest tier");
            return None;
        }

        let entry = AdminActionLog {
            id: Uuid::new_v4(),
            actor_id: actor.user_id,
            target_user_id,
            action,
            details,
            note,
            created_at: self.time.now(),
        };
        self.entries.write().await.push(entry.clone());
        Some(entry)
    }

    /// Entries, oldest first
    pub async fn entries(&self) -> Vec<AdminActionLog> {
        self.entries.read().await.clone()
    }

    pub async fn entries_for_user(&self, user_id: Uuid) -> Vec<AdminActionLog> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|entry| entry.target_user_id == Some(user_id))
            .cloned()
            .collect()
    }
}
