//! Realtime fan-out of transaction changes and chat events
//!
//! Every transaction has a logical channel and every user has a
//! notification channel. Channels are read-only for subscribers: the engine
//! publishes, clients only receive. Delivery is at-least-once from the
//! client's point of view (reconnects replay state), so the views in
//! [`crate::live_view`] deduplicate on their side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::models::{ChatMessage, Transaction, TransactionStatus};

/// Logical channel key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum Channel {
    Transaction(Uuid),
    User(Uuid),
}

/// Changed fields of a transaction row; absent fields are unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionDelta {
    pub transaction_id: Uuid,
    pub version: u64,
    pub status: Option<TransactionStatus>,
    pub moderator_id: Option<Uuid>,
    pub arbiter_id: Option<Uuid>,
    pub dispute_reason: Option<String>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TransactionDelta {
    /// Fields that differ between two snapshots of the same row
    pub fn between(before: &Transaction, after: &Transaction) -> Self {
        fn changed<T: PartialEq + Clone>(old: &T, new: &T) -> Option<T> {
            (old != new).then(|| new.clone())
        }

        Self {
            transaction_id: after.id,
            version: after.version,
            status: changed(&before.status, &after.status),
            moderator_id: changed(&before.moderator_id, &after.moderator_id).flatten(),
            arbiter_id: changed(&before.arbiter_id, &after.arbiter_id).flatten(),
            dispute_reason: changed(&before.dispute_reason, &after.dispute_reason).flatten(),
            shipped_at: changed(&before.shipped_at, &after.shipped_at).flatten(),
            completed_at: changed(&before.completed_at, &after.completed_at).flatten(),
            updated_at: changed(&before.updated_at, &after.updated_at),
        }
    }
}

/// Notification pushed to a user's channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum UserNotification {
    UnreadMessage {
        transaction_id: Uuid,
        message_id: Uuid,
        sender_id: Uuid,
    },
    TransactionUpdated {
        transaction_id: Uuid,
        status: TransactionStatus,
    },
}

/// Event delivered on a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event", content = "payload")]
pub enum RealtimeEvent {
    TransactionChanged(TransactionDelta),
    ChatMessage(ChatMessage),
    Notification(UserNotification),
}

/// In-process channel registry backed by `tokio::sync::broadcast`
pub struct RealtimeHub {
    channels: Arc<RwLock<HashMap<Channel, broadcast::Sender<RealtimeEvent>>>>,
    capacity: usize,
}

impl RealtimeHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to a channel, creating it on first use
    pub async fn subscribe(&self, channel: Channel) -> broadcast::Receiver<RealtimeEvent> {
        let mut channels = self.channels.write().await;
        let sender = channels
            .entry(channel)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        debug!(?channel, "New realtime subscription");
        sender.subscribe()
    }

    /// Publish to a channel; returns how many receivers got the event
    pub async fn publish(&self, channel: Channel, event: RealtimeEvent) -> usize {
        let channels = self.channels.read().await;
        match channels.get(&channel) {
            // A send error only means nobody is listening right now.
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        }
    }

    /// Fan a transaction change out to its channel and to each participant
    pub async fn publish_transaction_change(&self, before: &Transaction, after: &Transaction) {
        let delta = TransactionDelta::between(before, after);
        self.publish(
            Channel::Transaction(after.id),
            RealtimeEvent::TransactionChanged(delta),
        )
        .await;

        if before.status != after.status {
            let participants = [
                Some(after.buyer_id),
                Some(after.seller_id),
                after.moderator_id,
                after.arbiter_id,
            ];
            for user_id in participants.into_iter().flatten() {
                self.publish(
                    Channel::User(user_id),
                    RealtimeEvent::Notification(UserNotification::TransactionUpdated {
                        transaction_id: after.id,
                        status: after.status,
                    }),
                )
                .await;
            }
        }
    }

    /// Drop channels nobody listens to anymore
    pub async fn prune(&self) -> usize {
        let mut channels = self.channels.write().await;
        let before = channels.len();
        channels.retain(|_, sender| sender.receiver_count() > 0);
        before - channels.len()
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new(crate::config::RealtimeConfig::default().channel_capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn transaction() -> Transaction {
        Transaction::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "Keyboard".to_string(),
            20_000,
            Decimal::new(5, 0),
            "hardware".to_string(),
            24,
            Utc::now(),
        )
    }

    #[test]
    fn test_delta_carries_only_changed_fields() {
        let before = transaction();
        let mut after = before.clone();
        after.status = TransactionStatus::Deposited;
        after.version = 1;

        let delta = TransactionDelta::between(&before, &after);
        assert_eq!(delta.status, Some(TransactionStatus::Deposited));
        assert_eq!(delta.moderator_id, None);
        assert_eq!(delta.updated_at, None);
        assert_eq!(delta.version, 1);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let hub = RealtimeHub::new(16);
        let before = transaction();
        let mut after = before.clone();
        after.status = TransactionStatus::Cancelled;

        let mut tx_rx = hub.subscribe(Channel::Transaction(after.id)).await;
        let mut buyer_rx = hub.subscribe(Channel::User(after.buyer_id)).await;

        hub.publish_transaction_change(&before, &after).await;

        match tx_rx.recv().await.unwrap() {
            RealtimeEvent::TransactionChanged(delta) => {
                assert_eq!(delta.status, Some(TransactionStatus::Cancelled))
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            buyer_rx.recv().await.unwrap(),
            RealtimeEvent::Notification(UserNotification::TransactionUpdated { .. })
        ));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let hub = RealtimeHub::new(4);
        let delivered = hub
            .publish(
                Channel::User(Uuid::new_v4()),
                RealtimeEvent::TransactionChanged(TransactionDelta::default()),
            )
            .await;
        assert_eq!(delivered, 0);
        assert_eq!(hub.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_prune_drops_idle_channels() {
        let hub = RealtimeHub::new(4);
        let rx = hub.subscribe(Channel::User(Uuid::new_v4())).await;
        drop(rx);
        assert_eq!(hub.prune().await, 1);
    }
}
