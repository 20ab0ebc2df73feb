//! Transaction chat
//!
//! Messages are published on the transaction channel; every other
//! participant gets an unread notification on their user channel.

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::EscrowError,
    models::{Actor, ChatMessage},
    realtime::{Channel, RealtimeEvent, RealtimeHub, UserNotification},
    time::TimeSource,
    transaction_manager::TransactionManager,
    EscrowResult,
};

const MAX_MESSAGE_LENGTH: usize = 2_000;

pub struct ChatService {
    messages: Arc<RwLock<Vec<ChatMessage>>>,
    manager: Arc<TransactionManager>,
    hub: Arc<RealtimeHub>,
    time: Arc<dyn TimeSource>,
}

impl ChatService {
    pub fn new(
        manager: Arc<TransactionManager>,
        hub: Arc<RealtimeHub>,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            messages: Arc::new(RwLock::new(Vec::new())),
            manager,
            hub,
            time,
        }
    }

    /// Post a message. Resending with the same `client_ref` returns the
    /// stored copy without publishing again.
    pub async fn post_message(
        &self,
        actor: Actor,
        transaction_id: Uuid,
        body: &str,
        client_ref: Option<Uuid>,
    ) -> EscrowResult<ChatMessage> {
        let body = body.trim();
        if body.is_empty() {
            return Err(EscrowError::validation("Message cannot be empty"));
        }
        if body.chars().count() > MAX_MESSAGE_LENGTH {
            return Err(EscrowError::validation(format!(
                "Message exceeds {} characters",
                MAX_MESSAGE_LENGTH
            )));
        }

        let transaction = self.manager.get_transaction(transaction_id).await?;
        if !transaction.is_participant(actor.user_id) && !actor.role.is_privileged() {
            return Err(EscrowError::unauthorized(
                "only participants can post in this transaction",
            ));
        }

        let message = {
            let mut messages = self.messages.write().await;
            if let Some(client_ref) = client_ref {
                if let Some(existing) = messages.iter().find(|m| {
                    m.transaction_id == transaction_id
                        && m.sender_id == actor.user_id
                        && m.client_ref == Some(client_ref)
                }) {
                    debug!(%transaction_id, %client_ref, "Duplicate chat send ignored");
                    return Ok(existing.clone());
                }
            }
            let message = ChatMessage {
                id: Uuid::new_v4(),
                transaction_id,
                sender_id: actor.user_id,
                body: body.to_string(),
                client_ref,
                created_at: self.time.now(),
            };
            messages.push(message.clone());
            message
        };

        self.hub
            .publish(
                Channel::Transaction(transaction_id),
                RealtimeEvent::ChatMessage(message.clone()),
            )
            .await;

        let recipients = [
            Some(transaction.buyer_id),
            Some(transaction.seller_id),
            transaction.moderator_id,
            transaction.arbiter_id,
        ];
        for user_id in recipients
            .into_iter()
            .flatten()
            .filter(|id| *id != actor.user_id)
        {
            self.hub
                .publish(
                    Channel::User(user_id),
                    RealtimeEvent::Notification(UserNotification::UnreadMessage {
                        transaction_id,
                        message_id: message.id,
                        sender_id: actor.user_id,
                    }),
                )
                .await;
        }

        info!(%transaction_id, message_id = %message.id, sender = %actor.user_id, "Chat message posted");
        Ok(message)
    }

    /// Messages of a transaction, oldest first
    pub async fn history(&self, actor: Actor, transaction_id: Uuid) -> EscrowResult<Vec<ChatMessage>> {
        let transaction = self.manager.get_transaction(transaction_id).await?;
        if !transaction.is_participant(actor.user_id) && !actor.role.is_privileged() {
            return Err(EscrowError::unauthorized(
                "only participants can read this transaction",
            ));
        }
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| m.transaction_id == transaction_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ledger::InMemoryLedger,
        live_view::UnreadNotifier,
        time::ManualTimeSource,
        transaction_manager::{CreateTransactionRequest, TransactionManagerConfig},
    };

    struct Fixture {
        chat: ChatService,
        hub: Arc<RealtimeHub>,
        transaction_id: Uuid,
        buyer: Actor,
        seller: Actor,
    }

    async fn fixture() -> Fixture {
        let time: Arc<dyn TimeSource> = Arc::new(ManualTimeSource::default());
        let hub = Arc::new(RealtimeHub::new(16));
        let manager = Arc::new(TransactionManager::new(
            TransactionManagerConfig::default(),
            Arc::new(InMemoryLedger::new(time.clone())),
            hub.clone(),
            time.clone(),
        ));
        let buyer = Actor::member(Uuid::new_v4());
        let seller = Actor::member(Uuid::new_v4());
        let tx = manager
            .create_transaction(CreateTransactionRequest {
                buyer,
                seller_id: seller.user_id,
                product_name: "Gift card".to_string(),
                amount: 25_000,
                category: "vouchers".to_string(),
                dispute_window_hours: None,
            })
            .await
            .unwrap();
        Fixture {
            chat: ChatService::new(manager, hub.clone(), time),
            hub,
            transaction_id: tx.id,
            buyer,
            seller,
        }
    }

    #[tokio::test]
    async fn test_message_notifies_counterparty() {
        let f = fixture().await;
        let mut seller_rx = f.hub.subscribe(Channel::User(f.seller.user_id)).await;
        let mut buyer_rx = f.hub.subscribe(Channel::User(f.buyer.user_id)).await;

        let message = f
            .chat
            .post_message(f.buyer, f.transaction_id, "code please", None)
            .await
            .unwrap();

        match seller_rx.recv().await.unwrap() {
            RealtimeEvent::Notification(UserNotification::UnreadMessage { message_id, .. }) => {
                assert_eq!(message_id, message.id)
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(buyer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resend_with_same_ref_is_idempotent() {
        let f = fixture().await;
        let client_ref = Uuid::new_v4();
        let first = f
            .chat
            .post_message(f.buyer, f.transaction_id, "hi", Some(client_ref))
            .await
            .unwrap();
        let second = f
            .chat
            .post_message(f.buyer, f.transaction_id, "hi", Some(client_ref))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(f.chat.history(f.seller, f.transaction_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replayed_notification_announced_once() {
        let f = fixture().await;
        let mut rx = f.hub.subscribe(Channel::User(f.seller.user_id)).await;
        f.chat
            .post_message(f.buyer, f.transaction_id, "ping", None)
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        let mut notifier = UnreadNotifier::new(f.seller.user_id);
        let mut announced = 0;
        for delivery in [event.clone(), event] {
            if let RealtimeEvent::Notification(UserNotification::UnreadMessage {
                message_id,
                sender_id,
                ..
            }) = delivery
            {
                if notifier.should_announce(message_id, sender_id) {
                    announced += 1;
                }
            }
        }
        assert_eq!(announced, 1);
    }

    #[tokio::test]
    async fn test_outsiders_rejected() {
        let f = fixture().await;
        let outsider = Actor::member(Uuid::new_v4());
        assert!(matches!(
            f.chat.post_message(outsider, f.transaction_id, "hey", None).await,
            Err(EscrowError::Unauthorized(_))
        ));
        assert!(f.chat.history(outsider, f.transaction_id).await.is_err());
    }
}
