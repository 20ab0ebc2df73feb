//! Client-side reconciliation of realtime deliveries
//!
//! A live view keeps a local cache consistent with the server no matter how
//! often or in which order events arrive: transaction deltas are merged
//! field by field, participant joins are announced at most once per session,
//! unread notifications are suppressed for repeated message ids, and chat
//! messages move from optimistic to confirmed in place.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use uuid::Uuid;

use crate::{
    models::{ChatMessage, Transaction, TransactionStatus},
    realtime::TransactionDelta,
};

/// User-visible announcement produced while merging a delta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewNotice {
    ModeratorJoined(Uuid),
    ArbiterJoined(Uuid),
    StatusChanged {
        from: TransactionStatus,
        to: TransactionStatus,
    },
    /// A delta was missed; refetch the transaction and call
    /// [`TransactionView::resync`]
    ResyncRequired { cached: u64, received: u64 },
}

/// Locally cached transaction with join-announcement dedup
#[derive(Debug, Clone)]
pub struct TransactionView {
    cached: Transaction,
    announced: HashSet<Uuid>,
}

impl TransactionView {
    /// Start a view from a fetched snapshot; participants already present
    /// are treated as announced.
    pub fn subscribe(snapshot: Transaction) -> Self {
        let announced = [snapshot.moderator_id, snapshot.arbiter_id]
            .into_iter()
            .flatten()
            .collect();
        Self {
            cached: snapshot,
            announced,
        }
    }

    pub fn transaction(&self) -> &Transaction {
        &self.cached
    }

    /// Merge a delta into the cache, returning what should be shown.
    ///
    /// Fields absent from the delta are kept. Deltas at or below the cached
    /// version are stale or replayed and leave the cache untouched. A delta
    /// more than one version ahead means an update was lost (for example to
    /// channel lag); the cache is left as is and `ResyncRequired` is returned.
    pub fn apply(&mut self, delta: &TransactionDelta) -> Vec<ViewNotice> {
        let mut notices = Vec::new();
        if delta.transaction_id != self.cached.id {
            return notices;
        }

        if let Some(moderator) = delta.moderator_id {
            if self.announced.insert(moderator) {
                notices.push(ViewNotice::ModeratorJoined(moderator));
            }
        }
        if let Some(arbiter) = delta.arbiter_id {
            if self.announced.insert(arbiter) {
                notices.push(ViewNotice::ArbiterJoined(arbiter));
            }
        }

        if delta.version <= self.cached.version {
            return notices;
        }
        if delta.version > self.cached.version + 1 {
            notices.push(ViewNotice::ResyncRequired {
                cached: self.cached.version,
                received: delta.version,
            });
            return notices;
        }

        let cached = &mut self.cached;
        cached.version = delta.version;
        if let Some(status) = delta.status {
            if status != cached.status {
                notices.push(ViewNotice::StatusChanged {
                    from: cached.status,
                    to: status,
                });
                cached.status = status;
            }
        }
        if delta.moderator_id.is_some() {
            cached.moderator_id = delta.moderator_id;
        }
        if delta.arbiter_id.is_some() {
            cached.arbiter_id = delta.arbiter_id;
        }
        if delta.dispute_reason.is_some() {
            cached.dispute_reason = delta.dispute_reason.clone();
        }
        if delta.shipped_at.is_some() {
            cached.shipped_at = delta.shipped_at;
        }
        if delta.completed_at.is_some() {
            cached.completed_at = delta.completed_at;
        }
        if let Some(updated_at) = delta.updated_at {
            cached.updated_at = updated_at;
        }

        notices
    }

    /// Replace the cache with a freshly fetched snapshot.
    ///
    /// Participants present in the snapshot but never announced are
    /// announced now; an older snapshot is ignored.
    pub fn resync(&mut self, snapshot: Transaction) -> Vec<ViewNotice> {
        let mut notices = Vec::new();
        if snapshot.id != self.cached.id || snapshot.version < self.cached.version {
            return notices;
        }

        if let Some(moderator) = snapshot.moderator_id {
            if self.announced.insert(moderator) {
                notices.push(ViewNotice::ModeratorJoined(moderator));
            }
        }
        if let Some(arbiter) = snapshot.arbiter_id {
            if self.announced.insert(arbiter) {
                notices.push(ViewNotice::ArbiterJoined(arbiter));
            }
        }
        if snapshot.status != self.cached.status {
            notices.push(ViewNotice::StatusChanged {
                from: self.cached.status,
                to: snapshot.status,
            });
        }
        self.cached = snapshot;
        notices
    }
}

/// Suppresses repeated unread-message announcements
#[derive(Debug, Clone)]
pub struct UnreadNotifier {
    user_id: Uuid,
    last_announced: Option<Uuid>,
}

impl UnreadNotifier {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            last_announced: None,
        }
    }

    /// Whether a delivery of `message` should be announced
    pub fn should_announce(&mut self, message_id: Uuid, sender_id: Uuid) -> bool {
        if sender_id == self.user_id || self.last_announced == Some(message_id) {
            return false;
        }
        self.last_announced = Some(message_id);
        true
    }
}

/// Delivery state of a chat entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Shown optimistically, server copy not seen yet
    Sending,
    /// Server copy merged
    Confirmed,
    /// Send failed; kept for retry
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    /// Server id once confirmed
    pub id: Option<Uuid>,
    pub client_ref: Option<Uuid>,
    pub sender_id: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub state: DeliveryState,
}

/// Effect of merging a message into the timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    /// Optimistic entry replaced in place by the server copy
    Replaced,
    /// Already present; nothing changed
    Discarded,
}

/// Ordered chat history of one transaction view
#[derive(Debug, Clone, Default)]
pub struct ChatTimeline {
    entries: Vec<ChatEntry>,
}

impl ChatTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    /// Show an outgoing message before the server confirms it
    pub fn insert_optimistic(
        &mut self,
        client_ref: Uuid,
        sender_id: Uuid,
        body: String,
        now: DateTime<Utc>,
    ) -> MergeOutcome {
        // The server copy may already have arrived.
        if self.position_by_ref(client_ref).is_some() {
            return MergeOutcome::Discarded;
        }
        self.entries.push(ChatEntry {
            id: None,
            client_ref: Some(client_ref),
            sender_id,
            body,
            created_at: now,
            state: DeliveryState::Sending,
        });
        MergeOutcome::Inserted
    }

    /// Merge the authoritative copy of a message
    pub fn apply_server_message(&mut self, message: &ChatMessage) -> MergeOutcome {
        if self.entries.iter().any(|entry| entry.id == Some(message.id)) {
            return MergeOutcome::Discarded;
        }

        let confirmed = ChatEntry {
            id: Some(message.id),
            client_ref: message.client_ref,
            sender_id: message.sender_id,
            body: message.body.clone(),
            created_at: message.created_at,
            state: DeliveryState::Confirmed,
        };

        match message.client_ref.and_then(|r| self.position_by_ref(r)) {
            Some(index) => {
                self.entries[index] = confirmed;
                MergeOutcome::Replaced
            }
            None => {
                self.entries.push(confirmed);
                MergeOutcome::Inserted
            }
        }
    }

    /// Flag an optimistic entry whose send failed
    pub fn mark_failed(&mut self, client_ref: Uuid) -> bool {
        match self.position_by_ref(client_ref) {
            Some(index) if self.entries[index].state == DeliveryState::Sending => {
                self.entries[index].state = DeliveryState::Failed;
                true
            }
            _ => false,
        }
    }

    fn position_by_ref(&self, client_ref: Uuid) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.client_ref == Some(client_ref))
    }
}
