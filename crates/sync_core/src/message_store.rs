//! Conversation state machine: deduplicated, time-ordered message logs and
//! the optimistic send lifecycle.
//!
//! Ordering is by creation timestamp, ties broken by message identifier. A
//! server identifier appears at most once per conversation; repeating an
//! append is a no-op. Confirming an optimistic entry keeps the timestamp it
//! was echoed with.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, CorrelationId, DeliveryState, MessageId, UserId},
    protocol::{ConversationPayload, MessagePayload, UserSummary},
};
use tracing::debug;

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    /// Set for entries that started life as an optimistic send.
    pub correlation_id: Option<CorrelationId>,
    pub sender_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub delivery: DeliveryState,
    pub seen: bool,
}

impl Message {
    pub fn from_payload(payload: MessagePayload) -> Self {
        Self {
            id: payload.message_id,
            correlation_id: None,
            sender_id: payload.sender_id,
            text: payload.text,
            created_at: payload.sent_at,
            delivery: DeliveryState::Sent,
            seen: payload.seen,
        }
    }

    fn local(
        correlation_id: CorrelationId,
        sender_id: UserId,
        text: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: correlation_id.local_message_id(),
            correlation_id: Some(correlation_id),
            sender_id,
            text,
            created_at,
            delivery: DeliveryState::Pending,
            seen: false,
        }
    }

    /// Optimistic entries stay local until the backend confirms them.
    pub fn is_local(&self) -> bool {
        self.delivery != DeliveryState::Sent
    }
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: ConversationId,
    participants: Vec<UserId>,
    messages: Vec<Message>,
    server_ids: HashSet<MessageId>,
}

impl Conversation {
    fn new(id: ConversationId, participants: impl IntoIterator<Item = UserId>) -> Self {
        let mut unique = HashSet::new();
        let participants = participants
            .into_iter()
            .filter(|participant| unique.insert(participant.clone()))
            .collect();
        Self {
            id,
            participants,
            messages: Vec::new(),
            server_ids: HashSet::new(),
        }
    }

    pub fn participants(&self) -> &[UserId] {
        &self.participants
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.server_ids.contains(message_id)
    }

    pub fn position_of(&self, message_id: &MessageId) -> Option<usize> {
        self.messages
            .iter()
            .position(|message| &message.id == message_id)
    }

    fn position_of_local(&self, correlation_id: &CorrelationId) -> Option<usize> {
        self.messages.iter().position(|message| {
            message.is_local() && message.correlation_id.as_ref() == Some(correlation_id)
        })
    }

    fn latest_server_timestamp(&self) -> Option<DateTime<Utc>> {
        self.messages
            .iter()
            .rev()
            .find(|message| !message.is_local())
            .map(|message| message.created_at)
    }

    fn insert_ordered(&mut self, message: Message) -> usize {
        let index = self.messages.partition_point(|existing| {
            (existing.created_at, &existing.id) <= (message.created_at, &message.id)
        });
        if !message.is_local() {
            self.server_ids.insert(message.id.clone());
        }
        self.messages.insert(index, message);
        index
    }

    /// Swaps in the server identity. The entry keeps its timestamp and only
    /// moves among entries sharing it, to keep ties ordered by id.
    fn promote(&mut self, index: usize, server: &MessagePayload) -> usize {
        let mut entry = self.messages.remove(index);
        entry.id = server.message_id.clone();
        entry.delivery = DeliveryState::Sent;
        entry.seen |= server.seen;
        self.insert_ordered(entry)
    }
}

/// A send the backend has not confirmed yet (pending or failed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub correlation_id: CorrelationId,
    pub conversation_id: ConversationId,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Snapshot,
    Users,
    Conversation(ConversationId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted { index: usize },
    /// A self-authored push echo took over the matching optimistic entry.
    Adopted {
        correlation_id: CorrelationId,
        index: usize,
    },
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendResolution {
    Confirmed { index: usize },
    /// The confirmed message was already present; the optimistic entry was dropped.
    Absorbed,
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotOutcome {
    pub conversations: usize,
    pub pending_restored: usize,
    pub layered: usize,
    /// The snapshot predates confirmed local state, which was kept on top of it.
    pub stale: bool,
}

#[derive(Debug)]
pub struct MessageStore {
    current_user: UserId,
    users: HashMap<UserId, UserSummary>,
    conversations: HashMap<ConversationId, Conversation>,
    pending: HashMap<CorrelationId, PendingSend>,
    changes: Vec<StoreChange>,
}

impl MessageStore {
    pub fn new(current_user: UserId) -> Self {
        Self {
            current_user,
            users: HashMap::new(),
            conversations: HashMap::new(),
            pending: HashMap::new(),
            changes: Vec::new(),
        }
    }

    pub fn current_user(&self) -> &UserId {
        &self.current_user
    }

    pub fn set_users(&mut self, users: Vec<UserSummary>) {
        self.users = users
            .into_iter()
            .map(|user| (user.user_id.clone(), user))
            .collect();
        self.changes.push(StoreChange::Users);
    }

    pub fn user(&self, user_id: &UserId) -> Option<&UserSummary> {
        self.users.get(user_id)
    }

    pub fn users(&self) -> impl Iterator<Item = &UserSummary> {
        self.users.values()
    }

    pub fn load_snapshot(&mut self, conversations: Vec<ConversationPayload>) -> SnapshotOutcome {
        let mut next: HashMap<ConversationId, Conversation> = HashMap::new();
        for payload in conversations {
            let conversation = next
                .entry(payload.conversation_id.clone())
                .or_insert_with(|| {
                    Conversation::new(payload.conversation_id.clone(), payload.participants)
                });
            for message in payload.messages {
                if !conversation.contains(&message.message_id) {
                    conversation.insert_ordered(Message::from_payload(message));
                }
            }
        }

        let mut outcome = SnapshotOutcome {
            conversations: next.len(),
            ..SnapshotOutcome::default()
        };
        let previous = std::mem::take(&mut self.conversations);
        for (conversation_id, old) in previous {
            let Some(target) = next.get_mut(&conversation_id) else {
                let unresolved = self
                    .pending
                    .values()
                    .filter(|pending| pending.conversation_id == conversation_id)
                    .count();
                if unresolved > 0 {
                    debug!(
                        conversation_id = %conversation_id,
                        unresolved,
                        "sync: snapshot omitted conversation with unresolved sends; keeping it"
                    );
                    outcome.pending_restored += unresolved;
                    next.insert(conversation_id, old);
                }
                continue;
            };

            let snapshot_latest = target.latest_server_timestamp();
            for message in old.messages {
                if target.contains(&message.id) {
                    if message.seen {
                        if let Some(index) = target.position_of(&message.id) {
                            target.messages[index].seen = true;
                        }
                    }
                    continue;
                }
                let unresolved = message
                    .correlation_id
                    .as_ref()
                    .is_some_and(|correlation_id| self.pending.contains_key(correlation_id));
                if unresolved {
                    target.insert_ordered(message);
                    outcome.pending_restored += 1;
                } else if snapshot_latest.map_or(true, |latest| message.created_at > latest) {
                    target.insert_ordered(message);
                    outcome.layered += 1;
                    outcome.stale = true;
                }
            }
        }

        if outcome.stale {
            debug!(
                layered = outcome.layered,
                "sync: snapshot older than local state; layered local entries on top"
            );
        }
        outcome.conversations = next.len();
        self.conversations = next;
        self.changes.push(StoreChange::Snapshot);
        outcome
    }

    /// Merges a single conversation, e.g. one created by a start-conversation request.
    pub fn upsert_conversation(&mut self, payload: ConversationPayload) -> usize {
        let conversation_id = payload.conversation_id.clone();
        self.conversations
            .entry(conversation_id.clone())
            .or_insert_with(|| Conversation::new(conversation_id.clone(), payload.participants));
        self.changes
            .push(StoreChange::Conversation(conversation_id.clone()));

        payload
            .messages
            .into_iter()
            .map(|message| self.append(conversation_id.clone(), Message::from_payload(message)))
            .filter(|outcome| !matches!(outcome, MergeOutcome::Duplicate))
            .count()
    }

    pub fn append(&mut self, conversation_id: ConversationId, message: Message) -> MergeOutcome {
        let current_user = self.current_user.clone();
        let conversation = self
            .conversations
            .entry(conversation_id.clone())
            .or_insert_with(|| {
                Conversation::new(
                    conversation_id.clone(),
                    [message.sender_id.clone(), current_user.clone()],
                )
            });

        if !message.is_local() && conversation.contains(&message.id) {
            debug!(
                conversation_id = %conversation_id,
                message_id = %message.id,
                "sync: duplicate message absorbed"
            );
            return MergeOutcome::Duplicate;
        }

        // Pending and failed entries both adopt their push echo.
        if message.sender_id == current_user && !message.is_local() {
            let echo = conversation
                .messages
                .iter()
                .position(|existing| existing.is_local() && existing.text == message.text);
            if let Some(index) = echo {
                let correlation_id = conversation.messages[index].correlation_id.clone();
                if let Some(correlation_id) = correlation_id {
                    let payload = MessagePayload {
                        message_id: message.id,
                        conversation_id: conversation_id.clone(),
                        sender_id: message.sender_id,
                        text: message.text,
                        sent_at: message.created_at,
                        seen: message.seen,
                    };
                    let index = conversation.promote(index, &payload);
                    self.pending.remove(&correlation_id);
                    self.changes.push(StoreChange::Conversation(conversation_id));
                    return MergeOutcome::Adopted {
                        correlation_id,
                        index,
                    };
                }
            }
        }

        let index = conversation.insert_ordered(message);
        self.changes.push(StoreChange::Conversation(conversation_id));
        MergeOutcome::Inserted { index }
    }

    pub fn begin_send(
        &mut self,
        conversation_id: &ConversationId,
        text: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<CorrelationId, SyncError> {
        let correlation_id = CorrelationId::generate();
        self.begin_send_with_id(correlation_id.clone(), conversation_id, text, now)?;
        Ok(correlation_id)
    }

    /// Like [`Self::begin_send`] with a caller-chosen correlation id. Returns the echo's index.
    pub fn begin_send_with_id(
        &mut self,
        correlation_id: CorrelationId,
        conversation_id: &ConversationId,
        text: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<usize, SyncError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let conversation = self
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| SyncError::UnknownConversation(conversation_id.clone()))?;

        let index = conversation.insert_ordered(Message::local(
            correlation_id.clone(),
            self.current_user.clone(),
            text.clone(),
            now,
        ));
        self.pending.insert(
            correlation_id.clone(),
            PendingSend {
                correlation_id,
                conversation_id: conversation_id.clone(),
                text,
                created_at: now,
            },
        );
        self.changes
            .push(StoreChange::Conversation(conversation_id.clone()));
        Ok(index)
    }

    pub fn resolve_send(
        &mut self,
        correlation_id: &CorrelationId,
        server: MessagePayload,
    ) -> SendResolution {
        let Some(pending) = self.pending.remove(correlation_id) else {
            let already_present = self
                .conversations
                .get(&server.conversation_id)
                .is_some_and(|conversation| conversation.contains(&server.message_id));
            return if already_present {
                SendResolution::Absorbed
            } else {
                SendResolution::Unknown
            };
        };

        let Some(conversation) = self.conversations.get_mut(&pending.conversation_id) else {
            return SendResolution::Unknown;
        };
        let Some(index) = conversation.position_of_local(correlation_id) else {
            return SendResolution::Unknown;
        };

        self.changes
            .push(StoreChange::Conversation(pending.conversation_id.clone()));
        if conversation.contains(&server.message_id) {
            conversation.messages.remove(index);
            debug!(
                conversation_id = %pending.conversation_id,
                message_id = %server.message_id,
                "sync: confirmed send already delivered; dropping optimistic entry"
            );
            return SendResolution::Absorbed;
        }

        let index = conversation.promote(index, &server);
        SendResolution::Confirmed { index }
    }

    pub fn fail_send(&mut self, correlation_id: &CorrelationId) -> Result<(), SyncError> {
        let entry = self.local_entry_mut(correlation_id)?;
        entry.delivery = DeliveryState::Failed;
        let conversation_id = self.pending[correlation_id].conversation_id.clone();
        self.changes.push(StoreChange::Conversation(conversation_id));
        Ok(())
    }

    /// Replaces a failed entry with a fresh optimistic send of the same text.
    pub fn retry_send(
        &mut self,
        failed: &CorrelationId,
        retry: CorrelationId,
        now: DateTime<Utc>,
    ) -> Result<usize, SyncError> {
        if self.local_entry_mut(failed)?.delivery != DeliveryState::Failed {
            return Err(SyncError::NotRetryable(failed.clone()));
        }
        let Some(pending) = self.pending.remove(failed) else {
            return Err(SyncError::UnknownCorrelation(failed.clone()));
        };
        if let Some(conversation) = self.conversations.get_mut(&pending.conversation_id) {
            if let Some(index) = conversation.position_of_local(failed) {
                conversation.messages.remove(index);
            }
        }
        self.begin_send_with_id(retry, &pending.conversation_id, pending.text, now)
    }

    /// Records a counterpart's read receipt on a message this client authored.
    pub fn mark_seen(&mut self, conversation_id: &ConversationId, message_id: &MessageId) -> bool {
        let Some(conversation) = self.conversations.get_mut(conversation_id) else {
            return false;
        };
        let Some(index) = conversation.position_of(message_id) else {
            return false;
        };
        let message = &mut conversation.messages[index];
        if message.sender_id != self.current_user || message.seen {
            return false;
        }
        message.seen = true;
        self.changes
            .push(StoreChange::Conversation(conversation_id.clone()));
        true
    }

    pub fn conversations_needing_resync(&self, gap_start: DateTime<Utc>) -> Vec<ConversationId> {
        let mut ids: Vec<ConversationId> = self
            .conversations
            .values()
            .filter(|conversation| {
                let has_unresolved = self
                    .pending
                    .values()
                    .any(|pending| pending.conversation_id == conversation.id);
                has_unresolved
                    || conversation
                        .latest_server_timestamp()
                        .map_or(true, |latest| latest < gap_start)
            })
            .map(|conversation| conversation.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn conversation(&self, conversation_id: &ConversationId) -> Option<&Conversation> {
        self.conversations.get(conversation_id)
    }

    /// Most recently active first; empty conversations last, by id.
    pub fn conversations_by_activity(&self) -> Vec<&Conversation> {
        let mut conversations: Vec<&Conversation> = self.conversations.values().collect();
        conversations.sort_by(|a, b| {
            let a_last = a.last_message().map(|m| m.created_at);
            let b_last = b.last_message().map(|m| m.created_at);
            b_last.cmp(&a_last).then_with(|| a.id.cmp(&b.id))
        });
        conversations
    }

    /// The most recently active conversation that includes `user_id`.
    pub fn conversation_with(&self, user_id: &UserId) -> Option<&Conversation> {
        if user_id == &self.current_user {
            return None;
        }
        self.conversations_by_activity()
            .into_iter()
            .find(|conversation| conversation.participants.contains(user_id))
    }

    pub fn message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Option<&Message> {
        let conversation = self.conversations.get(conversation_id)?;
        conversation
            .position_of(message_id)
            .map(|index| &conversation.messages[index])
    }

    pub fn pending_send(&self, correlation_id: &CorrelationId) -> Option<&PendingSend> {
        self.pending.get(correlation_id)
    }

    pub fn take_changes(&mut self) -> Vec<StoreChange> {
        std::mem::take(&mut self.changes)
    }

    fn local_entry_mut(&mut self, correlation_id: &CorrelationId) -> Result<&mut Message, SyncError> {
        let unknown = || SyncError::UnknownCorrelation(correlation_id.clone());
        let pending = self.pending.get(correlation_id).ok_or_else(unknown)?;
        let conversation = self
            .conversations
            .get_mut(&pending.conversation_id)
            .ok_or_else(unknown)?;
        let index = conversation
            .position_of_local(correlation_id)
            .ok_or_else(unknown)?;
        Ok(&mut conversation.messages[index])
    }
}

#[cfg(test)]
#[path = "tests/message_store_tests.rs"]
mod tests;
