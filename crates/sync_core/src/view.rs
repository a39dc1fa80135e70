//! Read-only projections handed to UI consumers.

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, CorrelationId, DeliveryState, MessageId, UserId},
    protocol::UserSummary,
};
use tokio::time::Instant;

use crate::{
    message_store::{Conversation, Message, MessageStore},
    presence::PresenceTracker,
    read_receipts::ReadReceiptTracker,
    typing::TypingTracker,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// No channel has been opened yet.
    Connecting,
    Live,
    /// The channel dropped; sends queue and presence/typing are stale.
    Degraded,
}

/// Fine-grained change notifications. The view is always current when one arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncUpdate {
    ConversationChanged(ConversationId),
    PresenceChanged,
    TypingChanged(ConversationId),
    UsersChanged,
    ModeChanged(SyncMode),
    SendFailed {
        correlation_id: CorrelationId,
        reason: String,
    },
    Resynced {
        conversations: usize,
        stale: bool,
    },
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub id: MessageId,
    pub correlation_id: Option<CorrelationId>,
    pub sender_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub delivery: DeliveryState,
    /// Own messages: the counterpart has read it. Incoming: this client has.
    pub seen: bool,
    pub from_me: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub participants: Vec<UserId>,
    pub counterpart: Option<UserId>,
    pub title: String,
    pub messages: Vec<MessageView>,
    pub typing: Option<UserId>,
    pub unread: usize,
    pub counterpart_online: bool,
}

impl ConversationSummary {
    pub fn last_message(&self) -> Option<&MessageView> {
        self.messages.last()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncView {
    pub mode: SyncMode,
    pub current_user: UserSummary,
    pub users: Vec<UserSummary>,
    pub online: Vec<UserId>,
    pub presence_stale: bool,
    pub typing_stale: bool,
    /// Most recently active first.
    pub conversations: Vec<ConversationSummary>,
}

impl SyncView {
    pub fn conversation(&self, conversation_id: &ConversationId) -> Option<&ConversationSummary> {
        self.conversations
            .iter()
            .find(|conversation| &conversation.id == conversation_id)
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.online.contains(user_id)
    }

    pub fn unread_total(&self) -> usize {
        self.conversations.iter().map(|c| c.unread).sum()
    }
}

pub(crate) struct ViewSources<'a> {
    pub mode: SyncMode,
    pub current_user: &'a UserSummary,
    pub store: &'a MessageStore,
    pub presence: &'a PresenceTracker,
    pub typing: &'a TypingTracker,
    pub receipts: &'a ReadReceiptTracker,
    pub now: Instant,
}

impl ViewSources<'_> {
    pub(crate) fn build(&self) -> SyncView {
        let mut users: Vec<UserSummary> = self
            .store
            .users()
            .filter(|user| user.user_id != self.current_user.user_id)
            .cloned()
            .collect();
        users.sort_by(|a, b| a.display_name.cmp(&b.display_name).then(a.user_id.cmp(&b.user_id)));

        SyncView {
            mode: self.mode,
            current_user: self.current_user.clone(),
            users,
            online: self.presence.online_users(),
            presence_stale: self.presence.is_stale(),
            typing_stale: self.typing.is_stale(),
            conversations: self
                .store
                .conversations_by_activity()
                .into_iter()
                .map(|conversation| self.summarize(conversation))
                .collect(),
        }
    }

    fn summarize(&self, conversation: &Conversation) -> ConversationSummary {
        let me = &self.current_user.user_id;
        let counterpart = conversation
            .participants()
            .iter()
            .find(|participant| *participant != me)
            .cloned();
        let title = counterpart
            .as_ref()
            .map(|user_id| {
                self.store
                    .user(user_id)
                    .map(|user| user.display_name.clone())
                    .unwrap_or_else(|| user_id.to_string())
            })
            .unwrap_or_else(|| conversation.id.to_string());

        let messages: Vec<MessageView> = conversation
            .messages()
            .iter()
            .map(|message| self.message_view(&conversation.id, message))
            .collect();
        let unread = messages
            .iter()
            .filter(|message| !message.from_me && !message.seen)
            .count();

        ConversationSummary {
            id: conversation.id.clone(),
            participants: conversation.participants().to_vec(),
            counterpart_online: counterpart
                .as_ref()
                .is_some_and(|user_id| self.presence.is_online(user_id)),
            counterpart,
            title,
            messages,
            typing: self.typing.typing_user(&conversation.id, self.now),
            unread,
        }
    }

    fn message_view(&self, conversation_id: &ConversationId, message: &Message) -> MessageView {
        let from_me = message.sender_id == self.current_user.user_id;
        let seen = message.seen || (!from_me && self.receipts.has_reported(conversation_id, &message.id));
        MessageView {
            id: message.id.clone(),
            correlation_id: message.correlation_id.clone(),
            sender_id: message.sender_id.clone(),
            text: message.text.clone(),
            created_at: message.created_at,
            delivery: message.delivery,
            seen,
            from_me,
        }
    }
}
