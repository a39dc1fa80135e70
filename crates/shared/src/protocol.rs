use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ConversationId, MessageId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub text: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub seen: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationPayload {
    pub conversation_id: ConversationId,
    pub participants: Vec<UserId>,
    #[serde(default)]
    pub messages: Vec<MessagePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartConversationRequest {
    pub user_id: UserId,
    pub text: String,
}

/// Events pushed by the backend over the live channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    OnlineUsers {
        user_ids: Vec<UserId>,
    },
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    StopTyping {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    MessageSeen {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    ReceiveMessage {
        message: MessagePayload,
    },
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::OnlineUsers { .. } => EventKind::OnlineUsers,
            Self::Typing { .. } => EventKind::Typing,
            Self::StopTyping { .. } => EventKind::StopTyping,
            Self::MessageSeen { .. } => EventKind::MessageSeen,
            Self::ReceiveMessage { .. } => EventKind::ReceiveMessage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    OnlineUsers,
    Typing,
    StopTyping,
    MessageSeen,
    ReceiveMessage,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::OnlineUsers,
        EventKind::Typing,
        EventKind::StopTyping,
        EventKind::MessageSeen,
        EventKind::ReceiveMessage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OnlineUsers => "online_users",
            Self::Typing => "typing",
            Self::StopTyping => "stop_typing",
            Self::MessageSeen => "message_seen",
            Self::ReceiveMessage => "receive_message",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emissions sent by the client over the live channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    AnnouncePresence {
        user_id: UserId,
    },
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    StopTyping {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    MessageSeen {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    SendMessage {
        message: MessagePayload,
    },
}
