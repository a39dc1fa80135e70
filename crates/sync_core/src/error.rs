use std::time::Duration;

use shared::{
    domain::{ConversationId, CorrelationId},
    error::ErrorCode,
    protocol::EventKind,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("backend rejected request with status {status} ({code:?}): {message}")]
    Api {
        status: u16,
        code: ErrorCode,
        message: String,
    },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("event channel disconnected")]
    ChannelDisconnected,
    #[error("invalid payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("message text is empty")]
    EmptyMessage,
    #[error("unknown conversation {0}")]
    UnknownConversation(ConversationId),
    #[error("no unresolved send with correlation id {0}")]
    UnknownCorrelation(CorrelationId),
    #[error("send {0} has not failed and cannot be retried")]
    NotRetryable(CorrelationId),
    #[error("event kind {0} already has a subscriber")]
    DuplicateSubscription(EventKind),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("sync engine has stopped")]
    EngineStopped,
}

impl SyncError {
    /// Failures the caller may retry once connectivity is back.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout(_) | Self::ChannelDisconnected
        ) || matches!(
            self,
            Self::Api { status, .. } if *status >= 500 || *status == 429
        )
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(value: url::ParseError) -> Self {
        Self::Config(format!("invalid server url: {value}"))
    }
}
