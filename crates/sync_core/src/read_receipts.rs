use std::collections::HashSet;

use shared::domain::{ConversationId, MessageId, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenReport {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
}

/// Remembers every message reported as seen during this session.
#[derive(Debug, Default)]
pub struct ReadReceiptTracker {
    reported: HashSet<(ConversationId, MessageId)>,
}

impl ReadReceiptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Yields a report the first time a counterpart's message is seen, never again.
    pub fn mark_seen_if_needed(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        sender_id: &UserId,
        current_user_id: &UserId,
    ) -> Option<SeenReport> {
        if sender_id == current_user_id {
            return None;
        }
        let inserted = self
            .reported
            .insert((conversation_id.clone(), message_id.clone()));
        inserted.then(|| SeenReport {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
        })
    }

    /// Records a message as read without yielding a report, for bulk mark-all-read.
    pub fn mark_reported(&mut self, conversation_id: &ConversationId, message_id: &MessageId) -> bool {
        self.reported
            .insert((conversation_id.clone(), message_id.clone()))
    }

    pub fn has_reported(&self, conversation_id: &ConversationId, message_id: &MessageId) -> bool {
        self.reported
            .contains(&(conversation_id.clone(), message_id.clone()))
    }

    pub fn reported_count(&self) -> usize {
        self.reported.len()
    }
}

#[cfg(test)]
#[path = "tests/read_receipts_tests.rs"]
mod tests;
