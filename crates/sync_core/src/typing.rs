use std::{collections::HashMap, time::Duration};

use shared::domain::{ConversationId, UserId};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypingState {
    Idle,
    Typing { user_id: UserId },
}

/// Identity of an armed expiry timer. Expiring with an outdated generation is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingTimer {
    pub conversation_id: ConversationId,
    pub generation: u64,
    pub deadline: Instant,
}

#[derive(Debug)]
struct TypingEntry {
    user_id: UserId,
    deadline: Instant,
    generation: u64,
}

/// Per-conversation typing indicator with a fixed, re-armable expiry.
#[derive(Debug)]
pub struct TypingTracker {
    timeout: Duration,
    entries: HashMap<ConversationId, TypingEntry>,
    next_generation: u64,
    stale: bool,
}

impl TypingTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            entries: HashMap::new(),
            next_generation: 0,
            stale: false,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Arms (or re-arms) the indicator; the caller schedules the returned timer.
    pub fn typing(
        &mut self,
        conversation_id: ConversationId,
        user_id: UserId,
        now: Instant,
    ) -> TypingTimer {
        self.next_generation += 1;
        let deadline = now + self.timeout;
        self.entries.insert(
            conversation_id.clone(),
            TypingEntry {
                user_id,
                deadline,
                generation: self.next_generation,
            },
        );
        self.stale = false;
        TypingTimer {
            conversation_id,
            generation: self.next_generation,
            deadline,
        }
    }

    /// Clears the indicator if `user_id` is the one typing.
    pub fn stop_typing(&mut self, conversation_id: &ConversationId, user_id: &UserId) -> bool {
        match self.entries.get(conversation_id) {
            Some(entry) if &entry.user_id == user_id => {
                self.entries.remove(conversation_id);
                true
            }
            _ => false,
        }
    }

    pub fn expire(&mut self, conversation_id: &ConversationId, generation: u64) -> bool {
        match self.entries.get(conversation_id) {
            Some(entry) if entry.generation == generation => {
                self.entries.remove(conversation_id);
                true
            }
            _ => false,
        }
    }

    pub fn state(&self, conversation_id: &ConversationId, now: Instant) -> TypingState {
        match self.entries.get(conversation_id) {
            Some(entry) if now < entry.deadline => TypingState::Typing {
                user_id: entry.user_id.clone(),
            },
            _ => TypingState::Idle,
        }
    }

    pub fn typing_user(&self, conversation_id: &ConversationId, now: Instant) -> Option<UserId> {
        match self.state(conversation_id, now) {
            TypingState::Typing { user_id } => Some(user_id),
            TypingState::Idle => None,
        }
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn clear_stale(&mut self) {
        self.stale = false;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
