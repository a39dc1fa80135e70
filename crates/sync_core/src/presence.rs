use std::collections::HashSet;

use shared::domain::UserId;

/// Online users as last broadcast by the backend.
///
/// The backend always sends the full set, so updates replace rather than merge.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    online: HashSet<UserId>,
    stale: bool,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the visible set changed.
    pub fn set_online(&mut self, user_ids: impl IntoIterator<Item = UserId>) -> bool {
        let next: HashSet<UserId> = user_ids.into_iter().collect();
        let was_stale = std::mem::replace(&mut self.stale, false);
        if next == self.online {
            return was_stale;
        }
        self.online = next;
        true
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.online.contains(user_id)
    }

    /// Freezes the current set while the channel is down.
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.online.iter().cloned().collect();
        users.sort();
        users
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
