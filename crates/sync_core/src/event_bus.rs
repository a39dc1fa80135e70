//! Typed dispatch of push events to a single subscriber per event kind.

use std::{collections::HashMap, fmt};

use shared::protocol::{EventKind, ServerEvent};

use crate::error::SyncError;

type Handler<C> = Box<dyn Fn(&mut C, ServerEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Delivered(EventKind),
    Unrouted(EventKind),
}

/// Handlers run synchronously against a caller-supplied context, in publish order.
pub struct EventBus<C> {
    handlers: HashMap<EventKind, Handler<C>>,
}

impl<C> EventBus<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F) -> Result<(), SyncError>
    where
        F: Fn(&mut C, ServerEvent) + Send + Sync + 'static,
    {
        if self.handlers.contains_key(&kind) {
            return Err(SyncError::DuplicateSubscription(kind));
        }
        self.handlers.insert(kind, Box::new(handler));
        Ok(())
    }

    pub fn publish(&self, context: &mut C, event: ServerEvent) -> Dispatch {
        let kind = event.kind();
        match self.handlers.get(&kind) {
            Some(handler) => {
                handler(context, event);
                Dispatch::Delivered(kind)
            }
            None => Dispatch::Unrouted(kind),
        }
    }
}

impl<C> Default for EventBus<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for EventBus<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&str> = self.handlers.keys().map(|kind| kind.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("EventBus").field("kinds", &kinds).finish()
    }
}

#[cfg(test)]
#[path = "tests/event_bus_tests.rs"]
mod tests;
