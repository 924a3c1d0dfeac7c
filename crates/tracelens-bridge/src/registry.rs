//! Routing table for in-flight calls.

use std::collections::HashMap;

use futures_channel::oneshot;

use crate::bridge::CallResult;

/// Resolves a caller's [`CallFuture`](crate::CallFuture) exactly once.
pub(crate) type CompletionSender = oneshot::Sender<CallResult>;

/// In-flight calls, keyed by id.
///
/// An entry is inserted immediately before the module's synchronous `call`
/// entry point is invoked (so a reply arriving from inside that call finds
/// it) and freed by exactly one of: the matching reply, or the Failed-state
/// mass rejection. Replies complete in any order; routing is by id, never by
/// position.
#[derive(Default)]
pub(crate) struct CallRegistry {
    entries: HashMap<u32, CompletionSender>,
}

impl CallRegistry {
    pub fn insert(&mut self, id: u32, completion: CompletionSender) {
        let prev = self.entries.insert(id, completion);
        debug_assert!(prev.is_none(), "call id {id} reused while in flight");
    }

    pub fn remove(&mut self, id: u32) -> Option<CompletionSender> {
        self.entries.remove(&id)
    }

    /// Empties the registry for the Failed-state mass rejection.
    pub fn drain(&mut self) -> Vec<(u32, CompletionSender)> {
        self.entries.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
