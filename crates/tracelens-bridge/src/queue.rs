//! Holding area for calls accepted before the module finished initializing.

use std::collections::VecDeque;

use crate::registry::CompletionSender;

/// A user call waiting for module readiness. The completion handle travels
/// with the request: until dispatch the call is a member of this queue only,
/// never of the registry.
pub(crate) struct QueuedCall {
    pub id: u32,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub completion: CompletionSender,
}

/// FIFO of pre-ready calls, drained exactly once on the `Starting -> Ready`
/// transition. Calls submitted during the drain observe the readiness flag
/// already flipped and dispatch directly, so they land after everything that
/// was queued.
#[derive(Default)]
pub(crate) struct PendingQueue {
    items: VecDeque<QueuedCall>,
}

impl PendingQueue {
    pub fn push(&mut self, call: QueuedCall) {
        self.items.push_back(call);
    }

    pub fn drain(&mut self) -> VecDeque<QueuedCall> {
        std::mem::take(&mut self.items)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}
