use thiserror::Error;

/// Transport-level failures surfaced through [`CallFuture`](crate::CallFuture)
/// and [`EngineBridge::initialize`](crate::EngineBridge::initialize).
///
/// A reply with `success = false` is *not* an error at this layer: the call
/// resolves with a failure-flagged [`CallResponse`](crate::CallResponse) so
/// the caller can inspect whatever error payload accompanied the reply.
///
/// `Clone` because a single module abort rejects every outstanding waiter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// The module reported a fatal runtime error. Terminal: all outstanding
    /// and future calls fail with this kind until the owning collaborator
    /// recreates the bridge+module pair.
    #[error("trace module aborted: {reason}")]
    ModuleAborted { reason: String },

    /// A reply descriptor pointed outside the module's linear memory.
    #[error(
        "reply for call {id} points outside linear memory \
         (offset {offset} len {len}, heap is {heap_len} bytes)"
    )]
    MalformedReply {
        id: u32,
        offset: u32,
        len: u32,
        heap_len: usize,
    },

    /// The bridge went away before the call completed.
    #[error("bridge dropped before the call completed")]
    Disconnected,
}
