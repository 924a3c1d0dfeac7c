//! Narrow capability interface to the computational module.

use crate::heap::{HeapRange, HeapRangeError};

/// The module's entry points as seen by the bridge.
///
/// One bridge drives one module instance and the pair is confined to a single
/// execution context (one worker/thread), so implementations are not required
/// to be `Send` or `Sync`. The handle is owned by the bridge's lifecycle
/// controller; everything else borrows it through `Rc`.
pub trait ModuleHandle {
    /// Synchronous call entry point.
    ///
    /// This only *starts* the work. Completion is always reported later
    /// through the out-of-band reply callback, even when the module finishes
    /// before `call` returns.
    fn call(&self, id: u32, routing_key: &str, payload: &[u8]);

    /// Copies `range` out of the module's current linear memory view.
    ///
    /// Implementations must consult the live view on every invocation; memory
    /// growth replaces the backing buffer between replies. Slice-backed
    /// implementations can delegate to [`crate::heap::extract`].
    fn read_memory(&self, range: HeapRange) -> Result<Vec<u8>, HeapRangeError>;
}

/// Combined service/method identifier the module routes a call on.
pub fn routing_key(service: &str, method: &str) -> String {
    format!("{service}_{method}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_key_concatenates_service_and_method() {
        assert_eq!(routing_key("TraceProcessor", "RawQuery"), "TraceProcessor_RawQuery");
    }
}
