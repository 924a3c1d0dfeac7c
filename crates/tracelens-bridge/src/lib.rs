//! Asynchronous RPC bridge between a trace viewer UI and its WebAssembly
//! trace-processing module.
//!
//! The module runs off the main thread, exposes a synchronous C-style call
//! entry point, and reports completions out-of-band as `(id, success, offset,
//! length)` descriptors into its own linear memory. This crate provides:
//!
//! - [`EngineBridge`]: the orchestrator — accepts calls, queues them until the
//!   module's one-time Initialize handshake completes, and routes out-of-order
//!   replies back to their callers by id
//! - [`ModuleHandle`]: the narrow capability trait a host implements over the
//!   actual module (browser glue, native test harness)
//! - [`BlobSource`] / [`MemoryBlob`]: pull-style byte sources for the module's
//!   incremental trace-file reads
//! - [`extract`]: bounds-checked copies out of the module's linear memory
//!
//! Browser integration (Emscripten module objects, `Blob`/`FileReaderSync`)
//! lives in the `tracelens-wasm` glue crate.

mod blob;
mod bridge;
mod error;
mod lifecycle;
mod module;
mod queue;
mod registry;

pub mod heap;

pub use blob::{BlobSource, MemoryBlob};
pub use bridge::{
    BridgeOptions, BridgeTelemetrySnapshot, CallFuture, CallResponse, CallResult, EngineBridge,
    ReadyFuture, INIT_CALL_ID,
};
pub use error::BridgeError;
pub use heap::{extract, HeapRange, HeapRangeError};
pub use lifecycle::ModuleState;
pub use module::{routing_key, ModuleHandle};
