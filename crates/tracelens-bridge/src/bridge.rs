//! The RPC bridge orchestrator.
//!
//! Reconciles three asynchronous domains: future-based application calls, the
//! module's non-reentrant C-style calling convention, and the streaming
//! file-read side channel. Replies arrive out-of-band as `(id, success,
//! offset, length)` descriptors and are routed back by id, never by position.
//!
//! Re-entrancy invariant: the internal `RefCell` borrow is always released
//! before invoking the module's synchronous `call` entry point, and the
//! registry entry for a call is inserted before that invocation. The module
//! may therefore complete a call synchronously (calling [`EngineBridge::on_reply`]
//! from inside `call`) without deadlocking or losing the reply.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures_channel::oneshot;
use tracing::{debug, error, warn};

use crate::blob::{BlobSource, StreamingAdapter};
use crate::error::BridgeError;
use crate::heap::HeapRange;
use crate::lifecycle::{ModuleLifecycle, ModuleState};
use crate::module::{routing_key, ModuleHandle};
use crate::queue::{PendingQueue, QueuedCall};
use crate::registry::CallRegistry;

/// Reserved id for the internal Initialize round-trip. User ids start above it
/// and the counter never reuses an id for the bridge's lifetime.
pub const INIT_CALL_ID: u32 = 0;

const INIT_ROUTING_KEY: &str = "Initialize";

/// A completed call as delivered to the caller.
///
/// `success = false` carries whatever error payload accompanied the reply; it
/// is a *result*, not a transport error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResponse {
    pub id: u32,
    pub success: bool,
    pub data: Vec<u8>,
}

pub type CallResult = Result<CallResponse, BridgeError>;

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Log a warning when the pre-ready queue grows past this depth. Purely
    /// diagnostic; the queue itself is unbounded.
    pub warn_queue_depth: usize,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            warn_queue_depth: 64,
        }
    }
}

#[derive(Default)]
struct BridgeTelemetry {
    calls_dispatched: AtomicU64,
    calls_queued: AtomicU64,
    replies_ok: AtomicU64,
    replies_failed: AtomicU64,
    protocol_violations: AtomicU64,
    blob_bytes_read: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BridgeTelemetrySnapshot {
    pub calls_dispatched: u64,
    pub calls_queued: u64,
    pub replies_ok: u64,
    pub replies_failed: u64,
    pub protocol_violations: u64,
    pub blob_bytes_read: u64,
}

impl BridgeTelemetry {
    fn snapshot(&self) -> BridgeTelemetrySnapshot {
        BridgeTelemetrySnapshot {
            calls_dispatched: self.calls_dispatched.load(Ordering::Relaxed),
            calls_queued: self.calls_queued.load(Ordering::Relaxed),
            replies_ok: self.replies_ok.load(Ordering::Relaxed),
            replies_failed: self.replies_failed.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            blob_bytes_read: self.blob_bytes_read.load(Ordering::Relaxed),
        }
    }
}

struct BridgeState {
    lifecycle: ModuleLifecycle,
    registry: CallRegistry,
    queue: PendingQueue,
    blob: StreamingAdapter,
    next_id: u32,
    ready_waiters: Vec<oneshot::Sender<Result<(), BridgeError>>>,
}

struct Inner {
    state: RefCell<BridgeState>,
    telemetry: BridgeTelemetry,
    options: BridgeOptions,
}

/// Cheap handle to one bridge instance; clones share state.
///
/// One bridge per module instance, both confined to a single execution
/// context. Module bootstrap is assumed to begin at construction; the
/// embedder forwards the module's startup-complete, abort, reply and
/// file-read callbacks to the methods below.
pub struct EngineBridge {
    inner: Rc<Inner>,
}

impl Clone for EngineBridge {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Default for EngineBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBridge {
    pub fn new() -> Self {
        Self::with_options(BridgeOptions::default())
    }

    pub fn with_options(options: BridgeOptions) -> Self {
        Self {
            inner: Rc::new(Inner {
                state: RefCell::new(BridgeState {
                    lifecycle: ModuleLifecycle::new(),
                    registry: CallRegistry::default(),
                    queue: PendingQueue::default(),
                    blob: StreamingAdapter::default(),
                    next_id: INIT_CALL_ID + 1,
                    ready_waiters: Vec::new(),
                }),
                telemetry: BridgeTelemetry::default(),
                options,
            }),
        }
    }

    /// Submits `(service, method, payload)` to the module.
    ///
    /// Allocates a fresh id, queues the call if the module is not ready yet,
    /// and otherwise dispatches it immediately. Never blocks; the returned
    /// future resolves exactly once with the eventual [`CallResult`].
    pub fn submit_call(&self, service: &str, method: &str, payload: Vec<u8>) -> CallFuture {
        let (tx, rx) = oneshot::channel();
        let key = routing_key(service, method);

        let dispatch = {
            let mut state = self.inner.state.borrow_mut();
            if let ModuleState::Failed { reason } = state.lifecycle.state() {
                let reason = reason.clone();
                drop(state);
                warn!(key = %key, "call submitted to a failed bridge");
                let _ = tx.send(Err(BridgeError::ModuleAborted { reason }));
                return CallFuture { rx };
            }

            let id = state.next_id;
            state.next_id += 1;

            match (state.lifecycle.is_ready(), state.lifecycle.module()) {
                (true, Some(module)) => {
                    state.registry.insert(id, tx);
                    Some((module, id))
                }
                _ => {
                    state.queue.push(QueuedCall {
                        id,
                        routing_key: key.clone(),
                        payload,
                        completion: tx,
                    });
                    let depth = state.queue.len();
                    drop(state);
                    self.inner.telemetry.calls_queued.fetch_add(1, Ordering::Relaxed);
                    if depth > self.inner.options.warn_queue_depth {
                        warn!(depth, "pre-ready call queue is unusually deep");
                    }
                    debug!(id, key = %key, "call queued until module readiness");
                    return CallFuture { rx };
                }
            }
        };

        if let Some((module, id)) = dispatch {
            // Borrow released above: the module may re-enter `on_reply`.
            self.dispatch(module.as_ref(), id, &key, &payload);
        }
        CallFuture { rx }
    }

    /// Resolves once the internal Initialize round-trip has completed and the
    /// pre-ready queue has drained. Resolves immediately when already ready;
    /// fails with [`BridgeError::ModuleAborted`] on a failed bridge.
    pub fn initialize(&self) -> ReadyFuture {
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.state.borrow_mut();
        match state.lifecycle.state().clone() {
            ModuleState::Ready => {
                drop(state);
                let _ = tx.send(Ok(()));
            }
            ModuleState::Failed { reason } => {
                drop(state);
                let _ = tx.send(Err(BridgeError::ModuleAborted { reason }));
            }
            ModuleState::Starting => state.ready_waiters.push(tx),
        }
        ReadyFuture { rx }
    }

    /// Startup-complete signal from the module runtime. Installs the module
    /// handle and dispatches the mandatory internal Initialize call before
    /// anything else; user calls stay queued until its reply arrives.
    pub fn on_runtime_initialized(&self, module: Rc<dyn ModuleHandle>) {
        let installed = {
            let mut state = self.inner.state.borrow_mut();
            state.lifecycle.module_loaded(module.clone())
        };
        if !installed {
            self.inner
                .telemetry
                .protocol_violations
                .fetch_add(1, Ordering::Relaxed);
            warn!("duplicate or late startup-complete signal ignored");
            return;
        }
        debug!("module runtime initialized; dispatching Initialize");
        self.dispatch(module.as_ref(), INIT_CALL_ID, INIT_ROUTING_KEY, &[]);
    }

    /// Out-of-band reply callback, invoked by the module (possibly from
    /// inside its own `call`). Routes by id; a reply for an unknown id is a
    /// logged protocol violation, not a crash.
    pub fn on_reply(&self, id: u32, success: bool, offset: u32, len: u32) {
        if id == INIT_CALL_ID {
            self.finish_initialize(success);
            return;
        }

        let (completion, module) = {
            let mut state = self.inner.state.borrow_mut();
            let Some(completion) = state.registry.remove(id) else {
                drop(state);
                self.inner
                    .telemetry
                    .protocol_violations
                    .fetch_add(1, Ordering::Relaxed);
                warn!(id, success, "reply for unknown call id dropped");
                return;
            };
            (completion, state.lifecycle.module())
        };

        let Some(module) = module else {
            // Registry entries are purged on `fail`, so a live entry without a
            // module handle means the embedder broke the callback contract.
            self.inner
                .telemetry
                .protocol_violations
                .fetch_add(1, Ordering::Relaxed);
            warn!(id, "reply arrived with no module handle installed");
            return;
        };

        let result = match module.read_memory(HeapRange { offset, len }) {
            Ok(data) => {
                if success {
                    self.inner.telemetry.replies_ok.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.inner
                        .telemetry
                        .replies_failed
                        .fetch_add(1, Ordering::Relaxed);
                }
                Ok(CallResponse { id, success, data })
            }
            Err(range_err) => {
                self.inner
                    .telemetry
                    .protocol_violations
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    id,
                    offset,
                    len,
                    heap_len = range_err.heap_len,
                    "reply descriptor points outside linear memory"
                );
                Err(BridgeError::MalformedReply {
                    id,
                    offset,
                    len,
                    heap_len: range_err.heap_len,
                })
            }
        };

        // The caller may have dropped its future; that is its prerogative.
        let _ = completion.send(result);
    }

    /// Fatal abort signal from the module runtime. Terminal: rejects every
    /// queued and in-flight call and fails all future submissions.
    pub fn on_module_abort(&self, reason: &str) {
        let (in_flight, queued, waiters) = {
            let mut state = self.inner.state.borrow_mut();
            if !state.lifecycle.fail(reason.to_string()) {
                return;
            }
            (
                state.registry.drain(),
                state.queue.drain(),
                std::mem::take(&mut state.ready_waiters),
            )
        };

        error!(
            reason,
            in_flight = in_flight.len(),
            queued = queued.len(),
            "module aborted; rejecting all outstanding calls"
        );

        let err = BridgeError::ModuleAborted {
            reason: reason.to_string(),
        };
        for (_, completion) in in_flight {
            let _ = completion.send(Err(err.clone()));
        }
        for call in queued {
            let _ = call.completion.send(Err(err.clone()));
        }
        for waiter in waiters {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    /// Installs the byte source for module file reads. Last-writer-wins for
    /// the next read request.
    pub fn set_blob(&self, blob: Rc<dyn BlobSource>) {
        debug!(len = blob.len(), "blob installed");
        self.inner.state.borrow_mut().blob.set_blob(blob);
    }

    pub fn clear_blob(&self) {
        self.inner.state.borrow_mut().blob.clear();
    }

    /// Pull-style file read callback from the module. Missing blob or
    /// out-of-range requests read as empty; the module handles short reads.
    pub fn on_read_request(&self, offset: u64, len: usize) -> Vec<u8> {
        let bytes = self.inner.state.borrow().blob.read(offset, len);
        self.inner
            .telemetry
            .blob_bytes_read
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        bytes
    }

    pub fn module_state(&self) -> ModuleState {
        self.inner.state.borrow().lifecycle.state().clone()
    }

    pub fn in_flight_calls(&self) -> usize {
        self.inner.state.borrow().registry.len()
    }

    pub fn telemetry_snapshot(&self) -> BridgeTelemetrySnapshot {
        self.inner.telemetry.snapshot()
    }

    /// Intercepts the reserved-id Initialize reply: flips readiness, drains
    /// the queue in submission order, then wakes `initialize()` waiters.
    fn finish_initialize(&self, success: bool) {
        if !success {
            // The engine cannot run without its Initialize handshake; treat a
            // failed one exactly like a module abort.
            self.on_module_abort("Initialize call failed");
            return;
        }

        let (queued, waiters, module) = {
            let mut state = self.inner.state.borrow_mut();
            if !state.lifecycle.mark_ready() {
                drop(state);
                self.inner
                    .telemetry
                    .protocol_violations
                    .fetch_add(1, Ordering::Relaxed);
                warn!("unexpected Initialize reply ignored");
                return;
            }
            let queued = state.queue.drain();
            let waiters = std::mem::take(&mut state.ready_waiters);
            (queued, waiters, state.lifecycle.module())
        };

        // `mark_ready` only succeeds with a loaded module.
        if let Some(module) = module {
            let drained = queued.len();
            self.drain_queue(module.as_ref(), queued);
            debug!(drained, "module ready; pending queue drained");
        }

        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
    }

    fn drain_queue(&self, module: &dyn ModuleHandle, queued: VecDeque<QueuedCall>) {
        for call in queued {
            {
                let mut state = self.inner.state.borrow_mut();
                state.registry.insert(call.id, call.completion);
            }
            self.dispatch(module, call.id, &call.routing_key, &call.payload);
        }
    }

    /// Invokes the module's synchronous call entry point. Must be called with
    /// no state borrow held and the registry entry already inserted.
    fn dispatch(&self, module: &dyn ModuleHandle, id: u32, key: &str, payload: &[u8]) {
        self.inner
            .telemetry
            .calls_dispatched
            .fetch_add(1, Ordering::Relaxed);
        debug!(id, key = %key, payload_len = payload.len(), "dispatching call");
        module.call(id, key, payload);
    }
}

/// Resolves exactly once with the call's [`CallResult`].
pub struct CallFuture {
    rx: oneshot::Receiver<CallResult>,
}

impl Future for CallFuture {
    type Output = CallResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(BridgeError::Disconnected)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Resolves once the module is ready (or the bridge has failed).
pub struct ReadyFuture {
    rx: oneshot::Receiver<Result<(), BridgeError>>,
}

impl Future for ReadyFuture {
    type Output = Result<(), BridgeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(BridgeError::Disconnected)),
            Poll::Pending => Poll::Pending,
        }
    }
}
