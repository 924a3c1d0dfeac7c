//! End-to-end bridge behavior against a scripted in-process module.

use std::cell::RefCell;
use std::rc::Rc;

use futures::FutureExt;
use pollster::block_on;
use tracelens_bridge::{
    extract, BridgeError, EngineBridge, HeapRange, HeapRangeError, MemoryBlob, ModuleHandle,
    ModuleState, INIT_CALL_ID,
};

/// Records dispatched calls and serves `read_memory` from a settable heap.
/// With `sync_reply` armed it completes every user call synchronously from
/// inside `call`, exercising the bridge's re-entrancy path.
#[derive(Default)]
struct MockModule {
    calls: RefCell<Vec<(u32, String, Vec<u8>)>>,
    heap: RefCell<Vec<u8>>,
    sync_reply: RefCell<Option<EngineBridge>>,
}

impl MockModule {
    fn dispatched(&self) -> Vec<(u32, String)> {
        self.calls
            .borrow()
            .iter()
            .map(|(id, key, _)| (*id, key.clone()))
            .collect()
    }

    fn set_heap(&self, bytes: Vec<u8>) {
        *self.heap.borrow_mut() = bytes;
    }
}

impl ModuleHandle for MockModule {
    fn call(&self, id: u32, routing_key: &str, payload: &[u8]) {
        self.calls
            .borrow_mut()
            .push((id, routing_key.to_string(), payload.to_vec()));
        if id == INIT_CALL_ID {
            return;
        }
        let bridge = self.sync_reply.borrow().clone();
        if let Some(bridge) = bridge {
            bridge.on_reply(id, true, 0, 0);
        }
    }

    fn read_memory(&self, range: HeapRange) -> Result<Vec<u8>, HeapRangeError> {
        extract(&self.heap.borrow(), range)
    }
}

fn ready_bridge() -> (EngineBridge, Rc<MockModule>) {
    let bridge = EngineBridge::new();
    let module = Rc::new(MockModule::default());
    bridge.on_runtime_initialized(module.clone());
    bridge.on_reply(INIT_CALL_ID, true, 0, 0);
    assert_eq!(bridge.module_state(), ModuleState::Ready);
    (bridge, module)
}

#[test]
fn early_calls_drain_fifo_after_initialize() {
    let bridge = EngineBridge::new();
    let module = Rc::new(MockModule::default());

    let mut first = bridge.submit_call("service", "alpha", vec![1]);
    let mut second = bridge.submit_call("service", "beta", vec![2]);
    let mut ready = bridge.initialize();

    // Nothing reaches the module before the startup-complete signal.
    assert!(module.dispatched().is_empty());
    assert!((&mut ready).now_or_never().is_none());

    bridge.on_runtime_initialized(module.clone());
    // Initialize goes out alone; user calls wait for its reply.
    assert_eq!(module.dispatched(), vec![(INIT_CALL_ID, "Initialize".to_string())]);
    assert!((&mut first).now_or_never().is_none());

    bridge.on_reply(INIT_CALL_ID, true, 0, 0);
    assert_eq!(
        module.dispatched(),
        vec![
            (INIT_CALL_ID, "Initialize".to_string()),
            (1, "service_alpha".to_string()),
            (2, "service_beta".to_string()),
        ]
    );
    block_on(ready).unwrap();

    // Replies complete out of submission order; routing is by id.
    module.set_heap(vec![9, 8, 7]);
    bridge.on_reply(2, true, 1, 2);
    bridge.on_reply(1, true, 0, 1);
    let first = block_on(first).unwrap();
    let second = block_on(second).unwrap();
    assert_eq!((first.id, first.data.as_slice()), (1, &[9][..]));
    assert_eq!((second.id, second.data.as_slice()), (2, &[8, 7][..]));
}

#[test]
fn initialize_precedes_calls_submitted_after_readiness_signal() {
    let bridge = EngineBridge::new();
    let module = Rc::new(MockModule::default());

    bridge.on_runtime_initialized(module.clone());
    // Submitted between the startup signal and the Initialize reply: must
    // still queue behind Initialize.
    let fut = bridge.submit_call("svc", "m", Vec::new());
    assert_eq!(module.dispatched(), vec![(INIT_CALL_ID, "Initialize".to_string())]);

    bridge.on_reply(INIT_CALL_ID, true, 0, 0);
    assert_eq!(
        module.dispatched(),
        vec![
            (INIT_CALL_ID, "Initialize".to_string()),
            (1, "svc_m".to_string()),
        ]
    );

    bridge.on_reply(1, true, 0, 0);
    assert!(block_on(fut).unwrap().success);
}

#[test]
fn reply_extracts_descriptor_range_from_heap() {
    let (bridge, module) = ready_bridge();
    module.set_heap(vec![10, 20, 30, 40, 50, 60]);

    let fut = bridge.submit_call("service", "method", vec![0; 42]);
    bridge.on_reply(1, true, 0, 5);

    let response = block_on(fut).unwrap();
    assert!(response.success);
    assert_eq!(response.data, vec![10, 20, 30, 40, 50]);
}

#[test]
fn orphan_reply_is_dropped_without_panic() {
    let (bridge, module) = ready_bridge();
    module.set_heap(vec![1]);

    let mut fut = bridge.submit_call("svc", "m", Vec::new());
    bridge.on_reply(999, true, 0, 1);

    assert!((&mut fut).now_or_never().is_none());
    assert_eq!(bridge.telemetry_snapshot().protocol_violations, 1);
    assert_eq!(bridge.in_flight_calls(), 1);
}

#[test]
fn duplicate_reply_resolves_at_most_once() {
    let (bridge, _module) = ready_bridge();

    let fut = bridge.submit_call("svc", "m", Vec::new());
    bridge.on_reply(1, true, 0, 0);
    bridge.on_reply(1, true, 0, 0);

    assert!(block_on(fut).unwrap().success);
    assert_eq!(bridge.telemetry_snapshot().protocol_violations, 1);
}

#[test]
fn failed_reply_is_a_flagged_response_not_an_error() {
    let (bridge, module) = ready_bridge();
    module.set_heap(b"query parse error".to_vec());

    let fut = bridge.submit_call("svc", "m", Vec::new());
    bridge.on_reply(1, false, 0, 17);

    let response = block_on(fut).unwrap();
    assert!(!response.success);
    assert_eq!(response.data, b"query parse error".to_vec());
    assert_eq!(bridge.telemetry_snapshot().replies_failed, 1);
}

#[test]
fn out_of_bounds_descriptor_fails_that_call_only() {
    let (bridge, module) = ready_bridge();
    module.set_heap(vec![0; 4]);

    let bad = bridge.submit_call("svc", "bad", Vec::new());
    let good = bridge.submit_call("svc", "good", Vec::new());

    bridge.on_reply(1, true, 2, 10);
    bridge.on_reply(2, true, 0, 4);

    assert!(matches!(
        block_on(bad),
        Err(BridgeError::MalformedReply { id: 1, heap_len: 4, .. })
    ));
    assert!(block_on(good).unwrap().success);
}

#[test]
fn abort_rejects_outstanding_and_future_calls() {
    let (bridge, _module) = ready_bridge();

    let a = bridge.submit_call("svc", "a", Vec::new());
    let b = bridge.submit_call("svc", "b", Vec::new());
    bridge.on_module_abort("out of memory");

    let expected = BridgeError::ModuleAborted {
        reason: "out of memory".to_string(),
    };
    assert_eq!(block_on(a).unwrap_err(), expected);
    assert_eq!(block_on(b).unwrap_err(), expected);

    let late = bridge.submit_call("svc", "c", Vec::new());
    assert_eq!(block_on(late).unwrap_err(), expected);
    assert_eq!(block_on(bridge.initialize()).unwrap_err(), expected);
    assert!(matches!(bridge.module_state(), ModuleState::Failed { .. }));
}

#[test]
fn abort_before_startup_rejects_queued_calls_and_waiters() {
    let bridge = EngineBridge::new();

    let queued = bridge.submit_call("svc", "m", Vec::new());
    let ready = bridge.initialize();
    bridge.on_module_abort("wasm trap");

    assert!(matches!(
        block_on(queued),
        Err(BridgeError::ModuleAborted { .. })
    ));
    assert!(matches!(
        block_on(ready),
        Err(BridgeError::ModuleAborted { .. })
    ));
}

#[test]
fn failed_initialize_reply_is_fatal() {
    let bridge = EngineBridge::new();
    let module = Rc::new(MockModule::default());
    let queued = bridge.submit_call("svc", "m", Vec::new());

    bridge.on_runtime_initialized(module);
    bridge.on_reply(INIT_CALL_ID, false, 0, 0);

    assert!(matches!(bridge.module_state(), ModuleState::Failed { .. }));
    assert!(matches!(
        block_on(queued),
        Err(BridgeError::ModuleAborted { .. })
    ));
}

#[test]
fn synchronous_reply_from_inside_call_resolves() {
    let (bridge, module) = ready_bridge();
    *module.sync_reply.borrow_mut() = Some(bridge.clone());

    let fut = bridge.submit_call("svc", "m", Vec::new());
    // The module already replied from inside `call`; the future is resolved
    // without any further event.
    let response = fut.now_or_never().expect("resolved synchronously").unwrap();
    assert!(response.success);
    assert_eq!(bridge.in_flight_calls(), 0);
}

#[test]
fn duplicate_startup_signal_is_ignored() {
    let (bridge, module) = ready_bridge();
    let before = module.dispatched().len();

    bridge.on_runtime_initialized(module.clone());
    assert_eq!(module.dispatched().len(), before);
    assert_eq!(bridge.telemetry_snapshot().protocol_violations, 1);
    assert_eq!(bridge.module_state(), ModuleState::Ready);
}

#[test]
fn initialize_after_readiness_resolves_immediately() {
    let (bridge, _module) = ready_bridge();
    assert_eq!(bridge.initialize().now_or_never(), Some(Ok(())));
}

#[test]
fn dropped_future_does_not_disturb_other_calls() {
    let (bridge, _module) = ready_bridge();

    let dropped = bridge.submit_call("svc", "ignored", Vec::new());
    let kept = bridge.submit_call("svc", "kept", Vec::new());
    drop(dropped);

    bridge.on_reply(1, true, 0, 0);
    bridge.on_reply(2, true, 0, 0);
    assert_eq!(block_on(kept).unwrap().id, 2);
    assert_eq!(bridge.in_flight_calls(), 0);
}

#[test]
fn ids_are_monotonic_and_never_reused() {
    let (bridge, module) = ready_bridge();

    for _ in 0..3 {
        let fut = bridge.submit_call("svc", "m", Vec::new());
        let id = *module.calls.borrow().last().map(|(id, _, _)| id).unwrap();
        bridge.on_reply(id, true, 0, 0);
        assert_eq!(block_on(fut).unwrap().id, id);
    }
    let ids: Vec<u32> = module.dispatched().iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![INIT_CALL_ID, 1, 2, 3]);
}

#[test]
fn blob_reads_serve_the_module_pull_requests() {
    let (bridge, _module) = ready_bridge();

    // No blob installed yet: empty read, not an error.
    assert_eq!(bridge.on_read_request(0, 8), Vec::<u8>::new());

    bridge.set_blob(Rc::new(MemoryBlob::new(vec![5, 6, 7, 8])));
    assert_eq!(bridge.on_read_request(1, 2), vec![6, 7]);
    assert_eq!(bridge.on_read_request(2, 100), vec![7, 8]);
    assert_eq!(bridge.on_read_request(50, 4), Vec::<u8>::new());

    // Mid-stream replacement is last-writer-wins for the next read.
    bridge.set_blob(Rc::new(MemoryBlob::new(vec![9, 9])));
    assert_eq!(bridge.on_read_request(0, 2), vec![9, 9]);

    bridge.clear_blob();
    assert_eq!(bridge.on_read_request(0, 2), Vec::<u8>::new());
    assert_eq!(bridge.telemetry_snapshot().blob_bytes_read, 6);
}

#[test]
fn payload_bytes_reach_the_module_untouched() {
    let (bridge, module) = ready_bridge();

    let payload = vec![0xde, 0xad, 0xbe, 0xef];
    let _fut = bridge.submit_call("TraceProcessor", "RawQuery", payload.clone());

    let calls = module.calls.borrow();
    let (id, key, sent) = calls.last().unwrap();
    assert_eq!(*id, 1);
    assert_eq!(key, "TraceProcessor_RawQuery");
    assert_eq!(sent, &payload);
}
