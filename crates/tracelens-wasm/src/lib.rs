#![forbid(unsafe_code)]

// The full implementation is only meaningful on wasm32.
#[cfg(target_arch = "wasm32")]
mod wasm {
    use std::rc::Rc;

    use js_sys::{Array, Function, Reflect, Uint8Array};
    use tracelens_bridge::{
        BlobSource, EngineBridge, HeapRange, HeapRangeError, ModuleHandle, ModuleState,
    };
    use wasm_bindgen::prelude::*;
    use wasm_bindgen::JsCast;
    use wasm_bindgen_futures::future_to_promise;
    use web_sys::{Blob, FileReaderSync};

    fn js_error(message: impl core::fmt::Display) -> JsValue {
        js_sys::Error::new(&message.to_string()).into()
    }

    /// `ModuleHandle` over an Emscripten-style module object living in the
    /// same worker.
    ///
    /// `ccall` is the module's synchronous call entry point; `HEAPU8` its
    /// current linear-memory view. `HEAPU8` is looked up on every extraction
    /// because Emscripten replaces the view whenever the module grows its
    /// memory.
    struct EmscriptenModule {
        object: JsValue,
    }

    impl EmscriptenModule {
        fn new(object: JsValue) -> Self {
            Self { object }
        }

        fn ccall(&self) -> Result<Function, JsValue> {
            Reflect::get(&self.object, &JsValue::from_str("ccall"))?.dyn_into::<Function>()
        }

        fn heap_u8(&self) -> Option<Uint8Array> {
            Reflect::get(&self.object, &JsValue::from_str("HEAPU8"))
                .ok()?
                .dyn_into::<Uint8Array>()
                .ok()
        }
    }

    impl ModuleHandle for EmscriptenModule {
        fn call(&self, id: u32, routing_key: &str, payload: &[u8]) {
            // ccall(name, returnType, argTypes, args); completion always comes
            // back through the reply callback, never the return value.
            let arg_types = Array::of3(
                &JsValue::from_str("number"),
                &JsValue::from_str("array"),
                &JsValue::from_str("number"),
            );
            let arg_values = Array::of3(
                &JsValue::from(id),
                &Uint8Array::from(payload).into(),
                &JsValue::from(payload.len() as u32),
            );
            let args = Array::of4(
                &JsValue::from_str(routing_key),
                &JsValue::from_str("void"),
                &arg_types.into(),
                &arg_values.into(),
            );
            let invoked = self
                .ccall()
                .and_then(|ccall| ccall.apply(&self.object, &args));
            if let Err(err) = invoked {
                web_sys::console::error_2(
                    &JsValue::from_str("trace module call entry point failed:"),
                    &err,
                );
            }
        }

        fn read_memory(&self, range: HeapRange) -> Result<Vec<u8>, HeapRangeError> {
            let oob = |heap_len: usize| HeapRangeError {
                offset: range.offset,
                len: range.len,
                heap_len,
            };
            let heap = self.heap_u8().ok_or_else(|| oob(0))?;
            let heap_len = heap.length();
            let end = u64::from(range.offset) + u64::from(range.len);
            if end > u64::from(heap_len) {
                return Err(oob(heap_len as usize));
            }
            Ok(heap.subarray(range.offset, end as u32).to_vec())
        }
    }

    /// `BlobSource` over a JS `Blob`, read synchronously via `FileReaderSync`.
    /// Worker contexts only; the main thread never touches this path.
    struct FileBlobSource {
        blob: Blob,
        reader: FileReaderSync,
    }

    impl FileBlobSource {
        fn new(blob: Blob) -> Result<Self, JsValue> {
            Ok(Self {
                reader: FileReaderSync::new()?,
                blob,
            })
        }
    }

    impl BlobSource for FileBlobSource {
        fn len(&self) -> u64 {
            self.blob.size() as u64
        }

        fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
            let size = self.blob.size();
            let start = offset as f64;
            if start >= size || buf.is_empty() {
                return 0;
            }
            let end = (start + buf.len() as f64).min(size);
            let Ok(slice) = self.blob.slice_with_f64_and_f64(start, end) else {
                return 0;
            };
            let Ok(contents) = self.reader.read_as_array_buffer(&slice) else {
                return 0;
            };
            let bytes = Uint8Array::new(&contents);
            let n = (bytes.length() as usize).min(buf.len());
            bytes.subarray(0, n as u32).copy_to(&mut buf[..n]);
            n
        }
    }

    /// Worker-facing surface of the bridge.
    ///
    /// The worker script instantiates the Emscripten module (including its
    /// `locateFile` hook), forwards the module's lifecycle/reply/file-read
    /// callbacks to the methods below, and proxies RPC requests arriving from
    /// the main thread.
    #[wasm_bindgen]
    pub struct EngineWorker {
        bridge: EngineBridge,
        module: Rc<EmscriptenModule>,
    }

    #[wasm_bindgen]
    impl EngineWorker {
        #[wasm_bindgen(constructor)]
        pub fn new(module: JsValue) -> EngineWorker {
            EngineWorker {
                bridge: EngineBridge::new(),
                module: Rc::new(EmscriptenModule::new(module)),
            }
        }

        /// Emscripten `onRuntimeInitialized`.
        pub fn on_runtime_initialized(&self) {
            self.bridge.on_runtime_initialized(self.module.clone());
        }

        /// Emscripten `onAbort`.
        pub fn on_abort(&self, reason: String) {
            self.bridge.on_module_abort(&reason);
        }

        /// Out-of-band reply callback registered with the module.
        pub fn on_reply(&self, id: u32, success: bool, offset: u32, len: u32) {
            self.bridge.on_reply(id, success, offset, len);
        }

        /// Installs the trace file the module reads incrementally.
        pub fn set_blob(&self, blob: Blob) -> Result<(), JsValue> {
            self.bridge.set_blob(Rc::new(FileBlobSource::new(blob)?));
            Ok(())
        }

        pub fn clear_blob(&self) {
            self.bridge.clear_blob();
        }

        /// Module pull-read callback: the requested slice of the current blob
        /// (empty when unset or out of range).
        pub fn read_blob(&self, offset: f64, len: u32) -> Uint8Array {
            let bytes = self.bridge.on_read_request(offset as u64, len as usize);
            Uint8Array::from(bytes.as_slice())
        }

        /// Submits an RPC; resolves with `{ id, success, data }`.
        pub fn rpc(&self, service: String, method: String, payload: Uint8Array) -> js_sys::Promise {
            let future = self
                .bridge
                .submit_call(&service, &method, payload.to_vec());
            future_to_promise(async move {
                let response = future.await.map_err(js_error)?;
                let out = js_sys::Object::new();
                Reflect::set(&out, &JsValue::from_str("id"), &JsValue::from(response.id))?;
                Reflect::set(
                    &out,
                    &JsValue::from_str("success"),
                    &JsValue::from_bool(response.success),
                )?;
                Reflect::set(
                    &out,
                    &JsValue::from_str("data"),
                    &Uint8Array::from(response.data.as_slice()).into(),
                )?;
                Ok(out.into())
            })
        }

        /// Resolves once the module has initialized and queued calls drained.
        pub fn initialize(&self) -> js_sys::Promise {
            let ready = self.bridge.initialize();
            future_to_promise(async move {
                ready.await.map_err(js_error)?;
                Ok(JsValue::UNDEFINED)
            })
        }

        /// Lifecycle state: `"starting"`, `"ready"` or `"failed"`.
        pub fn state(&self) -> String {
            match self.bridge.module_state() {
                ModuleState::Starting => "starting".to_string(),
                ModuleState::Ready => "ready".to_string(),
                ModuleState::Failed { .. } => "failed".to_string(),
            }
        }
    }
}
