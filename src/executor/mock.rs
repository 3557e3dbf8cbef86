//! Scriptable executor for unit tests
//!
//! Everything the trait exposes can be scripted: preparation can be forced
//! to fail with a chosen status, calls route through a programmable handler
//! over the raw argument words, libraries and symbols resolve through
//! scripted maps, and trampolines get fake entry addresses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{ArgPack, NativeBuffer};
use crate::error::FfiError;
use crate::types::NativeType;

use super::{
    read_arg_words, write_return_word, AbiExecutor, AsyncCall, CallingConvention, ClosureHandle,
    OpenMode, PreparedCif, TrampolineProxy,
};

type CallHandler = dyn Fn(usize, &[u64]) -> Result<u64, FfiError> + Send + Sync;

#[derive(Clone)]
struct MockCif {
    return_type: NativeType,
    arg_types: Vec<NativeType>,
}

pub(crate) struct MockExecutor {
    cifs: Mutex<HashMap<u64, MockCif>>,
    next_id: AtomicUsize,
    prepare_status: Mutex<Option<i32>>,
    handler: Mutex<Option<Arc<CallHandler>>>,
    pub call_count: Arc<AtomicUsize>,
    trampolines: Mutex<Vec<Option<TrampolineProxy>>>,
    libraries: Mutex<HashMap<String, usize>>,
    symbols: Mutex<HashMap<(usize, String), usize>>,
    pub opened: Mutex<Vec<String>>,
    pub closed: Mutex<Vec<usize>>,
    last_error: Mutex<String>,
}

impl MockExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cifs: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
            prepare_status: Mutex::new(None),
            handler: Mutex::new(None),
            call_count: Arc::new(AtomicUsize::new(0)),
            trampolines: Mutex::new(Vec::new()),
            libraries: Mutex::new(HashMap::new()),
            symbols: Mutex::new(HashMap::new()),
            opened: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            last_error: Mutex::new("mock error".into()),
        })
    }

    /// Force every subsequent preparation to fail with `status`.
    pub fn fail_prepare_with(&self, status: i32) {
        *self.prepare_status.lock() = Some(status);
    }

    /// Number of descriptors prepared so far.
    pub fn prepared_count(&self) -> usize {
        self.cifs.lock().len()
    }

    /// Script the call behavior over `(target, raw argument words)`.
    pub fn on_call<F>(&self, handler: F)
    where
        F: Fn(usize, &[u64]) -> Result<u64, FfiError> + Send + Sync + 'static,
    {
        *self.handler.lock() = Some(Arc::new(handler));
    }

    /// Script a library path to resolve to `handle`.
    pub fn script_library(&self, path: &str, handle: usize) {
        self.libraries.lock().insert(path.to_string(), handle);
    }

    /// Script a symbol on `handle` to resolve to `addr`.
    pub fn script_symbol(&self, handle: usize, symbol: &str, addr: usize) {
        self.symbols.lock().insert((handle, symbol.to_string()), addr);
    }

    /// Set the text `last_error` answers with.
    pub fn set_last_error(&self, msg: &str) {
        *self.last_error.lock() = msg.to_string();
    }
}

impl AbiExecutor for MockExecutor {
    fn prepare_cif(
        &self,
        return_type: NativeType,
        arg_types: &[NativeType],
        _abi: CallingConvention,
    ) -> Result<PreparedCif, i32> {
        if let Some(status) = *self.prepare_status.lock() {
            return Err(status);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as u64;
        self.cifs.lock().insert(
            id,
            MockCif {
                return_type,
                arg_types: arg_types.to_vec(),
            },
        );
        Ok(PreparedCif(id))
    }

    fn call(
        &self,
        cif: PreparedCif,
        target: usize,
        ret: &mut NativeBuffer,
        args: &ArgPack,
    ) -> Result<(), FfiError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let entry = self
            .cifs
            .lock()
            .get(&cif.0)
            .cloned()
            .ok_or_else(|| FfiError::CallFailed("unprepared CIF".into()))?;

        let words = read_arg_words(&entry.arg_types, args);
        let handler = self.handler.lock().clone();
        let word = match handler {
            Some(handler) => handler(target, &words)?,
            None => 0,
        };
        write_return_word(entry.return_type, word, ret);
        Ok(())
    }

    fn call_async(&self, cif: PreparedCif, target: usize, mut call: AsyncCall) {
        // Run the scripted call here, deliver the completion off-thread so
        // callers exercise the cross-thread path.
        let result = self.call(cif, target, &mut call.ret, &call.args);
        std::thread::spawn(move || call.complete(result));
    }

    fn make_trampoline(
        &self,
        _cif: PreparedCif,
        proxy: TrampolineProxy,
    ) -> Result<ClosureHandle, FfiError> {
        let mut slots = self.trampolines.lock();
        slots.push(Some(proxy));
        Ok(ClosureHandle((slots.len() - 1) as u64))
    }

    fn entry_point(&self, closure: ClosureHandle) -> usize {
        0x1000 + closure.0 as usize
    }

    fn release_trampoline(&self, closure: ClosureHandle) {
        self.trampolines.lock()[closure.0 as usize] = None;
    }

    fn open(&self, path: &str, _mode: OpenMode) -> usize {
        self.opened.lock().push(path.to_string());
        self.libraries.lock().get(path).copied().unwrap_or(0)
    }

    fn close(&self, handle: usize) -> i32 {
        self.closed.lock().push(handle);
        0
    }

    fn lookup(&self, handle: usize, symbol: &str) -> usize {
        self.symbols
            .lock()
            .get(&(handle, symbol.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn last_error(&self) -> String {
        self.last_error.lock().clone()
    }
}
