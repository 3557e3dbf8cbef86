//! In-process ABI executor
//!
//! Design: prepared call descriptors live in a concurrent table keyed by
//! token. Synchronous calls dispatch by arity over transmuted `extern "C"`
//! pointers (arguments travel in integer registers, up to six). Asynchronous
//! calls are shipped to a dedicated worker thread over a channel, so
//! completions run on the worker's context, not the caller's. Callback
//! trampolines are a fixed table of pre-compiled `extern "C"` shims, each
//! permanently bound to one dispatch slot.
//!
//! Known limits, by construction: floating-point *arguments* are not
//! register-classified (integer-class arguments only), and at most six
//! arguments are supported per call or trampoline. Integer, pointer, and
//! floating returns all work.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Sender};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::buffer::{ArgPack, NativeBuffer};
use crate::error::FfiError;
use crate::types::NativeType;

use super::{
    read_arg_words, write_return_word, AbiExecutor, AsyncCall, CallingConvention, ClosureHandle,
    OpenMode, PreparedCif, TrampolineProxy,
};

/// Most arguments a prepared descriptor may carry.
pub const MAX_ARGS: usize = 6;

const SLOT_COUNT: usize = 16;

#[derive(Clone)]
struct CifEntry {
    return_type: NativeType,
    arg_types: Vec<NativeType>,
}

struct Job {
    cif: PreparedCif,
    target: usize,
    call: AsyncCall,
}

/// The in-process executor. Obtain the shared instance via [`system`].
pub struct SystemExecutor {
    cifs: DashMap<u64, CifEntry>,
    next_cif: AtomicU64,
    jobs: Sender<Job>,
    error_override: Mutex<Option<String>>,
}

static GLOBAL: Lazy<Arc<SystemExecutor>> = Lazy::new(SystemExecutor::new);

/// Shared process-wide executor instance.
pub fn system() -> Arc<SystemExecutor> {
    Arc::clone(&GLOBAL)
}

impl SystemExecutor {
    /// Build an executor with its own async worker thread.
    pub fn new() -> Arc<Self> {
        let (tx, rx) = unbounded::<Job>();
        let executor = Arc::new(Self {
            cifs: DashMap::new(),
            next_cif: AtomicU64::new(1),
            jobs: tx,
            error_override: Mutex::new(None),
        });

        // The worker holds a weak reference so dropping the last user handle
        // disconnects the channel and ends the thread.
        let worker = Arc::downgrade(&executor);
        std::thread::Builder::new()
            .name("nativecall-worker".into())
            .spawn(move || {
                for job in rx {
                    let Job { cif, target, mut call } = job;
                    let result = match worker.upgrade() {
                        Some(exec) => exec.call(cif, target, &mut call.ret, &call.args),
                        None => Err(FfiError::CallFailed("executor shut down".into())),
                    };
                    // A panicking user completion must not take the worker
                    // down with it; later calls still need their completions.
                    if catch_unwind(AssertUnwindSafe(|| call.complete(result))).is_err() {
                        error!("async completion panicked");
                    }
                }
            })
            .expect("spawn async call worker");

        executor
    }

    fn entry(&self, cif: PreparedCif) -> Result<CifEntry, FfiError> {
        self.cifs
            .get(&cif.0)
            .map(|e| e.value().clone())
            .ok_or_else(|| FfiError::CallFailed(format!("no prepared CIF for token {}", cif.0)))
    }
}

impl AbiExecutor for SystemExecutor {
    fn prepare_cif(
        &self,
        return_type: NativeType,
        arg_types: &[NativeType],
        abi: CallingConvention,
    ) -> Result<PreparedCif, i32> {
        // The dispatcher only passes integer-register arguments, so the
        // admissible arity is the convention's register budget, capped by
        // what the dispatch table supports.
        if arg_types.len() > abi.max_register_args().min(MAX_ARGS) {
            return Err(1);
        }
        let token = self.next_cif.fetch_add(1, Ordering::Relaxed);
        self.cifs.insert(
            token,
            CifEntry {
                return_type,
                arg_types: arg_types.to_vec(),
            },
        );
        debug!(token, args = arg_types.len(), ret = %return_type, "cif prepared");
        Ok(PreparedCif(token))
    }

    fn call(
        &self,
        cif: PreparedCif,
        target: usize,
        ret: &mut NativeBuffer,
        args: &ArgPack,
    ) -> Result<(), FfiError> {
        let entry = self.entry(cif)?;
        if target == 0 {
            return Err(FfiError::CallFailed("null target pointer".into()));
        }
        if args.len() != entry.arg_types.len() {
            return Err(FfiError::ArityMismatch {
                expected: entry.arg_types.len(),
                got: args.len(),
            });
        }
        if entry.arg_types.iter().any(|t| t.is_float()) {
            return Err(FfiError::CallFailed(
                "floating point arguments are not supported by the system executor".into(),
            ));
        }

        let words = read_arg_words(&entry.arg_types, args);
        // Safety: target is a live function pointer resolved by the caller,
        // and the prepared descriptor bounds the arity at six register args.
        let raw = unsafe { call_words(target, &words, entry.return_type) };
        write_return_word(entry.return_type, raw, ret);
        Ok(())
    }

    fn call_async(&self, cif: PreparedCif, target: usize, call: AsyncCall) {
        if let Err(undelivered) = self.jobs.send(Job { cif, target, call }) {
            // The worker is gone; the completion still has to fire exactly
            // once, so it runs here with the failure.
            error!("async call worker is gone");
            let Job { call, .. } = undelivered.into_inner();
            call.complete(Err(FfiError::CallFailed(
                "async call worker is gone".into(),
            )));
        }
    }

    fn make_trampoline(
        &self,
        cif: PreparedCif,
        proxy: TrampolineProxy,
    ) -> Result<ClosureHandle, FfiError> {
        let entry = self.entry(cif)?;
        if entry.arg_types.len() > MAX_ARGS {
            return Err(FfiError::CallFailed(
                "trampolines support at most six arguments".into(),
            ));
        }

        let mut slots = SLOTS.write();
        let free = slots
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| FfiError::CallFailed("no free trampoline slots".into()))?;
        slots[free] = Some(SlotEntry {
            argc: entry.arg_types.len(),
            proxy,
        });
        debug!(slot = free, "trampoline bound");
        Ok(ClosureHandle(free as u64))
    }

    fn entry_point(&self, closure: ClosureHandle) -> usize {
        SHIMS[closure.0 as usize] as usize
    }

    fn release_trampoline(&self, closure: ClosureHandle) {
        SLOTS.write()[closure.0 as usize] = None;
        debug!(slot = closure.0, "trampoline released");
    }

    fn open(&self, path: &str, mode: OpenMode) -> usize {
        *self.error_override.lock() = None;
        platform::open(path, mode).unwrap_or_else(|msg| {
            *self.error_override.lock() = Some(msg);
            0
        })
    }

    fn close(&self, handle: usize) -> i32 {
        platform::close(handle)
    }

    fn lookup(&self, handle: usize, symbol: &str) -> usize {
        *self.error_override.lock() = None;
        platform::lookup(handle, symbol).unwrap_or_else(|msg| {
            *self.error_override.lock() = Some(msg);
            0
        })
    }

    fn last_error(&self) -> String {
        if let Some(msg) = self.error_override.lock().clone() {
            return msg;
        }
        platform::last_error()
    }
}

/// Dispatch a call by arity with the given return register class.
macro_rules! dispatch_as {
    ($ret:ty, $target:expr, $words:expr) => {{
        let w = $words;
        let t = $target;
        match w.len() {
            0 => std::mem::transmute::<usize, extern "C" fn() -> $ret>(t)(),
            1 => std::mem::transmute::<usize, extern "C" fn(u64) -> $ret>(t)(w[0]),
            2 => std::mem::transmute::<usize, extern "C" fn(u64, u64) -> $ret>(t)(w[0], w[1]),
            3 => std::mem::transmute::<usize, extern "C" fn(u64, u64, u64) -> $ret>(t)(
                w[0], w[1], w[2],
            ),
            4 => std::mem::transmute::<usize, extern "C" fn(u64, u64, u64, u64) -> $ret>(t)(
                w[0], w[1], w[2], w[3],
            ),
            5 => std::mem::transmute::<usize, extern "C" fn(u64, u64, u64, u64, u64) -> $ret>(t)(
                w[0], w[1], w[2], w[3], w[4],
            ),
            6 => std::mem::transmute::<usize, extern "C" fn(u64, u64, u64, u64, u64, u64) -> $ret>(
                t,
            )(w[0], w[1], w[2], w[3], w[4], w[5]),
            // Arity is bounded when the descriptor is prepared.
            _ => unreachable!("arity exceeds prepared maximum"),
        }
    }};
}

/// Perform the native call, returning the raw result word (bit pattern for
/// floating returns).
///
/// # Safety
/// `target` must be a valid function pointer whose actual signature takes at
/// most `words.len()` integer-class arguments.
unsafe fn call_words(target: usize, words: &[u64], return_type: NativeType) -> u64 {
    match return_type {
        NativeType::Double => dispatch_as!(f64, target, words).to_bits(),
        NativeType::Float => dispatch_as!(f32, target, words).to_bits() as u64,
        _ => dispatch_as!(u64, target, words),
    }
}

// ---------------------------------------------------------------------------
// Trampoline shims
//
// Native code needs a stable `extern "C"` address per callback. Each shim is
// permanently tied to one slot index; binding a trampoline stores the proxy
// in that slot. A shim reads six integer registers regardless of the bound
// arity and forwards only the declared count, which is sound on register
// conventions with at least six integer argument registers.

#[derive(Clone)]
struct SlotEntry {
    argc: usize,
    proxy: TrampolineProxy,
}

static SLOTS: Lazy<RwLock<[Option<SlotEntry>; SLOT_COUNT]>> =
    Lazy::new(|| RwLock::new(std::array::from_fn(|_| None)));

fn dispatch(slot: usize, raw: [u64; MAX_ARGS]) -> u64 {
    let entry = SLOTS.read()[slot].clone();
    match entry {
        Some(entry) => (entry.proxy)(&raw[..entry.argc]),
        None => {
            warn!(slot, "native call into released trampoline slot");
            0
        }
    }
}

type Shim = extern "C" fn(u64, u64, u64, u64, u64, u64) -> u64;

macro_rules! shims {
    ($($idx:expr => $name:ident),* $(,)?) => {
        $(
            extern "C" fn $name(a: u64, b: u64, c: u64, d: u64, e: u64, f: u64) -> u64 {
                dispatch($idx, [a, b, c, d, e, f])
            }
        )*
        static SHIMS: [Shim; SLOT_COUNT] = [$($name),*];
    };
}

shims! {
    0 => shim_0, 1 => shim_1, 2 => shim_2, 3 => shim_3,
    4 => shim_4, 5 => shim_5, 6 => shim_6, 7 => shim_7,
    8 => shim_8, 9 => shim_9, 10 => shim_10, 11 => shim_11,
    12 => shim_12, 13 => shim_13, 14 => shim_14, 15 => shim_15,
}

// ---------------------------------------------------------------------------
// Platform loader primitives

#[cfg(unix)]
mod platform {
    use std::ffi::{CStr, CString};

    use super::OpenMode;

    pub fn open(path: &str, mode: OpenMode) -> Result<usize, String> {
        let cpath =
            CString::new(path).map_err(|_| format!("invalid library path '{}'", path))?;
        let flag = match mode {
            OpenMode::Lazy => libc::RTLD_LAZY,
            OpenMode::Now => libc::RTLD_NOW,
        };
        // Safety: cpath is a valid NUL-terminated string.
        Ok(unsafe { libc::dlopen(cpath.as_ptr(), flag) } as usize)
    }

    pub fn close(handle: usize) -> i32 {
        if handle == 0 {
            return 0;
        }
        // Safety: handle came from dlopen and is closed at most once.
        unsafe { libc::dlclose(handle as *mut libc::c_void) }
    }

    pub fn lookup(handle: usize, symbol: &str) -> Result<usize, String> {
        let csym =
            CString::new(symbol).map_err(|_| format!("invalid symbol name '{}'", symbol))?;
        // Safety: handle is a live dlopen handle, csym is NUL-terminated.
        Ok(unsafe { libc::dlsym(handle as *mut libc::c_void, csym.as_ptr()) } as usize)
    }

    pub fn last_error() -> String {
        // Safety: dlerror returns a static, possibly-null C string.
        let err = unsafe { libc::dlerror() };
        if err.is_null() {
            "unknown error".into()
        } else {
            unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
        }
    }
}

#[cfg(windows)]
mod platform {
    use std::ffi::{CString, OsStr};
    use std::os::windows::ffi::OsStrExt;

    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::libloaderapi::{FreeLibrary, GetProcAddress, LoadLibraryW};

    use super::OpenMode;

    pub fn open(path: &str, _mode: OpenMode) -> Result<usize, String> {
        let wide: Vec<u16> = OsStr::new(path).encode_wide().chain(Some(0)).collect();
        // Safety: wide is NUL-terminated.
        Ok(unsafe { LoadLibraryW(wide.as_ptr()) } as usize)
    }

    pub fn close(handle: usize) -> i32 {
        if handle == 0 {
            return 0;
        }
        // Safety: handle came from LoadLibraryW and is closed at most once.
        let ok = unsafe { FreeLibrary(handle as *mut _) };
        if ok == 0 {
            -1
        } else {
            0
        }
    }

    pub fn lookup(handle: usize, symbol: &str) -> Result<usize, String> {
        let csym =
            CString::new(symbol).map_err(|_| format!("invalid symbol name '{}'", symbol))?;
        // Safety: handle is a live module handle, csym is NUL-terminated.
        Ok(unsafe { GetProcAddress(handle as *mut _, csym.as_ptr()) } as usize)
    }

    pub fn last_error() -> String {
        format!("error code: {}", unsafe { GetLastError() })
    }
}
