//! ABI executor seam
//!
//! The marshaling layers above never touch the platform directly: preparing
//! call descriptors, performing calls, generating trampoline entry points,
//! and loading libraries all go through the `AbiExecutor` capability trait.
//! `executor::system` is the in-process production implementation; tests use
//! a scriptable mock.

pub mod system;

#[cfg(test)]
pub(crate) mod mock;

use std::sync::Arc;

use crate::buffer::{ArgPack, NativeBuffer};
use crate::callback::Callback;
use crate::error::FfiError;
use crate::types::NativeType;

pub use system::{system, SystemExecutor};

/// Opaque handle to a prepared call descriptor. Prepared exactly once,
/// immutable afterwards, reusable across arbitrarily many calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PreparedCif(pub u64);

/// Opaque handle to a generated trampoline closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClosureHandle(pub u64);

/// Calling convention selector passed through to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CallingConvention {
    /// C calling convention (platform default)
    C,
    /// System V AMD64 ABI (Unix x86-64)
    SysV,
    /// Microsoft x64 calling convention (Windows)
    Win64,
    /// ARM64 calling convention
    Aarch64,
}

impl CallingConvention {
    /// The convention native code on this platform expects.
    #[inline]
    pub const fn host() -> Self {
        #[cfg(all(target_arch = "x86_64", target_os = "windows"))]
        return Self::Win64;

        #[cfg(all(target_arch = "x86_64", not(target_os = "windows")))]
        return Self::SysV;

        #[cfg(target_arch = "aarch64")]
        return Self::Aarch64;

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        return Self::C;
    }

    /// Maximum register-passed integer arguments for this convention.
    #[inline]
    pub const fn max_register_args(self) -> usize {
        match self {
            Self::C => 6,
            Self::SysV => 6,    // RDI, RSI, RDX, RCX, R8, R9
            Self::Win64 => 4,   // RCX, RDX, R8, R9
            Self::Aarch64 => 8, // X0-X7
        }
    }
}

impl Default for CallingConvention {
    #[inline]
    fn default() -> Self {
        Self::host()
    }
}

/// Library open mode. `Now` maps to the platform's resolve-all-symbols flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Lazy,
    Now,
}

/// Host-side proxy a trampoline dispatches into: raw argument words in,
/// raw return word out. Decoding, host invocation, and failure logging all
/// happen inside the proxy; the executor only routes the native call.
pub type TrampolineProxy = Arc<dyn Fn(&[u64]) -> u64 + Send + Sync>;

/// Record for one pending asynchronous call. Owns everything the call needs
/// to stay valid until completion: the return buffer, the encoded argument
/// pack, and a strong reference to the target trampoline if the call targets
/// one. The completion is `FnOnce`: it cannot run twice, and `complete`
/// consuming the record guarantees it runs exactly once.
pub struct AsyncCall {
    pub ret: NativeBuffer,
    pub args: ArgPack,
    pub guard: Option<Callback>,
    pub completion: Box<dyn FnOnce(Result<NativeBuffer, FfiError>) + Send>,
}

impl AsyncCall {
    /// Deliver the outcome: the return buffer on success, the error
    /// otherwise, never both. Argument buffers and the trampoline guard
    /// stay alive until the completion returns.
    pub fn complete(self, result: Result<(), FfiError>) {
        let Self {
            ret,
            args,
            guard,
            completion,
        } = self;
        match result {
            Ok(()) => completion(Ok(ret)),
            Err(err) => completion(Err(err)),
        }
        drop(args);
        drop(guard);
    }
}

/// Capability surface the marshaling core consumes.
pub trait AbiExecutor: Send + Sync {
    /// Build a reusable call descriptor; `Err` carries the nonzero status.
    fn prepare_cif(
        &self,
        return_type: NativeType,
        arg_types: &[NativeType],
        abi: CallingConvention,
    ) -> Result<PreparedCif, i32>;

    /// Execute a prepared call synchronously, writing into `ret`.
    fn call(
        &self,
        cif: PreparedCif,
        target: usize,
        ret: &mut NativeBuffer,
        args: &ArgPack,
    ) -> Result<(), FfiError>;

    /// Execute a prepared call on the executor's background context. The
    /// record's completion fires exactly once, on that context.
    fn call_async(&self, cif: PreparedCif, target: usize, call: AsyncCall);

    /// Generate a native entry point dispatching into `proxy`.
    fn make_trampoline(
        &self,
        cif: PreparedCif,
        proxy: TrampolineProxy,
    ) -> Result<ClosureHandle, FfiError>;

    /// Native code address for a generated trampoline.
    fn entry_point(&self, closure: ClosureHandle) -> usize;

    /// Release a trampoline slot once no native code can call it anymore.
    fn release_trampoline(&self, closure: ClosureHandle);

    /// Allocate a zeroed native buffer.
    fn allocate(&self, size: usize) -> NativeBuffer {
        NativeBuffer::alloc(size)
    }

    /// Whether a pointer-sized buffer holds null.
    fn is_null(&self, buf: &NativeBuffer) -> bool {
        buf.is_null_pointer()
    }

    /// Open a native module; returns a nullable raw handle. Null-handle
    /// policy (raise `Link` with `last_error`) belongs to the library layer.
    fn open(&self, path: &str, mode: OpenMode) -> usize;

    /// Close a handle, returning the platform status code.
    fn close(&self, handle: usize) -> i32;

    /// Resolve a symbol to a nullable raw pointer.
    fn lookup(&self, handle: usize, symbol: &str) -> usize;

    /// Text of the most recent loader error.
    fn last_error(&self) -> String;
}

/// Read each argument's value out of its buffer, zero-extended to a word.
///
/// Used by executors that pass arguments in integer registers.
pub(crate) fn read_arg_words(arg_types: &[NativeType], args: &ArgPack) -> Vec<u64> {
    let mut words = Vec::with_capacity(arg_types.len());
    for (i, ty) in arg_types.iter().enumerate() {
        let size = ty.size().min(8);
        let ptr = args.pointer_at(i) as *const u8;
        // Safety: the pack owns each argument buffer and its pointer slots
        // were filled from those buffers' base addresses.
        let bytes = unsafe { std::slice::from_raw_parts(ptr, size) };
        let mut raw = [0u8; 8];
        raw[..size].copy_from_slice(bytes);
        words.push(u64::from_ne_bytes(raw));
    }
    words
}

/// Store a raw return word into the return buffer per the return type.
///
/// Floating returns carry their bit patterns in the word (`f64::to_bits`,
/// or `f32::to_bits` in the low half).
pub(crate) fn write_return_word(return_type: NativeType, word: u64, ret: &mut NativeBuffer) {
    match return_type {
        NativeType::Void => {}
        NativeType::Double => ret.write_f64(0, f64::from_bits(word)),
        NativeType::Float => ret.write_f32(0, f32::from_bits(word as u32)),
        other => ret.write_word(0, word, other.size().min(8)),
    }
}
