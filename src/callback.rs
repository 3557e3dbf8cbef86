//! Host-function callbacks callable from native code
//!
//! A `Callback` binds a host closure to an executor-generated trampoline.
//! Native code calls the trampoline's entry point; the proxy decodes the raw
//! argument words through the signature's types, invokes the host closure,
//! and encodes the result back into a return word.
//!
//! A failing or panicking host closure must not unwind across the `extern
//! "C"` boundary. The proxy catches both, logs at error level, records the
//! failure text on the callback (retrievable with [`Callback::take_failure`]),
//! and answers the native caller with a zero word.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

use crate::buffer::NativeBuffer;
use crate::cif::Cif;
use crate::codec::{self, Value};
use crate::error::FfiError;
use crate::executor::{write_return_word, AbiExecutor, TrampolineProxy};
use crate::types::NativeType;

struct CallbackInner {
    cif: Arc<Cif>,
    executor: Arc<dyn AbiExecutor>,
    closure: crate::executor::ClosureHandle,
    entry: usize,
    last_failure: Arc<Mutex<Option<String>>>,
}

impl Drop for CallbackInner {
    fn drop(&mut self) {
        self.executor.release_trampoline(self.closure);
    }
}

/// A native-callable wrapper around a host closure. Cheap to clone; clones
/// share the trampoline slot, which is released when the last clone drops.
#[derive(Clone)]
pub struct Callback {
    inner: Arc<CallbackInner>,
}

impl Callback {
    /// Bind `host` behind a trampoline with the named signature.
    pub fn new<F>(
        executor: Arc<dyn AbiExecutor>,
        return_type: &str,
        arg_types: &[&str],
        host: F,
    ) -> Result<Self, FfiError>
    where
        F: Fn(&[Value]) -> Result<Value, FfiError> + Send + Sync + 'static,
    {
        let cif = Arc::new(Cif::prepare(executor.as_ref(), return_type, arg_types, None)?);
        let last_failure = Arc::new(Mutex::new(None));

        let proxy = make_proxy(Arc::clone(&cif), Arc::clone(&last_failure), host);
        let closure = executor.make_trampoline(cif.descriptor(), proxy)?;
        let entry = executor.entry_point(closure);

        Ok(Self {
            inner: Arc::new(CallbackInner {
                cif,
                executor,
                closure,
                entry,
                last_failure,
            }),
        })
    }

    /// Native code address to hand out as a function pointer.
    #[inline]
    pub fn entry_point(&self) -> usize {
        self.inner.entry
    }

    /// The prepared signature descriptor backing this callback.
    pub fn cif(&self) -> &Arc<Cif> {
        &self.inner.cif
    }

    /// The executor this callback's trampoline lives in.
    pub(crate) fn executor(&self) -> &Arc<dyn AbiExecutor> {
        &self.inner.executor
    }

    /// Take the most recent recorded host failure, clearing it.
    pub fn take_failure(&self) -> Option<String> {
        self.inner.last_failure.lock().take()
    }
}

impl From<&Callback> for Value {
    /// A callback passed as a pointer argument contributes its entry point.
    fn from(cb: &Callback) -> Self {
        Value::Pointer(cb.entry_point())
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback")
            .field("entry", &format_args!("{:#x}", self.inner.entry))
            .field("arity", &self.inner.cif.arity())
            .finish()
    }
}

fn make_proxy<F>(
    cif: Arc<Cif>,
    last_failure: Arc<Mutex<Option<String>>>,
    host: F,
) -> TrampolineProxy
where
    F: Fn(&[Value]) -> Result<Value, FfiError> + Send + Sync + 'static,
{
    Arc::new(move |raw| {
        match run_host(&cif, &host, raw) {
            Ok(word) => word,
            Err(msg) => {
                error!(failure = %msg, "host callback failed");
                *last_failure.lock() = Some(msg);
                0
            }
        }
    })
}

/// Decode raw words, invoke the host closure, encode the return word.
fn run_host<F>(cif: &Cif, host: &F, raw: &[u64]) -> Result<u64, String>
where
    F: Fn(&[Value]) -> Result<Value, FfiError>,
{
    let values = raw
        .iter()
        .zip(cif.arg_types())
        .map(|(&word, &ty)| decode_word(ty, word))
        .collect::<Result<Vec<_>, FfiError>>()
        .map_err(|e| e.to_string())?;

    let result = catch_unwind(AssertUnwindSafe(|| host(&values)))
        .map_err(|_| "host callback panicked".to_string())?
        .map_err(|e| e.to_string())?;

    encode_word(cif.return_type(), &result).map_err(|e| e.to_string())
}

/// Turn one raw argument word into a host value via the codec.
fn decode_word(ty: NativeType, word: u64) -> Result<Value, FfiError> {
    let mut buf = NativeBuffer::alloc(ty.size());
    write_return_word(ty, word, &mut buf);
    codec::decode(ty, &buf, 0)
}

/// Turn the host's return value into a raw return word via the codec.
fn encode_word(ty: NativeType, value: &Value) -> Result<u64, FfiError> {
    if ty == NativeType::Void {
        return Ok(0);
    }
    let buf = codec::encode(ty, value)?;
    Ok(match ty {
        NativeType::Double => buf.read_f64(0).to_bits(),
        NativeType::Float => buf.read_f32(0).to_bits() as u64,
        other => buf.read_word(0, other.size().min(8)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SystemExecutor;

    type Raw2 = extern "C" fn(u64, u64) -> u64;

    #[test]
    fn native_round_trip() {
        let exec: Arc<dyn AbiExecutor> = SystemExecutor::new();
        let cb = Callback::new(exec, "int", &["int", "int"], |args| {
            let a = args[0].as_integral().unwrap();
            let b = args[1].as_integral().unwrap();
            Ok(Value::Int(a + b))
        })
        .unwrap();

        let f: Raw2 = unsafe { std::mem::transmute(cb.entry_point()) };
        assert_eq!(f(19, 23), 42);
        assert_eq!(cb.take_failure(), None);
    }

    #[test]
    fn host_error_yields_zero_and_records_failure() {
        let exec: Arc<dyn AbiExecutor> = SystemExecutor::new();
        let cb = Callback::new(exec, "int", &["int", "int"], |_| {
            Err(FfiError::CallbackFailure("refused".into()))
        })
        .unwrap();

        let f: Raw2 = unsafe { std::mem::transmute(cb.entry_point()) };
        assert_eq!(f(1, 2), 0);
        let failure = cb.take_failure().unwrap();
        assert!(failure.contains("refused"));
        // Taking the failure clears it.
        assert_eq!(cb.take_failure(), None);
    }

    #[test]
    fn host_panic_does_not_unwind_into_native_code() {
        let exec: Arc<dyn AbiExecutor> = SystemExecutor::new();
        let cb = Callback::new(exec, "int", &["int"], |_| panic!("boom")).unwrap();

        let f: extern "C" fn(u64) -> u64 = unsafe { std::mem::transmute(cb.entry_point()) };
        assert_eq!(f(7), 0);
        assert!(cb.take_failure().unwrap().contains("panicked"));
    }

    #[test]
    fn negative_arguments_are_sign_extended() {
        let exec: Arc<dyn AbiExecutor> = SystemExecutor::new();
        let cb = Callback::new(exec, "int64", &["int64"], |args| {
            Ok(Value::Int(args[0].as_integral().unwrap().abs()))
        })
        .unwrap();

        let f: extern "C" fn(u64) -> u64 = unsafe { std::mem::transmute(cb.entry_point()) };
        assert_eq!(f((-5i64) as u64), 5);
    }

    #[test]
    fn value_conversion_uses_entry_point() {
        let exec: Arc<dyn AbiExecutor> = SystemExecutor::new();
        let cb = Callback::new(exec, "void", &[], |_| Ok(Value::Undefined)).unwrap();
        assert_eq!(Value::from(&cb), Value::Pointer(cb.entry_point()));
    }
}
