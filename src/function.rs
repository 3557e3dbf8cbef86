//! Foreign function invocation
//!
//! A `ForeignFunction` is a target address plus a shared prepared signature.
//! Invocation encodes host values into fresh per-call buffers, packs the
//! pointer array, and hands the call to the executor; the descriptor itself
//! is reused across every call.
//!
//! Asynchronous invocation moves the entire call record (return buffer,
//! argument pack, optional trampoline guard, completion) to the executor's
//! background context. Marshaling errors are still raised synchronously to
//! the caller; only the native call and result decoding travel to the
//! completion.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::buffer::{ArgPack, NativeBuffer};
use crate::callback::Callback;
use crate::cif::Cif;
use crate::codec::{self, Value};
use crate::error::FfiError;
use crate::executor::{AbiExecutor, AsyncCall, CallingConvention};

/// A callable native function with a prepared signature.
pub struct ForeignFunction {
    target: usize,
    cif: Arc<Cif>,
    executor: Arc<dyn AbiExecutor>,
    // Keeps a trampoline alive while this function can still call into it.
    callback: Option<Callback>,
}

impl ForeignFunction {
    /// Wrap `target` with a freshly prepared signature.
    pub fn new(
        executor: Arc<dyn AbiExecutor>,
        target: usize,
        return_type: &str,
        arg_types: &[&str],
        abi: Option<CallingConvention>,
    ) -> Result<Self, FfiError> {
        let cif = Arc::new(Cif::prepare(
            executor.as_ref(),
            return_type,
            arg_types,
            abi,
        )?);
        Ok(Self {
            target,
            cif,
            executor,
            callback: None,
        })
    }

    /// Wrap `target` with an already prepared signature.
    pub fn with_cif(executor: Arc<dyn AbiExecutor>, target: usize, cif: Arc<Cif>) -> Self {
        Self {
            target,
            cif,
            executor,
            callback: None,
        }
    }

    /// Make a callback's trampoline callable from the host side, reusing its
    /// prepared signature and pinning the trampoline for this function's
    /// lifetime.
    pub fn for_callback(cb: &Callback) -> Self {
        Self {
            target: cb.entry_point(),
            cif: Arc::clone(cb.cif()),
            executor: Arc::clone(cb.executor()),
            callback: Some(cb.clone()),
        }
    }

    /// Target address this function calls.
    #[inline]
    pub fn target(&self) -> usize {
        self.target
    }

    /// The shared signature descriptor.
    pub fn cif(&self) -> &Arc<Cif> {
        &self.cif
    }

    /// Encode `args` and perform the call synchronously.
    #[instrument(skip_all, fields(addr = self.target, arity = self.cif.arity()))]
    pub fn invoke(&self, args: &[Value]) -> Result<Value, FfiError> {
        let (mut ret, pack) = self.marshal(args)?;
        self.executor
            .call(self.cif.descriptor(), self.target, &mut ret, &pack)?;
        codec::decode(self.cif.return_type(), &ret, 0)
    }

    /// Encode `args` and perform the call on the executor's background
    /// context. `completion` fires exactly once with the decoded result.
    ///
    /// Marshaling errors (arity, encoding) are returned here, before
    /// anything is scheduled.
    pub fn invoke_async<F>(&self, args: &[Value], completion: F) -> Result<(), FfiError>
    where
        F: FnOnce(Result<Value, FfiError>) + Send + 'static,
    {
        let (ret, pack) = self.marshal(args)?;
        let return_type = self.cif.return_type();
        debug!(addr = self.target, "async call scheduled");

        self.executor.call_async(
            self.cif.descriptor(),
            self.target,
            AsyncCall {
                ret,
                args: pack,
                guard: self.callback.clone(),
                completion: Box::new(move |result| {
                    completion(result.and_then(|buf| codec::decode(return_type, &buf, 0)));
                }),
            },
        );
        Ok(())
    }

    /// Strict arity check, per-argument encoding, return buffer allocation.
    fn marshal(&self, args: &[Value]) -> Result<(NativeBuffer, ArgPack), FfiError> {
        if args.len() != self.cif.arity() {
            return Err(FfiError::ArityMismatch {
                expected: self.cif.arity(),
                got: args.len(),
            });
        }

        let buffers = self
            .cif
            .arg_types()
            .iter()
            .zip(args)
            .map(|(&ty, value)| codec::encode(ty, value))
            .collect::<Result<Vec<_>, FfiError>>()?;

        let mut ret = NativeBuffer::alloc(self.cif.return_type().size());
        ret.set_tag(self.cif.return_type());
        Ok((ret, ArgPack::new(buffers)))
    }
}

impl std::fmt::Debug for ForeignFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForeignFunction")
            .field("target", &format_args!("{:#x}", self.target))
            .field("arity", &self.cif.arity())
            .field("ret", &self.cif.return_type())
            .finish()
    }
}
