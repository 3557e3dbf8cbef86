//! Call interface descriptors
//!
//! A `Cif` pairs resolved signature types with the executor-prepared
//! descriptor handle. Preparation happens exactly once; the result is
//! immutable and shared (`Arc`) by every call site that uses the signature.

use tracing::debug;

use crate::error::FfiError;
use crate::executor::{AbiExecutor, CallingConvention, PreparedCif};
use crate::types::NativeType;

/// Prepared call interface: return type, argument types, convention, and the
/// executor's opaque descriptor.
#[derive(Debug)]
pub struct Cif {
    return_type: NativeType,
    arg_types: Vec<NativeType>,
    abi: CallingConvention,
    descriptor: PreparedCif,
}

impl Cif {
    /// Resolve the named signature and prepare it through the executor.
    ///
    /// Type names are validated before anything touches the executor, so an
    /// unknown name surfaces as `UnknownType` rather than a preparation
    /// status. A nonzero executor status becomes `CifPreparation`.
    pub fn prepare(
        executor: &dyn AbiExecutor,
        return_type: &str,
        arg_types: &[&str],
        abi: Option<CallingConvention>,
    ) -> Result<Self, FfiError> {
        let ret = NativeType::resolve(return_type)?;
        let args = arg_types
            .iter()
            .map(|name| NativeType::resolve(name))
            .collect::<Result<Vec<_>, FfiError>>()?;

        let abi = abi.unwrap_or_default();
        let descriptor = executor
            .prepare_cif(ret, &args, abi)
            .map_err(FfiError::CifPreparation)?;
        debug!(ret = %ret, arity = args.len(), ?abi, "cif prepared");

        Ok(Self {
            return_type: ret,
            arg_types: args,
            abi,
            descriptor,
        })
    }

    /// Declared return type.
    #[inline]
    pub fn return_type(&self) -> NativeType {
        self.return_type
    }

    /// Declared argument types, in call order.
    #[inline]
    pub fn arg_types(&self) -> &[NativeType] {
        &self.arg_types
    }

    /// Number of declared arguments.
    #[inline]
    pub fn arity(&self) -> usize {
        self.arg_types.len()
    }

    /// Calling convention the descriptor was prepared for.
    #[inline]
    pub fn abi(&self) -> CallingConvention {
        self.abi
    }

    /// The executor's opaque descriptor handle.
    #[inline]
    pub fn descriptor(&self) -> PreparedCif {
        self.descriptor
    }
}
