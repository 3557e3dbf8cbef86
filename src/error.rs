//! Error taxonomy for the marshaling engine
//!
//! One enum covers the whole boundary: registry lookups, value casts,
//! call-interface preparation, invocation, trampolines, and library linking.
//! Everything is raised synchronously to the immediate caller; asynchronous
//! call failures travel through the completion slot instead.

use thiserror::Error;

/// Errors surfaced by the marshaling engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FfiError {
    /// Type name does not resolve to any registered descriptor.
    #[error("unknown type '{0}'")]
    UnknownType(String),

    /// Type is registered (size known) but has no conversion handler.
    #[error("type '{0}' is not supported yet")]
    UnsupportedType(String),

    /// An absent value was passed where a value was required. Distinct from
    /// an explicit nil, which is legal for pointer-family types.
    #[error("unexpected undefined value on cast to native type")]
    MissingValue,

    /// Value failed the type assertion for the declared slot type.
    #[error("expected a/an {expected}, but got a/an {got}")]
    TypeMismatch { expected: String, got: String },

    /// ABI executor reported a nonzero status while preparing a CIF.
    #[error("prepare CIF failed for errno {0}")]
    CifPreparation(i32),

    /// Caller supplied the wrong number of arguments.
    #[error("expected {expected} arguments, got {got}")]
    ArityMismatch { expected: usize, got: usize },

    /// Struct member name not present in the struct type.
    #[error("unknown struct member '{0}'")]
    UnknownMember(String),

    /// Library load returned a null handle; carries the loader's last error.
    #[error("dynamic linking error: {0}")]
    Link(String),

    /// Symbol lookup returned a null pointer; carries the loader's last error.
    #[error("dynamic symbol retrieval error: {0}")]
    Symbol(String),

    /// Operation attempted on a library handle that was already closed.
    #[error("library '{0}' is closed")]
    LibraryClosed(String),

    /// Host function invoked through a trampoline failed or panicked.
    #[error("callback failure: {0}")]
    CallbackFailure(String),

    /// The executor could not perform the call.
    #[error("native call failed: {0}")]
    CallFailed(String),
}

impl FfiError {
    /// Shorthand for a mismatch built from the runtime kind of a host value.
    pub(crate) fn mismatch(expected: &str, got: &str) -> Self {
        Self::TypeMismatch {
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }
}
