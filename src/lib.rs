//! nativecall - dynamic foreign-function marshaling engine
//!
//! This crate turns `(return type name, argument type names, symbol)`
//! declarations into callable functions at runtime: values are encoded into
//! native buffers, calls go through a prepared call-interface descriptor,
//! and native code can call back into host closures through generated
//! trampolines.
//!
//! The platform surface (call dispatch, trampolines, library loading) sits
//! behind the [`executor::AbiExecutor`] trait; everything above it is pure
//! marshaling logic.

pub mod buffer;
pub mod callback;
pub mod cif;
pub mod codec;
pub mod error;
pub mod executor;
pub mod function;
pub mod library;
pub mod logging;
pub mod structs;
pub mod types;

// Re-export the commonly used surface
pub use buffer::{ArgPack, NativeBuffer};
pub use callback::Callback;
pub use cif::Cif;
pub use codec::{decode, encode, write_into, Value};
pub use error::FfiError;
pub use executor::{
    system, AbiExecutor, AsyncCall, CallingConvention, ClosureHandle, OpenMode, PreparedCif,
    SystemExecutor, TrampolineProxy,
};
pub use function::ForeignFunction;
pub use library::{DynamicLibrary, Library, SymbolSpec, LIB_EXT};
pub use structs::{StructInstance, StructMember, StructType};
pub use types::{size_of, NativeType, INT_SIZE, LONG_SIZE, POINTER_SIZE, SIZE_T_SIZE};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize structured logging from the environment.
pub fn init() {
    logging::init();
}
