//! Dynamic library loading and the typed library facade
//!
//! `DynamicLibrary` is the thin handle layer: open, resolve, close, with
//! null results turned into errors carrying the loader's own message.
//! `Library` is the facade on top: declare a symbol table once, get back a
//! name-to-function map with every symbol resolved and every signature
//! prepared, failing fast on the first missing symbol.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::FfiError;
use crate::executor::{AbiExecutor, CallingConvention, OpenMode};
use crate::function::ForeignFunction;

/// Platform shared-library extension appended to bare paths.
#[cfg(target_os = "windows")]
pub const LIB_EXT: &str = ".dll";
#[cfg(target_os = "macos")]
pub const LIB_EXT: &str = ".dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
pub const LIB_EXT: &str = ".so";

/// An open native module handle.
pub struct DynamicLibrary {
    executor: Arc<dyn AbiExecutor>,
    handle: usize,
    path: String,
    closed: AtomicBool,
}

impl DynamicLibrary {
    /// Open the module at `path`, appending the platform extension when the
    /// path does not already end with it.
    pub fn open(
        executor: Arc<dyn AbiExecutor>,
        path: &str,
        mode: OpenMode,
    ) -> Result<Self, FfiError> {
        let path = if path.ends_with(LIB_EXT) {
            path.to_string()
        } else {
            format!("{}{}", path, LIB_EXT)
        };

        let handle = executor.open(&path, mode);
        if handle == 0 {
            return Err(FfiError::Link(executor.last_error()));
        }
        info!(path = %path, "library opened");

        Ok(Self {
            executor,
            handle,
            path,
            closed: AtomicBool::new(false),
        })
    }

    /// Path the module was opened with, extension included.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Resolve a symbol to its address.
    pub fn get(&self, symbol: &str) -> Result<usize, FfiError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FfiError::LibraryClosed(self.path.clone()));
        }
        let addr = self.executor.lookup(self.handle, symbol);
        if addr == 0 {
            return Err(FfiError::Symbol(self.executor.last_error()));
        }
        debug!(symbol, addr, "symbol resolved");
        Ok(addr)
    }

    /// Close the handle. Later calls are no-ops; later lookups fail with
    /// `LibraryClosed`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.executor.close(self.handle);
            info!(path = %self.path, "library closed");
        }
    }
}

impl Drop for DynamicLibrary {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for DynamicLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicLibrary")
            .field("path", &self.path)
            .field("handle", &format_args!("{:#x}", self.handle))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Declared signature for one exported symbol.
#[derive(Debug, Clone)]
pub struct SymbolSpec {
    pub return_type: String,
    pub arg_types: Vec<String>,
    pub abi: Option<CallingConvention>,
}

impl SymbolSpec {
    pub fn new(return_type: &str, arg_types: &[&str]) -> Self {
        Self {
            return_type: return_type.to_string(),
            arg_types: arg_types.iter().map(|s| s.to_string()).collect(),
            abi: None,
        }
    }

    pub fn with_abi(mut self, abi: CallingConvention) -> Self {
        self.abi = Some(abi);
        self
    }
}

/// A module plus its fully resolved, signature-prepared exports.
pub struct Library {
    module: DynamicLibrary,
    functions: HashMap<String, ForeignFunction>,
}

impl Library {
    /// Open `path` and resolve every declared symbol, failing on the first
    /// one that is missing. The module closes again if resolution fails.
    pub fn open(
        executor: Arc<dyn AbiExecutor>,
        path: &str,
        symbols: &[(&str, SymbolSpec)],
    ) -> Result<Self, FfiError> {
        let module = DynamicLibrary::open(Arc::clone(&executor), path, OpenMode::Now)?;

        let mut functions = HashMap::with_capacity(symbols.len());
        for (name, spec) in symbols {
            let target = module.get(name)?;
            let args: Vec<&str> = spec.arg_types.iter().map(String::as_str).collect();
            let function = ForeignFunction::new(
                Arc::clone(&executor),
                target,
                &spec.return_type,
                &args,
                spec.abi,
            )?;
            functions.insert((*name).to_string(), function);
        }

        Ok(Self { module, functions })
    }

    /// The resolved function for `name`, if it was declared.
    pub fn function(&self, name: &str) -> Option<&ForeignFunction> {
        self.functions.get(name)
    }

    /// The underlying module handle.
    pub fn module(&self) -> &DynamicLibrary {
        &self.module
    }
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library")
            .field("path", &self.module.path())
            .field("functions", &self.functions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use crate::executor::mock::MockExecutor;
    use crate::executor::SystemExecutor;

    #[test]
    fn extension_is_appended_when_missing() {
        let exec = MockExecutor::new();
        let scripted = format!("libm{}", LIB_EXT);
        exec.script_library(&scripted, 7);

        let lib = DynamicLibrary::open(Arc::clone(&exec) as _, "libm", OpenMode::Now).unwrap();
        assert_eq!(lib.path(), scripted);
        assert_eq!(exec.opened.lock().as_slice(), &[scripted]);
    }

    #[test]
    fn extension_is_not_doubled() {
        let exec = MockExecutor::new();
        let path = format!("libm{}", LIB_EXT);
        exec.script_library(&path, 7);
        let lib = DynamicLibrary::open(Arc::clone(&exec) as _, &path, OpenMode::Now).unwrap();
        assert_eq!(lib.path(), path);
    }

    #[test]
    fn null_handle_carries_loader_error() {
        let exec = MockExecutor::new();
        exec.set_last_error("no such module");
        let err =
            DynamicLibrary::open(Arc::clone(&exec) as _, "missing", OpenMode::Now).unwrap_err();
        assert_eq!(err, FfiError::Link("no such module".into()));
    }

    #[test]
    fn missing_symbol_carries_loader_error() {
        let exec = MockExecutor::new();
        let path = format!("lib{}", LIB_EXT);
        exec.script_library(&path, 7);
        exec.set_last_error("undefined symbol: nope");

        let lib = DynamicLibrary::open(Arc::clone(&exec) as _, &path, OpenMode::Now).unwrap();
        assert_eq!(
            lib.get("nope"),
            Err(FfiError::Symbol("undefined symbol: nope".into()))
        );
    }

    #[test]
    fn lookups_fail_after_close_and_close_runs_once() {
        let exec = MockExecutor::new();
        let path = format!("lib{}", LIB_EXT);
        exec.script_library(&path, 7);
        exec.script_symbol(7, "f", 0x30);

        let lib = DynamicLibrary::open(Arc::clone(&exec) as _, &path, OpenMode::Now).unwrap();
        assert!(lib.get("f").is_ok());

        lib.close();
        assert_eq!(lib.get("f"), Err(FfiError::LibraryClosed(path)));

        drop(lib);
        // Explicit close plus drop still closes the handle once.
        assert_eq!(exec.closed.lock().as_slice(), &[7]);
    }

    #[test]
    fn facade_resolves_declared_symbols() {
        let exec = MockExecutor::new();
        let path = format!("libmath{}", LIB_EXT);
        exec.script_library(&path, 9);
        exec.script_symbol(9, "add", 0x40);
        exec.on_call(|target, words| {
            assert_eq!(target, 0x40);
            Ok(words.iter().sum())
        });

        let lib = Library::open(
            Arc::clone(&exec) as _,
            "libmath",
            &[("add", SymbolSpec::new("int64", &["int64", "int64"]))],
        )
        .unwrap();

        let add = lib.function("add").unwrap();
        assert_eq!(
            add.invoke(&[Value::Int(40), Value::Int(2)]).unwrap(),
            Value::Int(42)
        );
        assert!(lib.function("sub").is_none());
    }

    #[test]
    fn facade_fails_fast_on_missing_symbol() {
        let exec = MockExecutor::new();
        let path = format!("libmath{}", LIB_EXT);
        exec.script_library(&path, 9);
        exec.script_symbol(9, "add", 0x40);
        exec.set_last_error("undefined symbol: sub");

        let err = Library::open(
            Arc::clone(&exec) as _,
            "libmath",
            &[
                ("add", SymbolSpec::new("int", &["int", "int"])),
                ("sub", SymbolSpec::new("int", &["int", "int"])),
            ],
        )
        .unwrap_err();

        assert_eq!(err, FfiError::Symbol("undefined symbol: sub".into()));
        // The module does not stay open behind a failed facade.
        assert_eq!(exec.closed.lock().as_slice(), &[9]);
    }

    #[cfg(unix)]
    #[test]
    fn real_missing_library_is_a_link_error() {
        let exec: Arc<dyn AbiExecutor> = SystemExecutor::new();
        let err = DynamicLibrary::open(exec, "no-such-module-here", OpenMode::Now).unwrap_err();
        assert!(matches!(err, FfiError::Link(_)));
    }
}
