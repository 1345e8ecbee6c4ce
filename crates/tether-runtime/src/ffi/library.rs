//! Library handle cache
//!
//! Maps user-specified library names to loaded handles. Each distinct name
//! is loaded at most once; the process images are opened up front and are
//! served without touching the table.

use crate::ffi::error::{FfiError, FfiResult};
use crate::ffi::loader::{DynamicLoader, LoadError, NativeLibrary, ProcessImage, SymbolAddress};
use crate::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use tracing::{debug, trace, warn};

/// Reserved name for the executable image
pub const EXE_LIBNAME: &str = "@executable";
/// Reserved name for the runtime's internal image
pub const RUNTIME_INTERNAL_LIBNAME: &str = "@runtime_internal";
/// Reserved name for the runtime's public image
pub const RUNTIME_LIBNAME: &str = "@runtime";

/// Library named at a call site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryName<'a> {
    /// No library given: the platform's default search scope
    Default,
    Executable,
    RuntimeInternal,
    RuntimePublic,
    /// A library name or path to load
    Path(&'a str),
}

impl<'a> LibraryName<'a> {
    /// Map an optional name to a library, recognizing the reserved names
    pub fn parse(name: Option<&'a str>) -> Self {
        match name {
            None => LibraryName::Default,
            Some(EXE_LIBNAME) => LibraryName::Executable,
            Some(RUNTIME_INTERNAL_LIBNAME) => LibraryName::RuntimeInternal,
            Some(RUNTIME_LIBNAME) => LibraryName::RuntimePublic,
            Some(path) => LibraryName::Path(path),
        }
    }
}

/// Handle to a loaded library
///
/// Clones share the underlying library. Two handles loaded separately for the
/// same path may compare unequal under [`LibraryHandle::same_library`].
#[derive(Clone)]
pub struct LibraryHandle(Arc<dyn NativeLibrary>);

impl LibraryHandle {
    pub fn new(library: Arc<dyn NativeLibrary>) -> Self {
        Self(library)
    }

    pub fn same_library(&self, other: &LibraryHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn name(&self) -> &str {
        self.0.describe()
    }

    fn symbol(&self, name: &str) -> Option<SymbolAddress> {
        self.0.symbol(name)
    }
}

impl fmt::Debug for LibraryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LibraryHandle").field(&self.name()).finish()
    }
}

/// User-overridable "open" operation for library identifiers that are
/// neither symbols nor strings (lazy libraries and similar policies)
pub trait LibraryOpener: Send + Sync {
    fn open(&self, library: &Value) -> FfiResult<LibraryHandle>;
}

/// Per-call-site handle cache, filled on first use
#[derive(Default)]
pub struct CallSiteLibrary {
    handle: OnceLock<LibraryHandle>,
}

impl CallSiteLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached(&self) -> Option<&LibraryHandle> {
        self.handle.get()
    }
}

struct ProcessImages {
    default_search: LibraryHandle,
    executable: LibraryHandle,
    runtime_internal: LibraryHandle,
    runtime_public: LibraryHandle,
}

impl ProcessImages {
    fn open(loader: &dyn DynamicLoader) -> FfiResult<Self> {
        let open = |image: ProcessImage| {
            loader
                .open_image(image)
                .map(LibraryHandle)
                .map_err(|e| FfiError::ProcessImage {
                    image: image.to_string(),
                    reason: e.to_string(),
                })
        };
        Ok(Self {
            default_search: open(ProcessImage::DefaultSearch)?,
            executable: open(ProcessImage::Executable)?,
            runtime_internal: open(ProcessImage::RuntimeInternal)?,
            runtime_public: open(ProcessImage::RuntimePublic)?,
        })
    }

    fn get(&self, image: ProcessImage) -> &LibraryHandle {
        match image {
            ProcessImage::DefaultSearch => &self.default_search,
            ProcessImage::Executable => &self.executable,
            ProcessImage::RuntimeInternal => &self.runtime_internal,
            ProcessImage::RuntimePublic => &self.runtime_public,
        }
    }
}

/// Name → handle table plus the process images
pub struct LibraryCache {
    loader: Arc<dyn DynamicLoader>,
    images: ProcessImages,
    table: Mutex<HashMap<String, LibraryHandle>>,
    opener: RwLock<Option<Arc<dyn LibraryOpener>>>,
}

impl LibraryCache {
    /// Open the process images and start with an empty table
    pub fn new(loader: Arc<dyn DynamicLoader>) -> FfiResult<Self> {
        let images = ProcessImages::open(loader.as_ref())?;
        Ok(Self {
            loader,
            images,
            table: Mutex::new(HashMap::new()),
            opener: RwLock::new(None),
        })
    }

    fn lock_table(&self) -> MutexGuard<'_, HashMap<String, LibraryHandle>> {
        // The table is only ever modified by a single insert, so a panic
        // elsewhere cannot leave it half-updated.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve a library to a handle, loading it on first use
    ///
    /// Returns `Ok(None)` for a library that cannot be loaded when
    /// `fail_hard` is false. Failed loads are not cached, so a later call
    /// retries.
    pub fn resolve(&self, name: LibraryName<'_>, fail_hard: bool) -> FfiResult<Option<LibraryHandle>> {
        // Process images: no lock, no loader
        let image = match name {
            LibraryName::Path(path) => return self.resolve_path(path, fail_hard),
            LibraryName::Default => ProcessImage::DefaultSearch,
            LibraryName::Executable => ProcessImage::Executable,
            LibraryName::RuntimeInternal => ProcessImage::RuntimeInternal,
            LibraryName::RuntimePublic => ProcessImage::RuntimePublic,
        };
        Ok(Some(self.images.get(image).clone()))
    }

    fn resolve_path(&self, path: &str, fail_hard: bool) -> FfiResult<Option<LibraryHandle>> {
        let mut table = self.lock_table();
        if let Some(handle) = table.get(path) {
            trace!(target: "tether::ffi", library = path, "library cache hit");
            return Ok(Some(handle.clone()));
        }

        // Loading happens under the lock: slow, but loads are rare
        match self.loader.open(path) {
            Ok(library) => {
                let handle = LibraryHandle(library);
                table.insert(path.to_string(), handle.clone());
                debug!(target: "tether::ffi", library = path, "loaded library");
                Ok(Some(handle))
            }
            Err(e) => {
                drop(table);
                if fail_hard {
                    warn!(target: "tether::ffi", library = path, error = %e, "library load failed");
                    Err(library_error(path, e))
                } else {
                    debug!(target: "tether::ffi", library = path, error = %e, "library load failed (soft)");
                    Ok(None)
                }
            }
        }
    }

    /// Look up a symbol in a resolved library
    pub fn lookup(
        &self,
        handle: &LibraryHandle,
        symbol: &str,
        fail_hard: bool,
    ) -> FfiResult<Option<SymbolAddress>> {
        match handle.symbol(symbol) {
            Some(address) => Ok(Some(address)),
            None if fail_hard => Err(FfiError::SymbolNotFound {
                library: handle.name().to_string(),
                symbol: symbol.to_string(),
            }),
            None => Ok(None),
        }
    }

    /// Resolve `library` once per call site, then look up `symbol`
    pub fn load_and_lookup(
        &self,
        library: LibraryName<'_>,
        symbol: &str,
        site: &CallSiteLibrary,
    ) -> FfiResult<SymbolAddress> {
        let handle = match site.handle.get() {
            Some(handle) => handle,
            None => {
                let resolved = self.resolve_hard(library)?;
                // A racing site may have stored first; both handles are equivalent
                site.handle.get_or_init(|| resolved)
            }
        };
        self.lookup_hard(handle, symbol)
    }

    /// Resolve a library given as a runtime value on first call
    ///
    /// Symbols and strings are library names. Any other value goes to the
    /// installed [`LibraryOpener`]; without one it is a type error.
    pub fn lazy_load_and_lookup(&self, library: &Value, symbol: &str) -> FfiResult<SymbolAddress> {
        let handle = match library {
            Value::Symbol(name) | Value::String(name) => {
                self.resolve_hard(LibraryName::parse(Some(&**name)))?
            }
            other => {
                let opener = self
                    .opener
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                match opener {
                    Some(opener) => opener.open(other)?,
                    None => {
                        return Err(FfiError::TypeError {
                            context: "ccall",
                            expected: "Symbol",
                            found: other.type_name().to_string(),
                        })
                    }
                }
            }
        };
        self.lookup_hard(&handle, symbol)
    }

    /// Install the handler for non-name library identifiers
    pub fn set_opener(&self, opener: Arc<dyn LibraryOpener>) {
        *self.opener.write().unwrap_or_else(PoisonError::into_inner) = Some(opener);
    }

    /// Number of libraries in the table
    pub fn loaded_count(&self) -> usize {
        self.lock_table().len()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.lock_table().contains_key(name)
    }

    fn resolve_hard(&self, name: LibraryName<'_>) -> FfiResult<LibraryHandle> {
        let label = match name {
            LibraryName::Path(path) => path,
            _ => "<process image>",
        };
        self.resolve(name, true)?.ok_or_else(|| FfiError::LibraryNotFound {
            name: label.to_string(),
            reason: "not found".to_string(),
        })
    }

    fn lookup_hard(&self, handle: &LibraryHandle, symbol: &str) -> FfiResult<SymbolAddress> {
        self.lookup(handle, symbol, true)?
            .ok_or_else(|| FfiError::SymbolNotFound {
                library: handle.name().to_string(),
                symbol: symbol.to_string(),
            })
    }
}

fn library_error(name: &str, error: LoadError) -> FfiError {
    let reason = match error {
        LoadError::LibraryNotFound(msg) | LoadError::LoadFailed(msg) => msg,
    };
    FfiError::LibraryNotFound {
        name: name.to_string(),
        reason,
    }
}
