//! Dynamic library loading for FFI
//!
//! Provides cross-platform dynamic library loading using `libloading`.
//! Handles platform-specific library naming conventions and search paths.
//! The [`DynamicLoader`] trait is the seam the library cache loads through,
//! so hosts (and tests) can substitute their own loader.

use libloading::Library;
use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;
use tether_config::BridgeConfig;

/// Library loading errors
#[derive(Debug, Clone, PartialEq)]
pub enum LoadError {
    /// Library file not found in search paths
    LibraryNotFound(String),
    /// Failed to load library
    LoadFailed(String),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::LibraryNotFound(name) => write!(f, "Library not found: {}", name),
            LoadError::LoadFailed(msg) => write!(f, "Failed to load library: {}", msg),
        }
    }
}

impl std::error::Error for LoadError {}

/// Images that are part of the process itself and never go through the
/// library table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessImage {
    /// Platform default search scope
    DefaultSearch,
    /// The executable
    Executable,
    /// The runtime's internal library
    RuntimeInternal,
    /// The runtime's public library
    RuntimePublic,
}

impl fmt::Display for ProcessImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessImage::DefaultSearch => "<default search>",
            ProcessImage::Executable => "<executable>",
            ProcessImage::RuntimeInternal => "<runtime internal>",
            ProcessImage::RuntimePublic => "<runtime>",
        };
        f.write_str(name)
    }
}

/// Address of a resolved native symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolAddress(NonNull<c_void>);

// Safety: a symbol address is an immutable location in a mapped image
unsafe impl Send for SymbolAddress {}
unsafe impl Sync for SymbolAddress {}

impl SymbolAddress {
    pub fn new(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(SymbolAddress)
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.0.as_ptr()
    }
}

/// A loaded shared object
pub trait NativeLibrary: Send + Sync {
    /// Look up an exported symbol
    fn symbol(&self, name: &str) -> Option<SymbolAddress>;

    /// Name used in diagnostics
    fn describe(&self) -> &str;
}

/// Platform dynamic-library primitive
pub trait DynamicLoader: Send + Sync {
    /// Open a library by name or path
    fn open(&self, name: &str) -> Result<Arc<dyn NativeLibrary>, LoadError>;

    /// Open one of the process's own images; called once per image at startup
    fn open_image(&self, image: ProcessImage) -> Result<Arc<dyn NativeLibrary>, LoadError>;
}

/// A library opened through `libloading`
struct SystemLibrary {
    name: String,
    library: Library,
}

impl NativeLibrary for SystemLibrary {
    fn symbol(&self, name: &str) -> Option<SymbolAddress> {
        // Safety: the symbol is read as an address only, never called here
        let symbol = unsafe { self.library.get::<*mut c_void>(name.as_bytes()) }.ok()?;
        SymbolAddress::new(*symbol)
    }

    fn describe(&self) -> &str {
        &self.name
    }
}

/// Dynamic library loader with platform-specific path resolution
///
/// # Safety
///
/// Loading dynamic libraries is inherently unsafe. The loaded code runs in the
/// same process and can perform arbitrary operations.
pub struct SystemLoader {
    /// Library search paths, highest priority first
    search_paths: Vec<PathBuf>,
    runtime_internal: Option<PathBuf>,
    runtime_public: Option<PathBuf>,
}

impl SystemLoader {
    /// Create a new library loader with default search paths
    pub fn new() -> Self {
        Self {
            search_paths: Self::default_search_paths(),
            runtime_internal: None,
            runtime_public: None,
        }
    }

    /// Loader with configured paths searched before the defaults
    pub fn from_config(config: &BridgeConfig) -> Self {
        let mut search_paths = config.search_paths().to_vec();
        search_paths.extend(Self::default_search_paths());
        Self {
            search_paths,
            runtime_internal: config.runtime_internal().map(Path::to_path_buf),
            runtime_public: config.runtime_public().map(Path::to_path_buf),
        }
    }

    /// Get platform-specific default library search paths
    ///
    /// Returns standard system library paths for the current platform:
    /// - Linux: /usr/lib, /usr/local/lib, /lib
    /// - macOS: /usr/lib, /usr/local/lib, /opt/homebrew/lib
    /// - Windows: C:\Windows\System32
    /// - All platforms: current working directory
    fn default_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(target_os = "linux")]
        {
            paths.push(PathBuf::from("/usr/lib"));
            paths.push(PathBuf::from("/usr/local/lib"));
            paths.push(PathBuf::from("/lib"));

            if cfg!(target_pointer_width = "64") {
                paths.push(PathBuf::from("/usr/lib64"));
                paths.push(PathBuf::from("/lib64"));
            }
        }

        #[cfg(target_os = "macos")]
        {
            paths.push(PathBuf::from("/usr/lib"));
            paths.push(PathBuf::from("/usr/local/lib"));
            paths.push(PathBuf::from("/opt/homebrew/lib"));
        }

        #[cfg(target_os = "windows")]
        {
            paths.push(PathBuf::from("C:\\Windows\\System32"));
            if let Ok(system_root) = std::env::var("SystemRoot") {
                paths.push(PathBuf::from(format!("{}\\System32", system_root)));
            }
        }

        if let Ok(cwd) = std::env::current_dir() {
            paths.insert(0, cwd);
        }

        paths
    }

    /// Resolve library name to full path with platform-specific naming
    ///
    /// Handles platform-specific library naming conventions:
    /// - Linux: lib{name}.so
    /// - macOS: lib{name}.dylib or lib{name}.so
    /// - Windows: {name}.dll
    ///
    /// Exact file names are tried before decorated ones.
    fn resolve_library_path(&self, name: &str) -> Option<PathBuf> {
        let path = Path::new(name);
        if path.is_absolute() {
            return path.exists().then(|| path.to_path_buf());
        }

        let extensions: &[&str] = if cfg!(target_os = "windows") {
            &["dll"]
        } else if cfg!(target_os = "macos") {
            &["dylib", "so"]
        } else {
            &["so"]
        };

        let prefixes: &[&str] = if cfg!(target_os = "windows") {
            &["", "lib"]
        } else {
            &["lib", ""]
        };

        for search_path in &self.search_paths {
            let exact = search_path.join(name);
            if exact.is_file() {
                return Some(exact);
            }

            for prefix in prefixes {
                for ext in extensions {
                    let full_path = search_path.join(format!("{}{}.{}", prefix, name, ext));
                    if full_path.is_file() {
                        return Some(full_path);
                    }
                }
            }
        }

        None
    }

    /// Add a custom search path (prepended to search list)
    pub fn add_search_path(&mut self, path: PathBuf) {
        self.search_paths.insert(0, path);
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    fn open_path(name: String, path: &Path) -> Result<Arc<dyn NativeLibrary>, LoadError> {
        // Safety: loading runs the library's initializers; the caller trusts it
        let library = unsafe { Library::new(path) }.map_err(|e| LoadError::LoadFailed(e.to_string()))?;
        Ok(Arc::new(SystemLibrary { name, library }))
    }

    fn open_self(image: ProcessImage) -> Result<Arc<dyn NativeLibrary>, LoadError> {
        #[cfg(unix)]
        let library: Library = libloading::os::unix::Library::this().into();
        #[cfg(windows)]
        let library: Library = libloading::os::windows::Library::this()
            .map_err(|e| LoadError::LoadFailed(e.to_string()))?
            .into();

        Ok(Arc::new(SystemLibrary {
            name: image.to_string(),
            library,
        }))
    }
}

impl Default for SystemLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamicLoader for SystemLoader {
    fn open(&self, name: &str) -> Result<Arc<dyn NativeLibrary>, LoadError> {
        match self.resolve_library_path(name) {
            Some(path) => Self::open_path(name.to_string(), &path),
            // Let the platform apply its own search rules (ld cache, rpath, ...)
            None => Self::open_path(name.to_string(), Path::new(name)).map_err(|e| match e {
                LoadError::LoadFailed(msg) => LoadError::LibraryNotFound(format!("{} ({})", name, msg)),
                other => other,
            }),
        }
    }

    fn open_image(&self, image: ProcessImage) -> Result<Arc<dyn NativeLibrary>, LoadError> {
        let configured = match image {
            ProcessImage::RuntimeInternal => self.runtime_internal.as_deref(),
            ProcessImage::RuntimePublic => self.runtime_public.as_deref(),
            ProcessImage::DefaultSearch | ProcessImage::Executable => None,
        };
        match configured {
            Some(path) => Self::open_path(image.to_string(), path),
            None => Self::open_self(image),
        }
    }
}
