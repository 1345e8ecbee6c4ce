//! Errors raised by the native-call bridge

use tether_config::ConfigError;
use thiserror::Error;

/// Native-call bridge errors
///
/// Library and symbol failures are only produced when the caller asked for a
/// hard failure; soft lookups return `Ok(None)` instead.
#[derive(Error, Debug)]
pub enum FfiError {
    /// Library could not be located or opened
    #[error("could not load library \"{name}\": {reason}")]
    LibraryNotFound { name: String, reason: String },

    /// Symbol not found in library
    #[error("could not load symbol \"{symbol}\" from {library}")]
    SymbolNotFound { library: String, symbol: String },

    /// Executable page mapping failed
    #[error("out of memory: could not map {requested} bytes of executable memory")]
    OutOfMemory { requested: usize },

    /// A dynamic library identifier of the wrong kind
    #[error("TypeError: in {context}, expected {expected}, got a value of type {found}")]
    TypeError {
        context: &'static str,
        expected: &'static str,
        found: String,
    },

    /// Type parameter could not be instantiated in its environment
    #[error("could not specialize type parameter {parameter}: {reason}")]
    Specialization { parameter: String, reason: String },

    /// A process image could not be opened at startup
    #[error("could not open process image {image}: {reason}")]
    ProcessImage { image: String, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for bridge operations
pub type FfiResult<T> = Result<T, FfiError>;
