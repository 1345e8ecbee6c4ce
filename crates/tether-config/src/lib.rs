//! Tether Configuration System
//!
//! Provides configuration for the native-call bridge:
//! - Library search paths and runtime image locations
//! - Trampoline allocator tuning
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded and merged in the following order (later overrides earlier):
//! 1. Global config (~/.tether/config.toml)
//! 2. Project config (./tether.toml)
//! 3. Environment variables (TETHER_*)
//!
//! # Example
//!
//! ```no_run
//! use tether_config::ConfigLoader;
//! use std::path::Path;
//!
//! let mut loader = ConfigLoader::new();
//! let config = loader.load_from_directory(Path::new(".")).unwrap();
//! ```

pub mod bridge;
pub mod loader;

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Home directory not found")]
    HomeNotFound,
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

pub use bridge::{BridgeConfig, LibrariesConfig, TrampolinesConfig, MAX_INITIAL_PAGES};
pub use loader::ConfigLoader;
