//! Configuration Loader
//!
//! Handles loading and merging configuration from multiple sources with proper precedence.

use crate::bridge::{BridgeConfig, LibrariesConfig, TrampolinesConfig};
use crate::{ConfigError, ConfigResult};
use std::env;
use std::path::{Path, PathBuf};

/// Project configuration file name
pub const CONFIG_FILE_NAME: &str = "tether.toml";

/// Environment variable holding extra library directories (platform path list)
pub const ENV_LIBRARY_PATH: &str = "TETHER_LIBRARY_PATH";

/// Environment variable overriding `trampolines.initial_pages`
pub const ENV_INITIAL_PAGES: &str = "TETHER_INITIAL_PAGES";

/// Configuration loader
///
/// Loads configuration from multiple sources and merges them with proper precedence:
/// 1. Global config (~/.tether/config.toml) - lowest priority
/// 2. Project config (./tether.toml) - overrides global
/// 3. Environment variables (TETHER_*) - overrides project
pub struct ConfigLoader {
    /// Cached global config path
    global_config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            global_config_path: None,
        }
    }

    /// Use an explicit global config file instead of ~/.tether/config.toml
    pub fn with_global_config_path(path: PathBuf) -> Self {
        Self {
            global_config_path: Some(path),
        }
    }

    /// Load configuration starting from the given directory
    ///
    /// Walks up the directory tree to find tether.toml, then merges it over
    /// the global config and applies environment overrides.
    pub fn load_from_directory(&mut self, start_dir: &Path) -> ConfigResult<BridgeConfig> {
        let project = find_project_config(start_dir)?;
        let global = self.load_global_config()?;
        let config = apply_env_overrides(project.merged_over(global))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific project config file
    pub fn load_from_file(&mut self, config_path: &Path) -> ConfigResult<BridgeConfig> {
        let project = BridgeConfig::load_from_file(config_path)?;
        let global = self.load_global_config()?;
        let config = apply_env_overrides(project.merged_over(global))?;
        config.validate()?;
        Ok(config)
    }

    /// Load global configuration; a missing file (or home directory) yields defaults
    fn load_global_config(&mut self) -> ConfigResult<BridgeConfig> {
        if self.global_config_path.is_none() {
            match Self::global_config_dir() {
                Ok(dir) => self.global_config_path = Some(dir.join("config.toml")),
                Err(ConfigError::HomeNotFound) => return Ok(BridgeConfig::default()),
                Err(e) => return Err(e),
            }
        }

        match self.global_config_path.as_deref() {
            Some(path) if path.exists() => BridgeConfig::load_from_file(path),
            _ => Ok(BridgeConfig::default()),
        }
    }

    /// Get the global configuration directory (~/.tether)
    pub fn global_config_dir() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(".tether"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Find tether.toml by walking up the directory tree
fn find_project_config(start_dir: &Path) -> ConfigResult<BridgeConfig> {
    let mut current = start_dir.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            return BridgeConfig::load_from_file(&config_path);
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return Ok(BridgeConfig::default()),
        }
    }
}

/// Apply TETHER_* environment overrides
fn apply_env_overrides(mut config: BridgeConfig) -> ConfigResult<BridgeConfig> {
    if let Some(paths) = env::var_os(ENV_LIBRARY_PATH) {
        let extra: Vec<PathBuf> = env::split_paths(&paths)
            .filter(|p| !p.as_os_str().is_empty())
            .collect();
        if !extra.is_empty() {
            let libraries = config.libraries.get_or_insert_with(LibrariesConfig::default);
            let mut search_paths = extra;
            search_paths.append(&mut libraries.search_paths);
            libraries.search_paths = search_paths;
        }
    }

    if let Ok(pages) = env::var(ENV_INITIAL_PAGES) {
        let pages = pages
            .trim()
            .parse::<usize>()
            .map_err(|e| ConfigError::InvalidValue {
                field: ENV_INITIAL_PAGES.to_string(),
                reason: e.to_string(),
            })?;
        config
            .trampolines
            .get_or_insert_with(TrampolinesConfig::default)
            .initial_pages = Some(pages);
    }

    Ok(config)
}
