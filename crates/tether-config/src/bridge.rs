//! Bridge Configuration (tether.toml)
//!
//! The same file format is used for the project file and the global
//! `~/.tether/config.toml`; [`BridgeConfig::merged_over`] layers them.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Upper bound for `trampolines.initial_pages`
pub const MAX_INITIAL_PAGES: usize = 1024;

/// Native-call bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// Library resolution settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub libraries: Option<LibrariesConfig>,

    /// Trampoline allocator settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trampolines: Option<TrampolinesConfig>,
}

/// Library resolution settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LibrariesConfig {
    /// Extra directories searched before the platform defaults
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub search_paths: Vec<PathBuf>,

    /// Shared object backing the runtime's internal image
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_internal: Option<PathBuf>,

    /// Shared object backing the runtime's public image
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_public: Option<PathBuf>,
}

/// Trampoline allocator settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct TrampolinesConfig {
    /// Pages mapped eagerly at startup (default: 0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_pages: Option<usize>,
}

impl BridgeConfig {
    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate field values
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(pages) = self.trampolines.as_ref().and_then(|t| t.initial_pages) {
            if pages > MAX_INITIAL_PAGES {
                return Err(ConfigError::InvalidValue {
                    field: "trampolines.initial_pages".to_string(),
                    reason: format!("{} exceeds the maximum of {}", pages, MAX_INITIAL_PAGES),
                });
            }
        }

        if let Some(libraries) = &self.libraries {
            for (field, path) in [
                ("libraries.runtime_internal", &libraries.runtime_internal),
                ("libraries.runtime_public", &libraries.runtime_public),
            ] {
                if matches!(path, Some(p) if p.as_os_str().is_empty()) {
                    return Err(ConfigError::InvalidValue {
                        field: field.to_string(),
                        reason: "path must not be empty".to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Layer `self` over `base`: scalar settings from `self` win, search
    /// paths from `self` come first.
    pub fn merged_over(self, base: BridgeConfig) -> BridgeConfig {
        let libraries = match (self.libraries, base.libraries) {
            (Some(top), Some(bottom)) => {
                let mut search_paths = top.search_paths;
                search_paths.extend(bottom.search_paths);
                Some(LibrariesConfig {
                    search_paths,
                    runtime_internal: top.runtime_internal.or(bottom.runtime_internal),
                    runtime_public: top.runtime_public.or(bottom.runtime_public),
                })
            }
            (top, bottom) => top.or(bottom),
        };

        let trampolines = match (self.trampolines, base.trampolines) {
            (Some(top), Some(bottom)) => Some(TrampolinesConfig {
                initial_pages: top.initial_pages.or(bottom.initial_pages),
            }),
            (top, bottom) => top.or(bottom),
        };

        BridgeConfig {
            libraries,
            trampolines,
        }
    }

    /// Configured library search paths, highest priority first
    pub fn search_paths(&self) -> &[PathBuf] {
        self.libraries
            .as_ref()
            .map(|l| l.search_paths.as_slice())
            .unwrap_or(&[])
    }

    pub fn runtime_internal(&self) -> Option<&Path> {
        self.libraries.as_ref()?.runtime_internal.as_deref()
    }

    pub fn runtime_public(&self) -> Option<&Path> {
        self.libraries.as_ref()?.runtime_public.as_deref()
    }

    /// Pages to map at startup
    pub fn initial_pages(&self) -> usize {
        self.trampolines
            .as_ref()
            .and_then(|t| t.initial_pages)
            .unwrap_or(0)
    }
}
