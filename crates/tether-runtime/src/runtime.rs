//! Process-lifetime owner of the bridge's shared state

use crate::ffi::error::FfiResult;
use crate::ffi::library::LibraryCache;
use crate::ffi::loader::{DynamicLoader, SystemLoader};
use crate::ffi::slots::{PageMapper, SystemPages};
use crate::ffi::specialize::{EnvSpecializer, Specializer};
use crate::ffi::trampoline::TrampolineCache;
use std::sync::Arc;
use tether_config::BridgeConfig;
use tracing::info;

/// The library handle cache and the trampoline cache, created together at
/// startup and passed by reference to every call site
///
/// # Examples
///
/// ```no_run
/// use tether_config::BridgeConfig;
/// use tether_runtime::{FfiRuntimeState, LibraryName};
///
/// let state = FfiRuntimeState::new(BridgeConfig::default()).unwrap();
/// let libm = state.libraries().resolve(LibraryName::Path("libm"), true).unwrap();
/// ```
pub struct FfiRuntimeState {
    libraries: LibraryCache,
    trampolines: TrampolineCache,
}

impl FfiRuntimeState {
    /// Build with the system loader, OS pages and plain environment
    /// substitution
    pub fn new(config: BridgeConfig) -> FfiResult<Self> {
        let loader = Arc::new(SystemLoader::from_config(&config));
        Self::with_parts(
            loader,
            Box::new(SystemPages::new()),
            Arc::new(EnvSpecializer),
            &config,
        )
    }

    /// Build from explicit collaborators
    pub fn with_parts(
        loader: Arc<dyn DynamicLoader>,
        pages: Box<dyn PageMapper>,
        specializer: Arc<dyn Specializer>,
        config: &BridgeConfig,
    ) -> FfiResult<Self> {
        config.validate()?;

        let libraries = LibraryCache::new(loader)?;
        let trampolines = TrampolineCache::new(pages, specializer);
        let initial_pages = config.initial_pages();
        if initial_pages > 0 {
            trampolines.reserve_pages(initial_pages)?;
        }

        info!(target: "tether::ffi", initial_pages, "native-call bridge ready");
        Ok(Self {
            libraries,
            trampolines,
        })
    }

    pub fn libraries(&self) -> &LibraryCache {
        &self.libraries
    }

    pub fn trampolines(&self) -> &TrampolineCache {
        &self.trampolines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::slots::heap::HeapPages;
    use tether_config::{BridgeConfig, TrampolinesConfig};

    fn config_with_pages(pages: usize) -> BridgeConfig {
        BridgeConfig {
            trampolines: Some(TrampolinesConfig {
                initial_pages: Some(pages),
            }),
            ..BridgeConfig::default()
        }
    }

    #[test]
    fn test_initial_pages_are_reserved() {
        let state = FfiRuntimeState::with_parts(
            Arc::new(SystemLoader::new()),
            Box::new(HeapPages::new(256)),
            Arc::new(EnvSpecializer),
            &config_with_pages(2),
        )
        .unwrap();
        let stats = state.trampolines().stats();
        assert_eq!(stats.pages_mapped, 2);
        assert_eq!(stats.free_slots, 8);
        assert_eq!(state.libraries().loaded_count(), 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = FfiRuntimeState::with_parts(
            Arc::new(SystemLoader::new()),
            Box::new(HeapPages::new(256)),
            Arc::new(EnvSpecializer),
            &config_with_pages(tether_config::MAX_INITIAL_PAGES + 1),
        );
        assert!(matches!(result, Err(crate::FfiError::Config(_))));
    }

    #[test]
    fn test_reservation_failure_propagates() {
        let result = FfiRuntimeState::with_parts(
            Arc::new(SystemLoader::new()),
            Box::new(HeapPages::with_budget(256, 1)),
            Arc::new(EnvSpecializer),
            &config_with_pages(3),
        );
        assert!(matches!(result, Err(crate::FfiError::OutOfMemory { .. })));
    }
}
