//! Native-call bridge
//!
//! - Library loading and symbol lookup with a process-wide handle cache
//! - Executable trampoline slots carved from RWX pages
//! - Trampoline cache keyed by bound value and specialized parameters
//!
//! # Safety
//!
//! Page mapping and dynamic loading involve `unsafe` code. It is confined to
//! [`loader`] and [`slots`]; everything above them is safe.

pub mod error;
pub mod library;
pub mod loader;
pub mod slots;
pub mod specialize;
pub mod trampoline;

pub use error::{FfiError, FfiResult};
pub use library::{CallSiteLibrary, LibraryCache, LibraryHandle, LibraryName, LibraryOpener};
pub use loader::{DynamicLoader, LoadError, NativeLibrary, ProcessImage, SymbolAddress, SystemLoader};
pub use slots::{
    ExecutableRegion, PageMapper, SlotAllocator, SlotId, SlotMemory, SystemPages,
    TRAMPOLINE_SLOT_SIZE,
};
pub use specialize::{BoundState, EnvSpecializer, Specializer, TypeEnv, TypeParam};
pub use trampoline::{
    CacheCell, ResultType, StubInitializer, Trampoline, TrampolineCache, TrampolineRequest,
    TrampolineStats,
};
