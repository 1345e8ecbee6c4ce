//! Tether Runtime - native-call bridge of a managed runtime
//!
//! This library provides:
//! - A process-wide cache of loaded native libraries
//! - Deferred library resolution at first call
//! - Executable trampolines that let native code call back into managed
//!   values, cached per call site and reclaimed when unreachable

/// Tether runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod ffi;
pub mod runtime;
pub mod value;

pub use ffi::{
    BoundState, CacheCell, CallSiteLibrary, FfiError, FfiResult, LibraryCache, LibraryHandle,
    LibraryName, ResultType, Trampoline, TrampolineCache, TrampolineRequest, TrampolineStats,
};
pub use runtime::FfiRuntimeState;
pub use value::{DataType, Object, UnionAll, Value, ValueId};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smoke() {
        assert_eq!(VERSION, "0.1.0");
    }
}
