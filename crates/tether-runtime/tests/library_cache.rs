mod common;

use common::*;
use common::assert_eq;
use rstest::rstest;
use std::sync::{Arc, Barrier};
use std::thread;
use tether_runtime::ffi::{CallSiteLibrary, LibraryHandle, LibraryOpener};
use tether_runtime::{DataType, FfiError, FfiResult, LibraryName, Object, Value};

#[test]
fn test_concurrent_resolves_load_once() {
    let loader = CountingLoader::new();
    let state = Arc::new(bridge(loader.clone(), HeapPages::new(256)));
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let workers: Vec<_> = (0..threads)
        .map(|_| {
            let state = Arc::clone(&state);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                state
                    .libraries()
                    .resolve(LibraryName::Path("libshared"), true)
                    .unwrap()
                    .unwrap()
            })
        })
        .collect();
    let handles: Vec<LibraryHandle> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    assert_eq!(loader.opens("libshared"), 1);
    assert!(handles.iter().all(|h| h.same_library(&handles[0])));
    assert_eq!(state.libraries().loaded_count(), 1);
}

#[test]
fn test_distinct_names_each_load_once() {
    let loader = CountingLoader::new();
    let state = Arc::new(bridge(loader.clone(), HeapPages::new(256)));

    let workers: Vec<_> = (0..12)
        .map(|i| {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                let name = format!("lib{}", i % 4);
                state.libraries().resolve(LibraryName::Path(&name), true).unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    for i in 0..4 {
        assert_eq!(loader.opens(&format!("lib{}", i)), 1);
    }
    assert_eq!(state.libraries().loaded_count(), 4);
}

#[rstest]
#[case::default(None)]
#[case::executable(Some("@executable"))]
#[case::runtime_internal(Some("@runtime_internal"))]
#[case::runtime(Some("@runtime"))]
fn test_sentinels_bypass_loader(#[case] name: Option<&str>) {
    let loader = CountingLoader::new();
    let state = bridge(loader.clone(), HeapPages::new(256));

    let handle = state.libraries().resolve(LibraryName::parse(name), false).unwrap();
    assert!(handle.is_some());
    assert_eq!(loader.total_opens(), 0);
    assert_eq!(loader.image_opens(), 4);
    assert_eq!(state.libraries().loaded_count(), 0);
}

#[test]
fn test_sentinel_resolves_while_table_lock_is_held() {
    let loader = CountingLoader::new();
    let gate = Gate::new();
    loader.gate("libslow", Arc::clone(&gate));
    let state = Arc::new(bridge(loader.clone(), HeapPages::new(256)));

    let held = gate.release().lock().unwrap();
    let slow = {
        let state = Arc::clone(&state);
        thread::spawn(move || {
            state
                .libraries()
                .resolve(LibraryName::Path("libslow"), true)
                .map(|h| h.is_some())
        })
    };
    // The slow load is now running under the table lock
    gate.wait_entered();

    let exe = state.libraries().resolve(LibraryName::Executable, true).unwrap();
    assert!(exe.is_some());

    drop(held);
    assert!(slow.join().unwrap().unwrap());
    assert_eq!(loader.opens("libslow"), 1);
}

#[test]
fn test_hard_failure_reports_library_and_leaves_no_entry() {
    let loader = CountingLoader::new();
    let state = bridge(loader.clone(), HeapPages::new(256));

    let err = state
        .libraries()
        .resolve(LibraryName::Path("missing-lib"), true)
        .unwrap_err();
    assert!(matches!(err, FfiError::LibraryNotFound { ref name, .. } if name == "missing-lib"));
    assert!(!state.libraries().is_loaded("missing-lib"));
}

#[test]
fn test_symbol_lookup_hard_and_soft() {
    let state = bridge(CountingLoader::new(), HeapPages::new(256));
    let libraries = state.libraries();
    let libm = libraries.resolve(LibraryName::Path("libm"), true).unwrap().unwrap();

    assert!(libraries.lookup(&libm, "cos", true).unwrap().is_some());
    assert!(libraries.lookup(&libm, "tan", false).unwrap().is_none());
    let err = libraries.lookup(&libm, "tan", true).unwrap_err();
    assert!(matches!(err, FfiError::SymbolNotFound { ref symbol, .. } if symbol == "tan"));
}

#[test]
fn test_call_site_caches_handle() {
    let loader = CountingLoader::new();
    let state = bridge(loader.clone(), HeapPages::new(256));
    let site = CallSiteLibrary::new();

    let first = state
        .libraries()
        .load_and_lookup(LibraryName::Path("libm"), "cos", &site)
        .unwrap();
    let second = state
        .libraries()
        .load_and_lookup(LibraryName::Path("libm"), "cos", &site)
        .unwrap();

    assert_eq!(first, second);
    assert!(site.cached().is_some());
    assert_eq!(loader.opens("libm"), 1);
}

#[rstest]
#[case::symbol(Value::symbol("libm"))]
#[case::string(Value::string("libm"))]
fn test_lazy_lookup_accepts_names(#[case] library: Value) {
    let state = bridge(CountingLoader::new(), HeapPages::new(256));
    let address = state.libraries().lazy_load_and_lookup(&library, "sin").unwrap();
    assert!(!address.as_ptr().is_null());
    assert!(state.libraries().is_loaded("libm"));
}

#[test]
fn test_lazy_lookup_reserved_name_uses_image() {
    let loader = CountingLoader::new();
    let state = bridge(loader.clone(), HeapPages::new(256));
    state
        .libraries()
        .lazy_load_and_lookup(&Value::symbol("@executable"), "main")
        .unwrap();
    assert_eq!(loader.total_opens(), 0);
}

#[rstest]
#[case::integer(Value::Int(3), "Int")]
#[case::nothing(Value::Nothing, "Nothing")]
#[case::object(Object::new(&DataType::concrete("LazyLibrary").with_fields(1).into_arc(), vec![Value::Int(0)]), "LazyLibrary")]
fn test_malformed_identifier_is_type_error(#[case] library: Value, #[case] found_kind: &str) {
    let loader = CountingLoader::new();
    let state = bridge(loader.clone(), HeapPages::new(256));

    let err = state.libraries().lazy_load_and_lookup(&library, "sin").unwrap_err();
    match err {
        FfiError::TypeError { expected, found, .. } => {
            assert_eq!(expected, "Symbol");
            assert_eq!(found, found_kind);
        }
        other => panic!("expected TypeError, got {:?}", other),
    }
    assert_eq!(state.libraries().loaded_count(), 0);
    assert_eq!(loader.total_opens(), 0);
}

/// Opens the library path stored in a `LazyLibrary` object's first field
struct LazyOpener {
    state: std::sync::Weak<tether_runtime::FfiRuntimeState>,
}

impl LibraryOpener for LazyOpener {
    fn open(&self, library: &Value) -> FfiResult<LibraryHandle> {
        let path = match library {
            Value::Object(obj) if obj.ty().name() == "LazyLibrary" => match obj.fields().first() {
                Some(Value::String(path)) => path.clone(),
                _ => {
                    return Err(FfiError::TypeError {
                        context: "LazyLibrary",
                        expected: "String",
                        found: library.type_name().to_string(),
                    })
                }
            },
            other => {
                return Err(FfiError::TypeError {
                    context: "dlopen",
                    expected: "LazyLibrary",
                    found: other.type_name().to_string(),
                })
            }
        };
        let state = self.state.upgrade().expect("bridge dropped");
        let handle = state.libraries().resolve(LibraryName::Path(&path), true)?;
        Ok(handle.expect("hard resolve returns a handle"))
    }
}

#[test]
fn test_lazy_lookup_dispatches_to_opener() {
    let loader = CountingLoader::new();
    let state = Arc::new(bridge(loader.clone(), HeapPages::new(256)));
    state.libraries().set_opener(Arc::new(LazyOpener {
        state: Arc::downgrade(&state),
    }));

    let lazy_type = DataType::concrete("LazyLibrary").with_fields(1).into_arc();
    let lazy = Object::new(&lazy_type, vec![Value::string("libplugin")]);

    let address = state.libraries().lazy_load_and_lookup(&lazy, "callback_entry").unwrap();
    assert!(!address.as_ptr().is_null());
    assert_eq!(loader.opens("libplugin"), 1);

    let err = state
        .libraries()
        .lazy_load_and_lookup(&Value::Int(1), "callback_entry")
        .unwrap_err();
    assert!(matches!(err, FfiError::TypeError { context: "dlopen", .. }));
}
