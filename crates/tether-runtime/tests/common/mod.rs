//! Shared fixtures for the bridge integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tether_config::BridgeConfig;
use tether_runtime::ffi::{
    BoundState, DynamicLoader, EnvSpecializer, ExecutableRegion, FfiResult, LoadError,
    NativeLibrary, PageMapper, ProcessImage, SlotMemory, SymbolAddress,
};
use tether_runtime::{DataType, FfiError, FfiRuntimeState, Object, ResultType, Value};

pub use pretty_assertions::{assert_eq, assert_ne};

/// In-memory library exporting a fixed set of symbols
pub struct FakeLibrary {
    name: String,
    symbols: Vec<&'static str>,
}

impl NativeLibrary for FakeLibrary {
    fn symbol(&self, name: &str) -> Option<SymbolAddress> {
        let index = self.symbols.iter().position(|s| *s == name)?;
        SymbolAddress::new((0x4000 + index * 16) as *mut c_void)
    }

    fn describe(&self) -> &str {
        &self.name
    }
}

/// Loader that counts opens per name. Names starting with `missing` fail;
/// a name can be gated so its load blocks until the gate is released.
#[derive(Default)]
pub struct CountingLoader {
    opens: Mutex<HashMap<String, usize>>,
    image_opens: AtomicUsize,
    gates: Mutex<HashMap<String, Arc<Gate>>>,
}

/// One-shot rendezvous between a blocked load and the test body
pub struct Gate {
    entered: std::sync::Barrier,
    release: Mutex<()>,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: std::sync::Barrier::new(2),
            release: Mutex::new(()),
        })
    }

    /// Wait until the gated load is running
    pub fn wait_entered(&self) {
        self.entered.wait();
    }

    pub fn release(&self) -> &Mutex<()> {
        &self.release
    }
}

impl CountingLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn opens(&self, name: &str) -> usize {
        self.opens.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn total_opens(&self) -> usize {
        self.opens.lock().unwrap().values().sum()
    }

    pub fn image_opens(&self) -> usize {
        self.image_opens.load(Ordering::SeqCst)
    }

    pub fn gate(&self, name: &str, gate: Arc<Gate>) {
        self.gates.lock().unwrap().insert(name.to_string(), gate);
    }
}

impl DynamicLoader for CountingLoader {
    fn open(&self, name: &str) -> Result<Arc<dyn NativeLibrary>, LoadError> {
        *self.opens.lock().unwrap().entry(name.to_string()).or_default() += 1;

        let gate = self.gates.lock().unwrap().get(name).cloned();
        if let Some(gate) = gate {
            gate.entered.wait();
            let _released = gate.release.lock().unwrap();
        }

        if name.starts_with("missing") {
            return Err(LoadError::LibraryNotFound(name.to_string()));
        }
        Ok(Arc::new(FakeLibrary {
            name: name.to_string(),
            symbols: vec!["cos", "sin", "callback_entry"],
        }))
    }

    fn open_image(&self, image: ProcessImage) -> Result<Arc<dyn NativeLibrary>, LoadError> {
        self.image_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeLibrary {
            name: image.to_string(),
            symbols: vec!["main", "jl_init"],
        }))
    }
}

/// Heap-backed stand-in for executable pages
pub struct HeapPages {
    page_size: usize,
    budget: Option<usize>,
}

impl HeapPages {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            budget: None,
        }
    }

    pub fn with_budget(page_size: usize, budget: usize) -> Self {
        Self {
            page_size,
            budget: Some(budget),
        }
    }
}

struct HeapRegion {
    _buffer: Box<[u8]>,
    base: NonNull<u8>,
    len: usize,
}

// Safety: the region exclusively owns its buffer
unsafe impl Send for HeapRegion {}

impl ExecutableRegion for HeapRegion {
    fn base(&self) -> NonNull<u8> {
        self.base
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl PageMapper for HeapPages {
    fn map_page(&mut self) -> FfiResult<Box<dyn ExecutableRegion>> {
        if let Some(budget) = self.budget.as_mut() {
            if *budget == 0 {
                return Err(FfiError::OutOfMemory {
                    requested: self.page_size,
                });
            }
            *budget -= 1;
        }
        let mut buffer = vec![0u8; self.page_size].into_boxed_slice();
        let base = NonNull::new(buffer.as_mut_ptr()).unwrap();
        Ok(Box::new(HeapRegion {
            _buffer: buffer,
            base,
            len: self.page_size,
        }))
    }
}

/// Bridge over a counting loader and heap pages
pub fn bridge(loader: Arc<CountingLoader>, pages: HeapPages) -> FfiRuntimeState {
    FfiRuntimeState::with_parts(
        loader,
        Box::new(pages),
        Arc::new(EnvSpecializer),
        &BridgeConfig::default(),
    )
    .unwrap()
}

pub const STUB_MARKER: u8 = 0xE9;

/// Stub initializer writing a marker byte followed by the state address
pub fn marker_stub(memory: &mut SlotMemory<'_>, state: &BoundState) {
    let address = (state as *const BoundState as usize).to_ne_bytes();
    let bytes = memory.bytes_mut();
    bytes[0] = STUB_MARKER;
    bytes[1..1 + address.len()].copy_from_slice(&address);
}

/// A fresh closure object; each call yields a distinct identity
pub fn closure() -> Value {
    let ty = DataType::concrete("#callback").with_fields(1).into_arc();
    Object::new(&ty, vec![Value::Int(1)])
}

pub fn cfunction() -> ResultType {
    ResultType::Type(DataType::concrete("CFunction").into_arc())
}
