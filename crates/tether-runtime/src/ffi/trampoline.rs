//! Trampoline cache
//!
//! Hands out [`Trampoline`]s: executable stubs bound to a managed value and
//! a set of specialized type parameters. Each call site owns a [`CacheCell`];
//! inside the registry a cell maps to a direct table (no parameters) and to
//! one inner table per distinct template and set of environment values.
//! Dropping the cell drops its tables.
//!
//! Storage classes:
//! - Permanent: the registry holds the object strongly for as long as its
//!   cell exists. Used for pointer-only results and for bound values that
//!   live for the whole process anyway.
//! - Collectable: the registry holds a weak reference. Dropping the last
//!   handle runs the reclaimer, which frees the slot and removes the entry.
//!
//! The registry lock guards the slot allocator and every cell table. Only
//! slot allocation, stub initialization and insertion happen under it;
//! specialization runs unlocked. After re-locking the key is checked again
//! and a freshly built object loses to any live entry that appeared in the
//! meantime, so at most one live trampoline exists per key.

use crate::ffi::error::{FfiError, FfiResult};
use crate::ffi::slots::{PageMapper, SlotAllocator, SlotId, SlotMemory, TRAMPOLINE_SLOT_SIZE};
use crate::ffi::specialize::{
    specialize_parameters, BoundState, Specializer, TypeEnv, TypeParam, TypeParamId,
};
use crate::value::{DataType, Value, ValueId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, trace};

/// Writes the stub for one trampoline into its slot
///
/// Runs under the registry lock; it must not call back into the cache.
pub type StubInitializer = fn(&mut SlotMemory<'_>, &BoundState);

static NEXT_CELL: AtomicU64 = AtomicU64::new(1);
static NO_ENV: TypeEnv = TypeEnv::empty();

/// Per-call-site cache identity
///
/// The tables a cache keeps for this cell live until the cell is dropped.
pub struct CacheCell {
    id: u64,
    // Registries holding a table for this cell
    registries: Mutex<Vec<Weak<Mutex<Registry>>>>,
}

impl CacheCell {
    pub fn new() -> Self {
        Self {
            id: NEXT_CELL.fetch_add(1, Ordering::Relaxed),
            registries: Mutex::new(Vec::new()),
        }
    }

    /// Called with the registry locked, when its table for this cell is made
    fn attach(&self, registry: &Arc<Mutex<Registry>>) {
        self.registries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(registry));
    }
}

impl Drop for CacheCell {
    fn drop(&mut self) {
        let registries = std::mem::take(
            self.registries
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for registry in registries.iter().filter_map(Weak::upgrade) {
            let table = lock(&registry).cells.remove(&self.id);
            // Permanent objects in the table may run their reclaimer here
            drop(table);
        }
    }
}

impl fmt::Debug for CacheCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheCell").field("id", &self.id).finish()
    }
}

impl Default for CacheCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Declared result type of a trampoline-producing call site
#[derive(Debug, Clone)]
pub enum ResultType {
    /// Plain code pointer; the wrapper is never handed to managed code
    VoidPointer,
    Type(Arc<DataType>),
}

impl ResultType {
    pub fn is_void_pointer(&self) -> bool {
        matches!(self, ResultType::VoidPointer)
    }
}

/// Arguments of [`TrampolineCache::get_or_create`]
pub struct TrampolineRequest<'a> {
    pub bound: Value,
    pub result_type: ResultType,
    pub cell: &'a CacheCell,
    pub template: &'a [TypeParam],
    pub init_stub: StubInitializer,
    pub env: &'a TypeEnv,
    pub env_values: &'a [Value],
}

impl<'a> TrampolineRequest<'a> {
    /// Request without type parameters
    pub fn new(
        bound: Value,
        result_type: ResultType,
        cell: &'a CacheCell,
        init_stub: StubInitializer,
    ) -> Self {
        Self {
            bound,
            result_type,
            cell,
            template: &[],
            init_stub,
            env: &NO_ENV,
            env_values: &[],
        }
    }

    pub fn with_parameters(
        mut self,
        template: &'a [TypeParam],
        env: &'a TypeEnv,
        env_values: &'a [Value],
    ) -> Self {
        self.template = template;
        self.env = env;
        self.env_values = env_values;
        self
    }
}

/// Template shape plus identities of the environment values; selects an
/// inner table
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ParamKey {
    template: Vec<TypeParamId>,
    env: Vec<ValueId>,
}

#[derive(Debug, Clone)]
struct CacheKey {
    cell: u64,
    params: Option<ParamKey>,
    bound: ValueId,
}

impl CacheKey {
    fn for_request(request: &TrampolineRequest<'_>) -> Self {
        let params = (!request.template.is_empty()).then(|| ParamKey {
            template: request.template.iter().map(TypeParam::id).collect(),
            env: request.env_values.iter().map(Value::id).collect(),
        });
        Self {
            cell: request.cell.id,
            params,
            bound: request.bound.id(),
        }
    }
}

enum Entry {
    Permanent(Arc<TrampolineObject>),
    Collectable(Weak<TrampolineObject>),
}

impl Entry {
    fn upgrade(&self) -> Option<Arc<TrampolineObject>> {
        match self {
            Entry::Permanent(object) => Some(Arc::clone(object)),
            Entry::Collectable(weak) => weak.upgrade(),
        }
    }

    fn refers_to(&self, object: *const TrampolineObject) -> bool {
        match self {
            Entry::Permanent(strong) => std::ptr::eq(Arc::as_ptr(strong), object),
            Entry::Collectable(weak) => std::ptr::eq(weak.as_ptr(), object),
        }
    }

    fn is_live(&self) -> bool {
        match self {
            Entry::Permanent(_) => true,
            Entry::Collectable(weak) => weak.strong_count() > 0,
        }
    }
}

type EntryMap = HashMap<ValueId, Entry>;

struct ParamCache {
    // Holds the values whose identities form the key so their addresses
    // cannot be reused while the table exists
    _template: Vec<TypeParam>,
    _env_values: Vec<Value>,
    entries: EntryMap,
}

#[derive(Default)]
struct CellCache {
    direct: EntryMap,
    parameterized: HashMap<ParamKey, ParamCache>,
}

struct Registry {
    allocator: SlotAllocator,
    cells: HashMap<u64, CellCache>,
    created: usize,
    reclaimed: usize,
    discarded: usize,
}

impl Registry {
    /// Table for `key`, creating the cell and inner table on first use
    fn entries_mut(&mut self, key: &CacheKey, site: &SiteParams<'_>) -> &mut EntryMap {
        let cell = self.cells.entry(key.cell).or_default();
        match &key.params {
            None => &mut cell.direct,
            Some(params) => {
                &mut cell
                    .parameterized
                    .entry(params.clone())
                    .or_insert_with(|| ParamCache {
                        _template: site.template.to_vec(),
                        _env_values: site.env_values.to_vec(),
                        entries: EntryMap::new(),
                    })
                    .entries
            }
        }
    }

    fn existing_entries_mut(&mut self, key: &CacheKey) -> Option<&mut EntryMap> {
        let cell = self.cells.get_mut(&key.cell)?;
        match &key.params {
            None => Some(&mut cell.direct),
            Some(params) => cell.parameterized.get_mut(params).map(|p| &mut p.entries),
        }
    }

    fn live(&mut self, key: &CacheKey, site: &SiteParams<'_>) -> Option<Arc<TrampolineObject>> {
        self.entries_mut(key, site)
            .get(&key.bound)
            .and_then(Entry::upgrade)
    }

    fn cached_entries(&self) -> usize {
        self.cells
            .values()
            .flat_map(|cell| {
                std::iter::once(&cell.direct)
                    .chain(cell.parameterized.values().map(|p| &p.entries))
            })
            .flat_map(|entries| entries.values())
            .filter(|entry| entry.is_live())
            .count()
    }
}

/// Template and environment values of a request, kept by a new inner table
struct SiteParams<'a> {
    template: &'a [TypeParam],
    env_values: &'a [Value],
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Back-reference from an object to its cache entry
struct ReclaimHandle {
    registry: Weak<Mutex<Registry>>,
    key: CacheKey,
}

struct TrampolineObject {
    slot: Option<SlotId>,
    code: usize,
    result_type: ResultType,
    permanent: bool,
    state: Box<BoundState>,
    reclaim: Option<ReclaimHandle>,
}

impl Drop for TrampolineObject {
    /// The reclaimer. Frees the slot and removes the cache entry if it still
    /// refers to this object; the bound state goes with the object after the
    /// lock is released.
    fn drop(&mut self) {
        let Some(reclaim) = self.reclaim.take() else {
            return;
        };
        let Some(registry) = reclaim.registry.upgrade() else {
            return;
        };
        let this: *const TrampolineObject = self;

        let mut guard = lock(&registry);
        if let Some(slot) = self.slot.take() {
            guard.allocator.release(slot);
        }
        let removed = guard.existing_entries_mut(&reclaim.key).and_then(|entries| {
            if entries.get(&reclaim.key.bound)?.refers_to(this) {
                entries.remove(&reclaim.key.bound)
            } else {
                None
            }
        });
        guard.reclaimed += 1;
        drop(guard);

        trace!(
            target: "tether::ffi",
            bound = ?self.state.bound(),
            entry_removed = removed.is_some(),
            "reclaimed trampoline"
        );
    }
}

/// Handle to a cached trampoline
///
/// Clones share one object. Keeps the executable pages mapped for as long as
/// it exists.
#[derive(Clone)]
pub struct Trampoline {
    // Dropped before `registry` so the reclaimer can still reach it
    object: Arc<TrampolineObject>,
    registry: Arc<Mutex<Registry>>,
}

impl Trampoline {
    /// Entry address of the generated stub
    pub fn code_ptr(&self) -> *const u8 {
        self.object.code as *const u8
    }

    pub fn bound_value(&self) -> &Value {
        self.object.state.bound()
    }

    pub fn bound_state(&self) -> &BoundState {
        &self.object.state
    }

    pub fn result_type(&self) -> &ResultType {
        &self.object.result_type
    }

    pub fn is_permanent(&self) -> bool {
        self.object.permanent
    }

    pub fn ptr_eq(a: &Trampoline, b: &Trampoline) -> bool {
        Arc::ptr_eq(&a.object, &b.object)
    }
}

impl fmt::Debug for Trampoline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trampoline")
            .field("code", &self.code_ptr())
            .field("bound", self.bound_value())
            .field("permanent", &self.is_permanent())
            .finish()
    }
}

/// Snapshot of registry counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrampolineStats {
    pub pages_mapped: usize,
    pub free_slots: usize,
    pub slots_in_use: usize,
    /// Entries whose object is still alive
    pub cached_entries: usize,
    /// Cells with a table in this cache
    pub cell_tables: usize,
    pub created: usize,
    pub reclaimed: usize,
    /// Objects built concurrently for a key that another thread filled first
    pub discarded: usize,
}

/// Registry of trampolines plus the slot allocator backing them
pub struct TrampolineCache {
    registry: Arc<Mutex<Registry>>,
    specializer: Arc<dyn Specializer>,
}

impl TrampolineCache {
    pub fn new(pages: Box<dyn PageMapper>, specializer: Arc<dyn Specializer>) -> Self {
        let registry = Registry {
            allocator: SlotAllocator::new(pages),
            cells: HashMap::new(),
            created: 0,
            reclaimed: 0,
            discarded: 0,
        };
        Self {
            registry: Arc::new(Mutex::new(registry)),
            specializer,
        }
    }

    /// Map executable pages ahead of the first trampoline
    pub fn reserve_pages(&self, count: usize) -> FfiResult<()> {
        lock(&self.registry).allocator.reserve_pages(count)
    }

    /// Return the live trampoline for this call site, bound value and
    /// environment, or build, cache and return a new one
    pub fn get_or_create(&self, request: TrampolineRequest<'_>) -> FfiResult<Trampoline> {
        let key = CacheKey::for_request(&request);
        let site = SiteParams {
            template: request.template,
            env_values: request.env_values,
        };

        let mut registry = lock(&self.registry);
        if !registry.cells.contains_key(&key.cell) {
            request.cell.attach(&self.registry);
        }
        if let Some(object) = registry.live(&key, &site) {
            drop(registry);
            trace!(target: "tether::ffi", bound = ?request.bound, "trampoline cache hit");
            return Ok(self.handle(object));
        }
        drop(registry);

        let parameters = match specialize_parameters(
            self.specializer.as_ref(),
            request.template,
            request.env,
            request.env_values,
        ) {
            Ok(parameters) => parameters,
            Err(error) => {
                debug!(target: "tether::ffi", bound = ?request.bound, %error, "trampoline specialization failed");
                return Err(error);
            }
        };
        let permanent =
            request.result_type.is_void_pointer() || request.bound.is_type_level_singleton();
        let state = Box::new(BoundState::new(request.bound.clone(), parameters));

        let mut registry = lock(&self.registry);
        if let Some(winner) = registry.live(&key, &site) {
            registry.discarded += 1;
            drop(registry);
            debug!(target: "tether::ffi", bound = ?request.bound, "discarded concurrently built trampoline");
            return Ok(self.handle(winner));
        }

        let slot = registry.allocator.allocate()?;
        let code = match registry.allocator.slot_memory(slot) {
            Some(mut memory) => {
                (request.init_stub)(&mut memory, &state);
                memory.address() as usize
            }
            None => {
                registry.allocator.release(slot);
                return Err(FfiError::OutOfMemory {
                    requested: TRAMPOLINE_SLOT_SIZE,
                });
            }
        };
        // Permanent objects only reach their reclaimer once their cell is gone
        let reclaim = Some(ReclaimHandle {
            registry: Arc::downgrade(&self.registry),
            key: key.clone(),
        });
        let object = Arc::new(TrampolineObject {
            slot: Some(slot),
            code,
            result_type: request.result_type,
            permanent,
            state,
            reclaim,
        });
        let entry = if permanent {
            Entry::Permanent(Arc::clone(&object))
        } else {
            Entry::Collectable(Arc::downgrade(&object))
        };
        let stale = registry
            .entries_mut(&key, &site)
            .insert(key.bound.clone(), entry);
        registry.created += 1;
        drop(registry);
        drop(stale);

        debug!(
            target: "tether::ffi",
            bound = ?object.state.bound(),
            permanent,
            code,
            "created trampoline"
        );
        Ok(self.handle(object))
    }

    pub fn stats(&self) -> TrampolineStats {
        let registry = lock(&self.registry);
        TrampolineStats {
            pages_mapped: registry.allocator.pages_mapped(),
            free_slots: registry.allocator.free_slots(),
            slots_in_use: registry.allocator.slots_in_use(),
            cached_entries: registry.cached_entries(),
            cell_tables: registry.cells.len(),
            created: registry.created,
            reclaimed: registry.reclaimed,
            discarded: registry.discarded,
        }
    }

    fn handle(&self, object: Arc<TrampolineObject>) -> Trampoline {
        Trampoline {
            object,
            registry: Arc::clone(&self.registry),
        }
    }
}

impl fmt::Debug for TrampolineCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrampolineCache")
            .field("stats", &self.stats())
            .finish()
    }
}
