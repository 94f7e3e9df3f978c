//! The runtime instance: zone groups, the atoms zone, the driver, the
//! background helper, and the registration surfaces for roots, callbacks,
//! and finalizers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::budget::SliceBudget;
use crate::cell::{layout, AllocKind, CellRef};
use crate::driver::{GcDriver, GcReason, GcState, ResetReason};
use crate::global_state::{GlobalState, HeapBusyGuard};
use crate::heap::RegionPool;
use crate::mark::weak::WeakMapHandle;
use crate::mark::Marker;
use crate::roots::{RootSet, StackRoots};
use crate::sweep::{FinalizePhase, FinalizerHooks, HelperThread};
use crate::util::options::Options;
use crate::zeal::{ZealMode, ZealSpec, ZealState};
use crate::zone::{Compartment, Zone, ZoneGroup};

/// Default work units per incremental slice started by internal triggers.
const DEFAULT_SLICE_WORK: usize = 20_000;

/// Progress notifications delivered to `on_gc_slice` callbacks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GcProgress {
    CycleBegin,
    SliceBegin,
    SliceEnd,
    CycleEnd,
}

/// Where a new compartment should live.
pub enum ZoneSpec {
    /// The system zone.
    System,
    /// An existing zone.
    Existing(Arc<Zone>),
    /// A fresh zone in a fresh zone group.
    NewZoneInNewGroup,
    /// A fresh zone in the system zone group.
    NewZoneInSystemGroup,
    /// A fresh zone in the given group.
    NewZoneInExistingGroup(Arc<ZoneGroup>),
}

type GcSliceCallback = Box<dyn Fn(GcProgress, GcReason) + Send + Sync>;
type FinalizeCallback = Box<dyn Fn(FinalizePhase) + Send + Sync>;
type WeakPointerZoneCallback = Box<dyn Fn(&[Arc<Zone>]) + Send + Sync>;
type OomCallback = Box<dyn Fn(AllocKind) + Send + Sync>;

#[derive(Default)]
struct GcCallbacks {
    gc_slice: Mutex<Vec<GcSliceCallback>>,
    finalize: Mutex<Vec<FinalizeCallback>>,
    weak_pointer_zone: Mutex<Vec<WeakPointerZoneCallback>>,
    oom: Mutex<Option<OomCallback>>,
}

/// Builder for a runtime: set options first, then `build()`.
pub struct RuntimeBuilder {
    /// The options for this instance.
    pub options: Options,
}

impl RuntimeBuilder {
    /// A builder with options read from `TEPHRA_`-prefixed environment
    /// variables on top of the built-in defaults.
    pub fn new() -> Self {
        let mut builder = Self::new_no_env_vars();
        builder.options.apply_env_vars();
        builder
    }

    /// A builder with built-in defaults only.
    pub fn new_no_env_vars() -> Self {
        RuntimeBuilder {
            options: Options::default(),
        }
    }

    /// Set a single option, e.g. `set_option("nursery_bytes", "65536")`.
    pub fn set_option(
        &mut self,
        name: &str,
        val: &str,
    ) -> Result<(), crate::util::options::OptionError> {
        self.options.set(name, val)
    }

    /// Build the runtime. The returned box must stay where it is: interior
    /// structures keep pointers to it.
    pub fn build(self) -> Box<GcRuntime> {
        GcRuntime::new(self.options)
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A collector runtime instance.
pub struct GcRuntime {
    options: Arc<Options>,
    state: Arc<GlobalState>,
    roots: RootSet,
    driver: GcDriver,
    region_pool: Arc<RegionPool>,
    groups: Mutex<Vec<Arc<ZoneGroup>>>,
    atoms_zone: Arc<Zone>,
    /// Interned atoms: text -> atom cell. Doubles as the exclusive-access
    /// lock for the atoms zone.
    atom_table: Mutex<HashMap<Vec<u8>, CellRef>>,
    next_atom_index: AtomicUsize,
    /// Atoms that live for the whole runtime; marking skips them.
    permanent_atoms: Mutex<Vec<CellRef>>,
    well_known_symbols: Mutex<Vec<CellRef>>,
    finalizer_hooks: Arc<FinalizerHooks>,
    helper: HelperThread,
    zeal: ZealState,
    callbacks: GcCallbacks,
    next_zone_id: AtomicUsize,
}

unsafe impl Sync for GcRuntime {}
unsafe impl Send for GcRuntime {}

impl GcRuntime {
    fn new(options: Options) -> Box<GcRuntime> {
        crate::util::logger::try_init();
        let options = Arc::new(options);
        let region_pool = Arc::new(RegionPool::new());
        let finalizer_hooks = FinalizerHooks::new();
        let helper_threads = (num_cpus::get() / 4).max(1);
        let helper = HelperThread::new(helper_threads, region_pool.clone(), finalizer_hooks.clone());
        let atoms_zone = Zone::new(0, true);
        let zeal = ZealState::new(options.zeal.clone());

        let runtime = Box::new(GcRuntime {
            driver: GcDriver::new(options.mark_stack_limit),
            zeal,
            options,
            state: Arc::new(GlobalState::new()),
            roots: RootSet::new(),
            region_pool,
            groups: Mutex::new(Vec::new()),
            atoms_zone,
            atom_table: Mutex::new(HashMap::new()),
            next_atom_index: AtomicUsize::new(0),
            permanent_atoms: Mutex::new(Vec::new()),
            well_known_symbols: Mutex::new(Vec::new()),
            finalizer_hooks,
            helper,
            callbacks: GcCallbacks::default(),
            next_zone_id: AtomicUsize::new(1),
        });

        // The system group and zone exist from the start.
        runtime.new_zone_group();
        runtime
            .state
            .initialized
            .store(true, Ordering::SeqCst);
        info!("tephra runtime initialized");
        runtime
    }

    /// The runtime options.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The global state and statistics counters.
    pub fn state(&self) -> &GlobalState {
        &self.state
    }

    /// The root registries.
    pub fn roots(&self) -> &RootSet {
        &self.roots
    }

    /// The incremental driver.
    pub fn driver(&self) -> &GcDriver {
        &self.driver
    }

    pub(crate) fn region_pool(&self) -> &RegionPool {
        &self.region_pool
    }

    pub(crate) fn helper(&self) -> &HelperThread {
        &self.helper
    }

    pub(crate) fn finalizer_hooks(&self) -> &FinalizerHooks {
        &self.finalizer_hooks
    }

    /// Per-kind host finalizer hooks.
    pub fn set_finalizer_hook(&self, kind: AllocKind, hook: Arc<dyn Fn(CellRef) + Send + Sync>) {
        self.finalizer_hooks.set(kind, hook);
    }

    /// The zeal state.
    pub fn zeal(&self) -> &ZealState {
        &self.zeal
    }

    /// The runtime-wide atoms zone.
    pub fn atoms_zone(&self) -> Arc<Zone> {
        self.atoms_zone.clone()
    }

    /// Every zone: the groups' zones plus the atoms zone.
    pub fn all_zones(&self) -> Vec<Arc<Zone>> {
        let mut zones = vec![self.atoms_zone.clone()];
        for group in self.groups.lock().unwrap().iter() {
            zones.extend(group.zones());
        }
        zones
    }

    /// The zone groups.
    pub fn groups(&self) -> Vec<Arc<ZoneGroup>> {
        self.groups.lock().unwrap().clone()
    }

    /// The system (first) zone group.
    pub fn system_group(&self) -> Arc<ZoneGroup> {
        self.groups.lock().unwrap()[0].clone()
    }

    /// The system zone.
    pub fn system_zone(&self) -> Arc<Zone> {
        self.system_group().zones()[0].clone()
    }

    /// Create a fresh zone group with one zone and one compartment.
    pub fn new_zone_group(&self) -> Arc<ZoneGroup> {
        let group = ZoneGroup::new(self.options.nursery_bytes, self.options.generational);
        group.set_runtime(self as *const GcRuntime);
        let zone = self.new_zone_in(&group);
        Compartment::new(&zone);
        self.groups.lock().unwrap().push(group.clone());
        group
    }

    fn new_zone_in(&self, group: &Arc<ZoneGroup>) -> Arc<Zone> {
        let id = self.next_zone_id.fetch_add(1, Ordering::Relaxed);
        let zone = Zone::new(id, false);
        group.add_zone(zone.clone());
        zone
    }

    /// Create or attach a compartment per the zone spec. Returns the group,
    /// zone, and compartment.
    pub fn new_compartment(
        &self,
        spec: ZoneSpec,
    ) -> (Arc<ZoneGroup>, Arc<Zone>, Arc<Compartment>) {
        match spec {
            ZoneSpec::System => {
                let group = self.system_group();
                let zone = self.system_zone();
                let compartment = Compartment::new(&zone);
                (group, zone, compartment)
            }
            ZoneSpec::Existing(zone) => {
                let group_id = zone.group().id();
                let group = self
                    .groups
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|g| g.id() == group_id)
                    .expect("zone belongs to an unknown group")
                    .clone();
                let compartment = Compartment::new(&zone);
                (group, zone, compartment)
            }
            ZoneSpec::NewZoneInNewGroup => {
                let group = self.new_zone_group();
                let zone = group.zones().pop().unwrap();
                let compartment = zone.compartments().pop().unwrap();
                (group, zone, compartment)
            }
            ZoneSpec::NewZoneInSystemGroup => {
                let group = self.system_group();
                let zone = self.new_zone_in(&group);
                let compartment = Compartment::new(&zone);
                (group, zone, compartment)
            }
            ZoneSpec::NewZoneInExistingGroup(group) => {
                let zone = self.new_zone_in(&group);
                let compartment = Compartment::new(&zone);
                (group, zone, compartment)
            }
        }
    }

    /// Bind a mutator to a group. The calling thread enters the group and
    /// stays inside it for the mutator's lifetime; drop the mutator on the
    /// same thread.
    pub fn bind_mutator(&self, group: Arc<ZoneGroup>) -> Box<Mutator> {
        group.enter();
        let zone = group.zones()[0].clone();
        let compartment = zone.compartments()[0].clone();
        let stack_roots = StackRoots::new();
        self.roots.register_stack_roots(&stack_roots);
        Box::new(Mutator {
            runtime: self as *const GcRuntime,
            group,
            current: Mutex::new((zone, compartment)),
            stack_roots,
        })
    }

    // ---- Collection entry points -------------------------------------------

    /// Run a full synchronous collection of the current thread's group (or
    /// the system group, if the thread is in none).
    pub fn gc(&self, reason: GcReason) {
        let group = self
            .current_thread_group()
            .unwrap_or_else(|| self.system_group());
        self.gc_group(group, reason);
    }

    /// Run a full synchronous collection of one group (plus the atoms zone).
    pub fn gc_group(&self, group: Arc<ZoneGroup>, reason: GcReason) {
        let _guard = crate::zone::group::GroupGuard::enter(&group);
        if self.zeal.has(ZealMode::Incremental) {
            // Zeal: force the collection through multiple bounded slices.
            self.driver.start(
                self,
                group.clone(),
                true,
                reason,
                SliceBudget::work(self.zeal.spec().frequency().max(64)),
            );
            while self.driver.is_active() {
                self.driver.slice(
                    self,
                    reason,
                    SliceBudget::work(self.zeal.spec().frequency().max(64)),
                );
            }
        } else {
            self.driver
                .start(self, group.clone(), true, reason, SliceBudget::unlimited());
            self.driver.finish(self, reason);
        }
    }

    /// Start an incremental collection, or advance the active one by one
    /// slice.
    pub fn start_or_slice(&self, group: Arc<ZoneGroup>, reason: GcReason, budget: SliceBudget) {
        let _guard = crate::zone::group::GroupGuard::enter(&group);
        if self.driver.is_active() {
            self.driver.slice(self, reason, budget);
        } else {
            self.driver.start(self, group.clone(), true, reason, budget);
        }
    }

    /// Advance the active collection by one slice.
    pub fn slice(&self, reason: GcReason, budget: SliceBudget) {
        self.driver.slice(self, reason, budget);
    }

    /// Finish the active collection synchronously.
    pub fn finish_gc(&self, reason: GcReason) {
        self.driver.finish(self, reason);
    }

    /// Abort the active collection.
    pub fn abort_gc(&self) {
        self.driver.abort(self);
    }

    /// Internal trigger: called by the allocator when a zone passes its
    /// threshold.
    pub(crate) fn maybe_gc(&self, reason: GcReason) {
        let Some(group) = self.current_thread_group() else {
            return;
        };
        if !self.options.incremental {
            self.gc_group(group, reason);
            return;
        }
        self.start_or_slice(group, reason, SliceBudget::work(DEFAULT_SLICE_WORK));
    }

    /// Evict the nursery of every group the current thread is inside.
    pub fn evict_nursery(&self, reason: GcReason) {
        if let Some(group) = self.current_thread_group() {
            self.evict_group(&group, reason);
        }
    }

    pub(crate) fn evict_group(&self, group: &Arc<ZoneGroup>, reason: GcReason) {
        if self.state.is_heap_busy() {
            // Already inside a collector phase that will handle the nursery.
            return;
        }
        let _busy = HeapBusyGuard::new(&self.state);
        if cfg!(feature = "verify_barriers") || self.zeal.has(ZealMode::VerifyPost) {
            crate::nursery::verify_store_buffer(group);
        }
        let stats = group.nursery.collect(self, group, reason);
        self.state.minor_gc_count.fetch_add(1, Ordering::Relaxed);
        self.state
            .bytes_promoted
            .fetch_add(stats.promoted_bytes, Ordering::Relaxed);
    }

    /// Reset an in-progress incremental collection because a zone is going
    /// away, then detach the zone from its group.
    pub fn schedule_zone_destruction(&self, zone: &Arc<Zone>) {
        if self.driver.is_active() {
            if matches!(self.driver.state(), GcState::Sweep | GcState::Finalize) {
                self.driver.finish(self, GcReason::Finish);
            } else {
                self.driver.reset(self, ResetReason::ZoneDestroyed);
            }
        }
        zone.group().remove_zone(zone.id());
    }

    fn current_thread_group(&self) -> Option<Arc<ZoneGroup>> {
        self.groups
            .lock()
            .unwrap()
            .iter()
            .find(|g| g.owned_by_current_thread())
            .cloned()
    }

    pub(crate) fn with_marker<R>(&self, f: impl FnOnce(&mut Marker) -> R) -> R {
        let mut marker = self.driver.marker.lock().unwrap();
        f(&mut marker)
    }

    pub(crate) fn should_compact(&self, is_full: bool) -> bool {
        if !self.options.compacting {
            return false;
        }
        if self.zeal.has(ZealMode::Compact) {
            return self.zeal.count_gc_for_compact();
        }
        is_full
    }

    pub(crate) fn zeal_alloc_tick(&self, _mutator: &Mutator) {
        if self.zeal.count_alloc() {
            debug!("zeal: allocation-triggered collection");
            self.gc(GcReason::Zeal);
        }
    }

    /// Install a zeal spec.
    pub fn set_zeal(&self, spec: ZealSpec) {
        self.zeal.set(spec);
    }

    /// Parse and install a zeal spec, e.g. `"alloc;compact,100"`.
    pub fn parse_and_set_zeal(&self, spec: &str) -> Result<(), crate::zeal::SetZealError> {
        self.zeal.set(spec.parse()?);
        Ok(())
    }

    // ---- Atoms -------------------------------------------------------------

    /// Intern an atom. The atom table lock doubles as the atoms-zone
    /// exclusive-access lock.
    pub fn intern_atom(&self, text: &[u8]) -> CellRef {
        let mut table = self.atom_table.lock().unwrap();
        if let Some(&atom) = table.get(text) {
            return atom;
        }
        let addr = self
            .atoms_zone
            .heap
            .alloc_cell(
                Arc::as_ptr(&self.atoms_zone),
                AllocKind::Atom,
                &self.region_pool,
            )
            .expect("out of memory interning an atom");
        let atom = unsafe { CellRef::from_address(addr) };
        atom.init_header(AllocKind::Atom, false);
        let index = self.next_atom_index.fetch_add(1, Ordering::Relaxed);
        layout::string::set_atom_index(atom, index);
        layout::string::init_linear(atom, text.to_vec().into_boxed_slice());
        self.atoms_zone.accounting.add(AllocKind::Atom.size());
        table.insert(text.to_vec(), atom);
        trace!("interned atom {} (index {})", atom, index);
        atom
    }

    /// Intern an atom on behalf of a mutator, recording it in the mutator's
    /// zone atom bitmap so it survives collections the zone is not part of.
    pub fn intern_atom_in(&self, mutator: &Mutator, text: &[u8]) -> CellRef {
        let atom = self.intern_atom(text);
        let zone = mutator.zone();
        zone.atom_bitmap
            .lock()
            .unwrap()
            .set(layout::string::atom_index(atom));
        atom
    }

    /// The number of interned atoms. Shrinks when full collections sweep
    /// dead atoms.
    pub fn atom_count(&self) -> usize {
        self.atom_table.lock().unwrap().len()
    }

    /// Reset an in-progress incremental collection (e.g. because a
    /// compartment was revived). Only meaningful during marking; the next
    /// collection starts fresh.
    pub fn reset_gc(&self, reason: ResetReason) {
        if matches!(self.driver.state(), GcState::MarkRoots | GcState::Mark) {
            self.driver.reset(self, reason);
        }
    }

    /// Intern a permanent atom: skipped by marking, never collected.
    pub fn intern_permanent_atom(&self, text: &[u8]) -> CellRef {
        let atom = self.intern_atom(text);
        atom.set_permanent();
        self.permanent_atoms.lock().unwrap().push(atom);
        atom
    }

    /// Create a well-known (permanent) symbol with the given description.
    pub fn new_well_known_symbol(&self, description: &[u8]) -> CellRef {
        let description = self.intern_permanent_atom(description);
        let addr = self
            .atoms_zone
            .heap
            .alloc_cell(
                Arc::as_ptr(&self.atoms_zone),
                AllocKind::Symbol,
                &self.region_pool,
            )
            .expect("out of memory creating a symbol");
        let symbol = unsafe { CellRef::from_address(addr) };
        symbol.init_header(AllocKind::Symbol, false);
        layout::symbol::set_description(symbol, Some(description));
        symbol.set_permanent();
        self.atoms_zone.accounting.add(AllocKind::Symbol.size());
        self.well_known_symbols.lock().unwrap().push(symbol);
        symbol
    }

    pub(crate) fn atom_table_entries(&self) -> Vec<(usize, CellRef)> {
        self.atom_table
            .lock()
            .unwrap()
            .values()
            .map(|&atom| (layout::string::atom_index(atom), atom))
            .collect()
    }

    pub(crate) fn sweep_atom_table(&self) {
        self.atom_table
            .lock()
            .unwrap()
            .retain(|_, atom| atom.is_permanent() || atom.is_marked_any());
    }

    /// Rewrite the atom table and the permanent sets after compaction moved
    /// cells of the atoms zone.
    pub(crate) fn fixup_atoms_after_compaction(&self, forward: impl Fn(CellRef) -> CellRef) {
        for atom in self.atom_table.lock().unwrap().values_mut() {
            *atom = forward(*atom);
        }
        for atom in self.permanent_atoms.lock().unwrap().iter_mut() {
            *atom = forward(*atom);
        }
        for symbol in self.well_known_symbols.lock().unwrap().iter_mut() {
            *symbol = forward(*symbol);
        }
    }

    /// A stable identity for a cell, assigned on first request and preserved
    /// across promotion and compaction.
    pub fn cell_uid(&self, cell: CellRef) -> u64 {
        let zone = if cell.is_tenured() {
            cell.zone()
        } else {
            crate::mark::compartment_of(cell)
                .expect("unique ids require a cell with a zone")
                .zone()
        };
        let id = zone.unique_ids.lock().unwrap().get_or_create(cell);
        cell.set_has_uid();
        id
    }

    // ---- Weak maps ---------------------------------------------------------

    /// Create a weak map owned by `owner`, registered with `owner`'s zone.
    pub fn new_weak_map(&self, owner: CellRef) -> WeakMapHandle {
        let zone = match crate::mark::compartment_of(owner) {
            Some(compartment) => compartment.zone(),
            None => panic!("weak map owner must be an object"),
        };
        let handle = WeakMapHandle::new(owner);
        zone.weak_maps.lock().unwrap().push(handle.clone());
        handle
    }

    // ---- Callbacks ---------------------------------------------------------

    /// Register a per-slice progress callback. Must not allocate or mutate
    /// GC state.
    pub fn add_gc_slice_callback(&self, callback: GcSliceCallback) {
        self.callbacks.gc_slice.lock().unwrap().push(callback);
    }

    /// Register a finalize-phase callback.
    pub fn add_finalize_callback(&self, callback: FinalizeCallback) {
        self.callbacks.finalize.lock().unwrap().push(callback);
    }

    /// Register a callback invoked with each sweep group's zones, so the
    /// host can drop its own weak pointers into them.
    pub fn add_weak_pointer_zone_callback(&self, callback: WeakPointerZoneCallback) {
        self.callbacks
            .weak_pointer_zone
            .lock()
            .unwrap()
            .push(callback);
    }

    /// Install the out-of-memory reporter.
    pub fn set_oom_callback(&self, callback: OomCallback) {
        *self.callbacks.oom.lock().unwrap() = Some(callback);
    }

    pub(crate) fn invoke_gc_callbacks(&self, progress: GcProgress, reason: GcReason) {
        for callback in self.callbacks.gc_slice.lock().unwrap().iter() {
            callback(progress, reason);
        }
    }

    pub(crate) fn invoke_finalize_callbacks(&self, phase: FinalizePhase) {
        for callback in self.callbacks.finalize.lock().unwrap().iter() {
            callback(phase);
        }
    }

    pub(crate) fn invoke_weak_pointer_callbacks(&self, zones: &[Arc<Zone>]) {
        for callback in self.callbacks.weak_pointer_zone.lock().unwrap().iter() {
            callback(zones);
        }
    }

    pub(crate) fn report_oom(&self, kind: AllocKind) {
        error!("out of memory allocating a {:?} cell", kind);
        if let Some(callback) = self.callbacks.oom.lock().unwrap().as_ref() {
            callback(kind);
        }
    }
}

impl Drop for GcRuntime {
    fn drop(&mut self) {
        // Make sure no background finalization is still touching regions.
        self.helper.wait_for_idle();
        info!(
            "tephra runtime torn down after {} major / {} minor collections",
            self.state.major_gc_number(),
            self.state.minor_gc_count()
        );
    }
}

/// A mutator bound to one zone group. Owns the thread's stack roots and the
/// current compartment. The owning thread is inside the group for the
/// mutator's whole lifetime.
pub struct Mutator {
    runtime: *const GcRuntime,
    group: Arc<ZoneGroup>,
    current: Mutex<(Arc<Zone>, Arc<Compartment>)>,
    stack_roots: Arc<StackRoots>,
}

impl Mutator {
    /// The owning runtime.
    pub fn runtime(&self) -> &GcRuntime {
        unsafe { &*self.runtime }
    }

    /// The zone group this mutator runs in.
    pub fn group(&self) -> &Arc<ZoneGroup> {
        &self.group
    }

    /// The current allocation zone.
    pub fn zone(&self) -> Arc<Zone> {
        self.current.lock().unwrap().0.clone()
    }

    /// The current compartment.
    pub fn compartment(&self) -> Arc<Compartment> {
        self.current.lock().unwrap().1.clone()
    }

    /// Switch this mutator into another compartment (of the same group).
    pub fn enter_compartment(&self, zone: Arc<Zone>, compartment: Arc<Compartment>) {
        debug_assert_eq!(zone.group().id(), self.group.id());
        *self.current.lock().unwrap() = (zone, compartment);
    }

    /// The thread's scope-bound stack roots.
    pub fn stack_roots(&self) -> &Arc<StackRoots> {
        &self.stack_roots
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.group.leave();
        self.runtime().roots().prune_dead_mutators();
    }
}
