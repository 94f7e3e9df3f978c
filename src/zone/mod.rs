//! Zones: the heap partitions at which collection decisions are made.
//!
//! A zone owns its shapes, scripts, object groups, a unique-id table, a weak
//! cache list, and a bitmap of the atoms it references. Zones are grouped
//! into [zone groups](group/index.html), the exclusive-access domains a
//! cooperating thread must enter before touching any cell the group owns.

pub mod compartment;
pub mod group;
pub mod sweep_groups;

pub use self::compartment::Compartment;
pub use self::group::ZoneGroup;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use atomic::Atomic;
use bytemuck::NoUninit;

use crate::cell::CellRef;
use crate::heap::{HeapAccounting, ZoneHeap};
use crate::mark::weak::WeakMapHandle;

/// The collection state of a zone.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, NoUninit)]
pub enum ZoneState {
    /// Not being collected.
    NoGc,
    /// Roots and reachable cells are being marked.
    Mark,
    /// The zone's sweep group has been reached; dead cells are being swept.
    Sweep,
    /// Swept; waiting for the rest of the collection to finish.
    Finished,
    /// Selected cells are being relocated and references rewritten.
    Compact,
}

/// A zone's table of stable cell identities. Entries are rekeyed before a
/// relocated cell's new address is published, and dead entries are dropped
/// before the zone's cells are finalized, so no table key ever dangles.
pub struct UniqueIdTable {
    map: HashMap<CellRef, u64>,
    next: u64,
}

impl UniqueIdTable {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            next: 1,
        }
    }

    /// The cell's unique id, assigning one if needed. The caller sets the
    /// header's uid flag.
    pub fn get_or_create(&mut self, cell: CellRef) -> u64 {
        let next = &mut self.next;
        *self.map.entry(cell).or_insert_with(|| {
            let id = *next;
            *next += 1;
            id
        })
    }

    pub fn get(&self, cell: CellRef) -> Option<u64> {
        self.map.get(&cell).copied()
    }

    /// Move an entry to a relocated cell's new address.
    pub fn rekey(&mut self, from: CellRef, to: CellRef) {
        if let Some(id) = self.map.remove(&from) {
            self.map.insert(to, id);
        }
    }

    /// Drop entries whose cells died. Runs before the zone sweeps its cells.
    pub fn sweep(&mut self, is_live: impl Fn(CellRef) -> bool) {
        self.map.retain(|cell, _| is_live(*cell));
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// A bitmap naming the atoms a zone references. Atom survival is decided by
/// the union of live zones' bitmaps.
#[derive(Default)]
pub struct AtomBitmap {
    words: Vec<usize>,
}

const WORD_BITS: usize = usize::BITS as usize;

impl AtomBitmap {
    pub fn set(&mut self, index: usize) {
        let word = index / WORD_BITS;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (index % WORD_BITS);
    }

    pub fn get(&self, index: usize) -> bool {
        self.words
            .get(index / WORD_BITS)
            .map_or(false, |w| w & (1 << (index % WORD_BITS)) != 0)
    }

    pub fn union(&mut self, other: &AtomBitmap) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (dst, src) in self.words.iter_mut().zip(other.words.iter()) {
            *dst |= *src;
        }
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }
}

/// A weak cache registered with a zone. Swept when the zone is swept: the
/// cache drops every entry whose key is no longer live.
pub trait WeakCache: Send {
    fn sweep(&mut self, is_live: &dyn Fn(CellRef) -> bool);
}

/// A heap partition that is the unit of independent collection.
pub struct Zone {
    id: usize,
    is_atoms: bool,
    state: Atomic<ZoneState>,
    /// Is the pre-barrier active for writes into this zone? Set while the
    /// zone is marking and the collector is between slices.
    needs_barrier: AtomicBool,
    /// Scheduled for the current (or next) collection.
    scheduled: AtomicBool,
    /// Index of the sweep group this zone landed in, once computed.
    sweep_group_index: AtomicUsize,
    /// The owning zone group, set when the zone is attached. Zones are
    /// created attached and never migrate.
    group: AtomicUsize,
    /// The tenured heap.
    pub heap: ZoneHeap,
    /// Byte accounting driving the GC trigger.
    pub accounting: HeapAccounting,
    /// Collection trigger threshold in bytes; grown after each collection.
    threshold: AtomicUsize,
    compartments: Mutex<Vec<Arc<Compartment>>>,
    /// The atoms this zone references, by atom index.
    pub atom_bitmap: Mutex<AtomBitmap>,
    /// Stable cell identities.
    pub unique_ids: Mutex<UniqueIdTable>,
    /// The zone's weak maps, traced in weak-marking mode and swept with the
    /// zone.
    pub weak_maps: Mutex<Vec<WeakMapHandle>>,
    /// Weak caches swept when the zone is swept.
    pub weak_caches: Mutex<Vec<Box<dyn WeakCache>>>,
}

unsafe impl Sync for Zone {}
unsafe impl Send for Zone {}

/// The default allocation threshold before a zone asks for a collection.
pub const INITIAL_GC_THRESHOLD_BYTES: usize = 1 << 20;

impl Zone {
    pub(crate) fn new(id: usize, is_atoms: bool) -> Arc<Zone> {
        Arc::new(Zone {
            id,
            is_atoms,
            state: Atomic::new(ZoneState::NoGc),
            needs_barrier: AtomicBool::new(false),
            scheduled: AtomicBool::new(false),
            sweep_group_index: AtomicUsize::new(usize::MAX),
            group: AtomicUsize::new(0),
            heap: ZoneHeap::new(),
            accounting: HeapAccounting::new(),
            threshold: AtomicUsize::new(INITIAL_GC_THRESHOLD_BYTES),
            compartments: Mutex::new(Vec::new()),
            atom_bitmap: Mutex::new(AtomBitmap::default()),
            unique_ids: Mutex::new(UniqueIdTable::new()),
            weak_maps: Mutex::new(Vec::new()),
            weak_caches: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Is this the runtime-wide atoms zone?
    pub fn is_atoms_zone(&self) -> bool {
        self.is_atoms
    }

    pub fn state(&self) -> ZoneState {
        self.state.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&self, state: ZoneState) {
        trace!("zone {} -> {:?}", self.id, state);
        self.state.store(state, Ordering::Release);
    }

    /// Is this zone part of the collection currently in progress?
    pub fn is_collecting(&self) -> bool {
        self.state() != ZoneState::NoGc
    }

    /// Is this zone marking (so the snapshot pre-barrier applies)?
    pub fn is_marking(&self) -> bool {
        self.state() == ZoneState::Mark
    }

    pub fn is_sweeping(&self) -> bool {
        self.state() == ZoneState::Sweep
    }

    /// Should writes into this zone run the pre-barrier right now?
    pub fn needs_pre_barrier(&self) -> bool {
        self.needs_barrier.load(Ordering::Acquire)
    }

    pub(crate) fn set_needs_barrier(&self, value: bool) {
        self.needs_barrier.store(value, Ordering::Release);
    }

    pub(crate) fn schedule(&self, scheduled: bool) {
        self.scheduled.store(scheduled, Ordering::Release);
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    pub(crate) fn set_sweep_group_index(&self, index: usize) {
        self.sweep_group_index.store(index, Ordering::Release);
    }

    pub fn sweep_group_index(&self) -> usize {
        self.sweep_group_index.load(Ordering::Acquire)
    }

    pub(crate) fn attach_to_group(&self, group: *const ZoneGroup) {
        self.group.store(group as usize, Ordering::Release);
    }

    /// The owning zone group.
    pub fn group(&self) -> &ZoneGroup {
        let raw = self.group.load(Ordering::Acquire);
        assert!(raw != 0, "zone {} is not attached to a group", self.id);
        unsafe { &*(raw as *const ZoneGroup) }
    }

    /// The zone's compartments.
    pub fn compartments(&self) -> Vec<Arc<Compartment>> {
        self.compartments.lock().unwrap().clone()
    }

    pub(crate) fn add_compartment(&self, compartment: Arc<Compartment>) {
        self.compartments.lock().unwrap().push(compartment);
    }

    /// The current collection trigger threshold.
    pub fn gc_threshold_bytes(&self) -> usize {
        self.threshold.load(Ordering::Relaxed)
    }

    /// Has allocation passed the threshold that should start a collection?
    pub fn should_trigger_gc(&self) -> bool {
        self.accounting.allocated_bytes() >= self.gc_threshold_bytes()
    }

    /// Grow the trigger threshold after a collection, from the surviving
    /// heap size and the configured growth factor.
    pub(crate) fn update_gc_threshold(&self, growth_factor: f64, floor: usize) {
        let live = self.accounting.allocated_bytes();
        let next = ((live as f64 * growth_factor) as usize).max(floor);
        self.threshold.store(next, Ordering::Relaxed);
        debug!(
            "zone {}: live {} bytes, next trigger at {} bytes",
            self.id, live, next
        );
    }

    /// Register a weak cache to be swept with this zone.
    pub fn register_weak_cache(&self, cache: Box<dyn WeakCache>) {
        self.weak_caches.lock().unwrap().push(cache);
    }
}

impl std::fmt::Debug for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Zone")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("atoms", &self.is_atoms)
            .finish()
    }
}
