//! The store buffer: a deduplicated remembered set of tenured-to-nursery
//! edges, consumed as the root set of the next minor collection.
//!
//! Entries are keyed by slot (or cell) identity, so re-recording the same
//! write is idempotent. The buffer is written by one mutator thread (the one
//! holding the zone group) and drained by the same thread at minor-GC start;
//! the locks exist for the verifier, which reads from outside the group.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::cell::{forwarding, CellRef};
use crate::trace::{Edge, Tracer};
use crate::util::Address;

/// An object with tenured-to-nursery edges that cannot be described by a
/// single slot address; the minor collector calls back into it to visit
/// them.
pub trait BufferableRef: Send {
    fn trace(&self, tracer: &mut dyn Tracer);
}

/// Past this many slot entries the next write triggers an immediate minor
/// collection instead of growing the buffer further.
const OVERFLOW_ENTRIES: usize = 8192;

/// The remembered set for one zone group.
pub struct StoreBuffer {
    enabled: AtomicBool,
    /// Tenured slots holding a bare cell edge into the nursery.
    cell_slots: Mutex<HashSet<Address>>,
    /// Tenured slots holding a tagged value referencing the nursery.
    value_slots: Mutex<HashSet<Address>>,
    /// Tenured cells with too many nursery edges to record slot by slot;
    /// the whole cell is re-traced at minor GC.
    whole_cells: Mutex<HashSet<CellRef>>,
    /// Generic entries that trace themselves.
    generics: Mutex<Vec<Box<dyn BufferableRef>>>,
}

impl StoreBuffer {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            cell_slots: Mutex::new(HashSet::new()),
            value_slots: Mutex::new(HashSet::new()),
            whole_cells: Mutex::new(HashSet::new()),
            generics: Mutex::new(Vec::new()),
        }
    }

    /// Is the buffer recording? Disabled when generational collection is
    /// configured off; every allocation is tenured then and there is nothing
    /// to remember.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Record a tenured slot holding a bare cell edge into the nursery.
    pub fn put_cell_slot(&self, slot: Address) {
        if self.is_enabled() {
            self.cell_slots.lock().unwrap().insert(slot);
        }
    }

    /// Record a tenured slot holding a tagged value referencing the nursery.
    pub fn put_value_slot(&self, slot: Address) {
        if self.is_enabled() {
            self.value_slots.lock().unwrap().insert(slot);
        }
    }

    /// Record a whole tenured cell whose slots should be re-traced.
    pub fn put_whole_cell(&self, cell: CellRef) {
        debug_assert!(cell.is_tenured());
        if self.is_enabled() {
            self.whole_cells.lock().unwrap().insert(cell);
        }
    }

    /// Record a generic self-tracing entry.
    pub fn put_generic(&self, entry: Box<dyn BufferableRef>) {
        if self.is_enabled() {
            self.generics.lock().unwrap().push(entry);
        }
    }

    /// Should the mutator run a minor collection now rather than keep
    /// growing the buffer?
    pub fn is_about_to_overflow(&self) -> bool {
        self.cell_slots.lock().unwrap().len() + self.value_slots.lock().unwrap().len()
            >= OVERFLOW_ENTRIES
    }

    /// Visit every entry with the given tracer and clear the buffer. Slot
    /// entries whose referent is no longer in the nursery (the slot was
    /// overwritten since it was recorded) are skipped.
    pub fn drain(&self, tracer: &mut dyn Tracer) {
        let cell_slots: Vec<Address> = self.cell_slots.lock().unwrap().drain().collect();
        for slot in cell_slots {
            self.drain_slot(Edge::Cell(slot), "storeBufferSlot", tracer);
        }
        let value_slots: Vec<Address> = self.value_slots.lock().unwrap().drain().collect();
        for slot in value_slots {
            self.drain_slot(Edge::Value(slot), "storeBufferValue", tracer);
        }
        let whole_cells: Vec<CellRef> = self.whole_cells.lock().unwrap().drain().collect();
        for cell in whole_cells {
            crate::trace::trace_children(cell, tracer);
        }
        let generics: Vec<Box<dyn BufferableRef>> =
            std::mem::take(&mut *self.generics.lock().unwrap());
        for entry in &generics {
            entry.trace(tracer);
        }
    }

    fn drain_slot(&self, edge: Edge, name: &'static str, tracer: &mut dyn Tracer) {
        let Some(target) = edge.load() else { return };
        // Already-promoted referents leave a forwarding overlay where the
        // header was; resolve through it before reading the nursery bit.
        let resolved = forwarding::maybe_forwarded(target);
        if resolved != target || resolved.is_nursery() {
            tracer.on_edge(edge, resolved.trace_kind(), name);
        }
    }

    /// Discard all entries. Done at the end of a minor collection and when
    /// generational collection is disabled.
    pub fn clear(&self) {
        self.cell_slots.lock().unwrap().clear();
        self.value_slots.lock().unwrap().clear();
        self.whole_cells.lock().unwrap().clear();
        self.generics.lock().unwrap().clear();
    }

    /// Does the buffer name this slot? Used by the coverage verifier.
    pub fn contains_slot(&self, slot: Address) -> bool {
        self.cell_slots.lock().unwrap().contains(&slot)
            || self.value_slots.lock().unwrap().contains(&slot)
    }

    /// Does the buffer name this cell as a whole-cell entry?
    pub fn contains_whole_cell(&self, cell: CellRef) -> bool {
        self.whole_cells.lock().unwrap().contains(&cell)
    }

    /// The number of slot entries, for logging.
    pub fn entry_count(&self) -> usize {
        self.cell_slots.lock().unwrap().len()
            + self.value_slots.lock().unwrap().len()
            + self.whole_cells.lock().unwrap().len()
            + self.generics.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::AllocKind;
    use crate::trace::TracerKind;

    struct CountingTracer {
        edges: Vec<Edge>,
    }

    impl Tracer for CountingTracer {
        fn kind(&self) -> TracerKind {
            TracerKind::Callback
        }
        fn on_edge(&mut self, edge: Edge, _k: crate::cell::TraceKind, _n: &'static str) {
            self.edges.push(edge);
        }
    }

    #[test]
    fn slot_entries_deduplicate() {
        // A fake nursery cell and a slot pointing at it; no heap needed.
        let mut target = [0usize; 4];
        let cell = unsafe { CellRef::from_address(Address::from_mut_ptr(target.as_mut_ptr())) };
        cell.init_header(AllocKind::Object0, true);
        let mut slot: usize = cell.as_usize();
        let slot_addr = Address::from_mut_ptr(&mut slot);

        let buffer = StoreBuffer::new(true);
        buffer.put_cell_slot(slot_addr);
        buffer.put_cell_slot(slot_addr);
        buffer.put_cell_slot(slot_addr);
        assert!(buffer.contains_slot(slot_addr));

        let mut tracer = CountingTracer { edges: Vec::new() };
        buffer.drain(&mut tracer);
        assert_eq!(tracer.edges.len(), 1, "duplicate entries must collapse");
        assert_eq!(buffer.entry_count(), 0);
    }

    #[test]
    fn stale_slots_are_skipped() {
        let mut slot: usize = 0;
        let slot_addr = Address::from_mut_ptr(&mut slot);
        let buffer = StoreBuffer::new(true);
        buffer.put_cell_slot(slot_addr);

        // The mutator nulled the slot before the minor collection ran.
        let mut tracer = CountingTracer { edges: Vec::new() };
        buffer.drain(&mut tracer);
        assert!(tracer.edges.is_empty());
    }

    #[test]
    fn generic_entries_trace_themselves() {
        struct TwoSlots {
            slots: [Address; 2],
        }
        impl BufferableRef for TwoSlots {
            fn trace(&self, tracer: &mut dyn Tracer) {
                for slot in self.slots {
                    tracer.on_edge(Edge::Cell(slot), crate::cell::TraceKind::Object, "generic");
                }
            }
        }

        let mut target = [0usize; 4];
        let cell = unsafe { CellRef::from_address(Address::from_mut_ptr(target.as_mut_ptr())) };
        cell.init_header(AllocKind::Object0, true);
        let mut a: usize = cell.as_usize();
        let mut b: usize = cell.as_usize();

        let buffer = StoreBuffer::new(true);
        buffer.put_generic(Box::new(TwoSlots {
            slots: [Address::from_mut_ptr(&mut a), Address::from_mut_ptr(&mut b)],
        }));
        let mut tracer = CountingTracer { edges: Vec::new() };
        buffer.drain(&mut tracer);
        assert_eq!(tracer.edges.len(), 2);
    }

    #[test]
    fn disabled_buffer_records_nothing() {
        let mut slot: usize = 0;
        let buffer = StoreBuffer::new(false);
        buffer.put_cell_slot(Address::from_mut_ptr(&mut slot));
        assert_eq!(buffer.entry_count(), 0);
    }
}
