//! Read and write barriers.
//!
//! The pre-barrier implements snapshot-at-the-beginning: before a slot
//! holding a cell pointer is overwritten while the owning zone is marking,
//! the old referent is marked black, so every reference live at the start of
//! the incremental collection gets processed even if the mutator disconnects
//! it between slices.
//!
//! The post-barrier maintains the generational invariant: after a nursery
//! pointer is written into a tenured cell, the slot is remembered in the
//! store buffer so the next minor collection finds it.
//!
//! The read barriers cover the two places a plain read can violate collector
//! invariants: reading a weakly held cell while its zone is sweeping
//! (resurrect it by marking black), and handing a gray cell to host code
//! (unmark it, and everything it reaches in its compartment group, black).
//!
//! Every barrier must run on the thread holding the owning zone group; the
//! barrier protocol is a correctness requirement, so this is a hard
//! assertion, not a debug one.

use crate::cell::{layout, CellRef, MarkColor, Value};
use crate::trace::{trace_children, Edge, Tracer, TracerKind};
use crate::util::Address;

fn assert_group_access(cell: CellRef) {
    if cell.is_tenured() && !cell.zone().is_atoms_zone() {
        assert!(
            cell.zone().group().owned_by_current_thread(),
            "barrier invoked on a thread outside the owning zone group"
        );
    }
}

/// The snapshot-at-the-beginning pre-barrier. Call with the value a slot
/// held *before* it is overwritten. Idempotent: marking an already marked
/// cell is a no-op.
pub fn pre_write_barrier(old: Option<CellRef>) {
    let Some(cell) = old else { return };
    if cell.is_nursery() || cell.is_permanent() {
        // Nursery cells are covered by the store buffer and eviction, not by
        // marking.
        return;
    }
    assert_group_access(cell);
    let zone = cell.zone();
    if !zone.needs_pre_barrier() {
        return;
    }
    let runtime = zone.group().runtime();
    if runtime.state().is_heap_busy() {
        // The collector itself is running; it does not need its own writes
        // barriered.
        return;
    }
    trace!("pre-barrier marks {}", cell);
    // The snapshot barrier always marks black, whatever color the paused
    // marker happens to hold.
    runtime.with_marker(|marker| {
        let saved = marker.color();
        marker.set_color(crate::cell::MarkColor::Black);
        marker.mark_cell(cell);
        marker.set_color(saved);
    });
}

/// Pre-barrier for a tagged value slot.
pub fn pre_write_barrier_value(old: Value) {
    pre_write_barrier(old.as_cell());
}

/// The generational post-barrier for a bare cell-edge slot. Call after the
/// write, with the containing cell and the address of the slot.
pub fn post_write_barrier(holder: CellRef, slot: Address, new: Option<CellRef>) {
    let Some(target) = new else { return };
    if !holder.is_tenured() || !target.is_nursery() {
        return;
    }
    assert_group_access(holder);
    let group = holder.zone().group();
    group.store_buffer.put_cell_slot(slot);
    maybe_evict_on_overflow(group);
}

/// The generational post-barrier for a tagged value slot.
pub fn post_write_barrier_value(holder: CellRef, slot: Address, new: Value) {
    let Some(target) = new.as_cell() else { return };
    if !holder.is_tenured() || !target.is_nursery() {
        return;
    }
    assert_group_access(holder);
    let group = holder.zone().group();
    group.store_buffer.put_value_slot(slot);
    maybe_evict_on_overflow(group);
}

/// Whole-cell post-barrier: remember every slot of `holder` at once. Used
/// when many slots were written (e.g. array initialization).
pub fn post_write_barrier_whole_cell(holder: CellRef) {
    if !holder.is_tenured() {
        return;
    }
    assert_group_access(holder);
    let group = holder.zone().group();
    group.store_buffer.put_whole_cell(holder);
    maybe_evict_on_overflow(group);
}

fn maybe_evict_on_overflow(group: &crate::zone::ZoneGroup) {
    if group.store_buffer.is_about_to_overflow() {
        debug!("store buffer overflow; evicting the nursery");
        group
            .runtime()
            .evict_nursery(crate::driver::GcReason::FullStoreBuffer);
    }
}

/// Read barrier for weakly held cells: reading one while its zone sweeps
/// resurrects it by marking it black.
pub fn read_barrier(cell: CellRef) {
    if cell.is_nursery() || cell.is_permanent() {
        return;
    }
    assert_group_access(cell);
    let zone = cell.zone();
    if zone.is_sweeping() && !cell.is_marked_any() {
        debug!("read barrier resurrects {}", cell);
        cell.mark_if_unmarked(MarkColor::Black);
    }
    if cell.is_marked(MarkColor::Gray) {
        expose_to_active_code(cell);
    }
}

/// The gray-unmark recursion: host code got hold of `cell`, so it and
/// everything it reaches inside its compartment group must be black from now
/// on. Uses an explicit stack; the graph may be cyclic, and `unmark_gray` is
/// monotonic, so the walk terminates.
pub fn expose_to_active_code(cell: CellRef) {
    if cell.is_nursery() || cell.is_permanent() {
        return;
    }
    let group_id = if cell.zone().is_atoms_zone() {
        None
    } else {
        Some(cell.zone().group().id())
    };
    let mut stack: Vec<CellRef> = Vec::new();
    if cell.region().mark_bitmap().unmark_gray(cell.to_address()) {
        stack.push(cell);
    }
    while let Some(cell) = stack.pop() {
        let mut found: Vec<CellRef> = Vec::new();
        {
            let mut visitor = UnmarkGrayVisitor {
                stack: &mut found,
                group_id,
            };
            trace_children(cell, &mut visitor);
        }
        stack.extend(found);
    }
}

struct UnmarkGrayVisitor<'a> {
    stack: &'a mut Vec<CellRef>,
    group_id: Option<usize>,
}

impl Tracer for UnmarkGrayVisitor<'_> {
    fn kind(&self) -> TracerKind {
        TracerKind::Callback
    }

    fn on_edge(&mut self, edge: Edge, _trace_kind: crate::cell::TraceKind, _name: &'static str) {
        let Some(target) = edge.load() else { return };
        if target.is_nursery() || target.is_permanent() {
            return;
        }
        // Stay within the compartment group.
        if let Some(group_id) = self.group_id {
            if !target.zone().is_atoms_zone() && target.zone().group().id() != group_id {
                return;
            }
        }
        if target
            .region()
            .mark_bitmap()
            .unmark_gray(target.to_address())
        {
            self.stack.push(target);
        }
    }
}

/// Record that `holder`'s zone references an atom. The per-zone atom bitmaps
/// are maintained at write time, so atoms referenced by zones that are not
/// part of a collection still survive it (the bitmaps are unioned before the
/// atoms zone is swept).
pub(crate) fn note_atom_reference(holder: CellRef, cell: CellRef) {
    use crate::cell::TraceKind;
    if cell.trace_kind() != TraceKind::Atom || cell.is_permanent() {
        return;
    }
    let zone = if holder.is_tenured() {
        Some(holder.zone())
    } else {
        crate::mark::compartment_of(holder).map(|c| c.zone())
    };
    if let Some(zone) = zone {
        if !zone.is_atoms_zone() {
            let index = layout::string::atom_index(cell);
            zone.atom_bitmap.lock().unwrap().set(index);
        }
    }
}

/// Barrier-observing slot writers, used by the public API and by tests.
/// These bundle "pre-barrier, store, post-barrier" in the required order.
pub mod write {
    use super::*;

    /// Overwrite an object slot value.
    pub fn object_slot(obj: CellRef, index: usize, value: Value) {
        let old = layout::object::slot(obj, index);
        pre_write_barrier_value(old);
        layout::object::set_slot(obj, index, value);
        post_write_barrier_value(obj, layout::object::slot_address(obj, index), value);
        if let Some(cell) = value.as_cell() {
            note_atom_reference(obj, cell);
        }
    }

    /// Overwrite a named cell edge at the given payload word.
    pub fn cell_edge(holder: CellRef, word: usize, new: Option<CellRef>) {
        let addr = layout::word_address(holder, word);
        pre_write_barrier(layout::read_edge(addr));
        layout::write_edge(addr, new);
        post_write_barrier(holder, addr, new);
        if let Some(cell) = new {
            note_atom_reference(holder, cell);
        }
    }
}
