//! The nursery and the minor collector.
//!
//! The nursery is a single mapped range allocated by bump pointer. A minor
//! collection promotes every reachable nursery cell into the tenured heap of
//! its zone, leaves a forwarding overlay at the old address, rewrites every
//! referring slot (store-buffer entries, roots, and the copies' own
//! children), and then resets the bump pointer. Cells whose kind forbids
//! nursery allocation never appear here, so the remembered set only ever
//! names nursery-allocable kinds.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::cell::{forwarding, CellRef, TraceKind};
use crate::driver::GcReason;
use crate::mark::compartment_of;
use crate::runtime::GcRuntime;
use crate::trace::{trace_children, Edge, Tracer, TracerKind};
use crate::util::constants::{BYTES_IN_PAGE, CELL_ALIGN};
use crate::util::{memory, Address};
use crate::zone::ZoneGroup;

/// Statistics from one minor collection.
#[derive(Debug, Default, Clone, Copy)]
pub struct MinorGcStats {
    pub promoted_cells: usize,
    pub promoted_bytes: usize,
    pub used_bytes_before: usize,
}

/// The young generation of one zone group.
pub struct Nursery {
    start: Address,
    capacity: usize,
    cursor: AtomicUsize,
    enabled: bool,
    /// Set when the next sweep should also return the pages to the OS.
    shrink_requested: AtomicBool,
}

unsafe impl Send for Nursery {}
unsafe impl Sync for Nursery {}

impl Nursery {
    pub(crate) fn new(capacity: usize, enabled: bool) -> Nursery {
        let capacity = capacity.next_multiple_of(BYTES_IN_PAGE);
        let start = if enabled {
            memory::map_aligned(capacity, BYTES_IN_PAGE).expect("failed to map the nursery")
        } else {
            Address::ZERO
        };
        debug!(
            "nursery: {} bytes at {} (enabled: {})",
            capacity, start, enabled
        );
        Nursery {
            start,
            capacity,
            cursor: AtomicUsize::new(0),
            enabled,
            shrink_requested: AtomicBool::new(false),
        }
    }

    /// Is generational collection on? When off, every allocation takes the
    /// tenured path and minor collections are no-ops.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Bytes currently allocated.
    pub fn used_bytes(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Does this address fall inside the nursery range?
    pub fn contains(&self, addr: Address) -> bool {
        self.enabled && addr >= self.start && addr < self.start + self.capacity
    }

    /// Bump-allocate a zeroed cell. `None` when full (the caller evicts) or
    /// when the nursery is disabled.
    pub fn alloc_cell(&self, size: usize) -> Option<Address> {
        if !self.enabled {
            return None;
        }
        debug_assert_eq!(size % CELL_ALIGN, 0);
        let offset = self.cursor.load(Ordering::Relaxed);
        if offset + size > self.capacity {
            return None;
        }
        self.cursor.store(offset + size, Ordering::Relaxed);
        let addr = self.start + offset;
        memory::zero(addr, size);
        Some(addr)
    }

    /// Ask the next sweep to decommit the nursery pages.
    pub fn request_shrink(&self) {
        self.shrink_requested.store(true, Ordering::Relaxed);
    }

    /// Run a minor collection for `group`. The caller holds the group and
    /// the heap-busy token.
    pub(crate) fn collect(
        &self,
        runtime: &GcRuntime,
        group: &ZoneGroup,
        reason: GcReason,
    ) -> MinorGcStats {
        let mut stats = MinorGcStats {
            used_bytes_before: self.used_bytes(),
            ..Default::default()
        };
        if !self.enabled || self.used_bytes() == 0 {
            group.store_buffer.clear();
            return stats;
        }
        debug!(
            "minor GC (reason: {:?}): {} bytes in use",
            reason,
            self.used_bytes()
        );

        let mut tracer = TenuringTracer {
            runtime,
            nursery: self,
            promoted: VecDeque::new(),
            promoted_cells: 0,
            promoted_bytes: 0,
        };

        // Store-buffer entries are the intergenerational roots.
        group.store_buffer.drain(&mut tracer);
        // Ordinary roots may point straight into the nursery.
        runtime
            .roots()
            .trace_roots(&mut tracer, crate::roots::RootTraceMode::Marking);
        // Minor collections treat weak-map entries as strong; ephemeron
        // semantics are applied only by major marking.
        for zone in group.zones() {
            for map in zone.weak_maps.lock().unwrap().iter() {
                map.trace_strongly(&mut tracer);
            }
        }

        // Close over the copies' own children.
        while let Some(copy) = tracer.promoted.pop_front() {
            trace_children(copy, &mut tracer);
        }

        stats.promoted_cells = tracer.promoted_cells;
        stats.promoted_bytes = tracer.promoted_bytes;

        // Sweep: reset the bump pointer and discard the remembered set.
        self.cursor.store(0, Ordering::Relaxed);
        group.store_buffer.clear();
        if self.shrink_requested.swap(false, Ordering::Relaxed) {
            let _ = memory::decommit(self.start, self.capacity);
        }
        info!(
            "minor GC promoted {} cells ({} bytes) of {} bytes used",
            stats.promoted_cells, stats.promoted_bytes, stats.used_bytes_before
        );
        stats
    }
}

/// The tracer of the minor collector: promotes nursery referents and
/// rewrites the visited slot to the tenured copy.
struct TenuringTracer<'a> {
    runtime: &'a GcRuntime,
    nursery: &'a Nursery,
    /// Copies whose children have not been traced yet.
    promoted: VecDeque<CellRef>,
    promoted_cells: usize,
    promoted_bytes: usize,
}

impl TenuringTracer<'_> {
    /// Copy `cell` to the tenured heap of its zone, leave a forwarding
    /// overlay, and return the copy. Idempotent across multiple edges to the
    /// same cell.
    fn promote(&mut self, cell: CellRef) -> CellRef {
        if forwarding::is_forwarded(cell) {
            return forwarding::forwarded_target(cell);
        }
        let kind = cell.kind();
        debug_assert!(kind.is_nursery_allocable());
        let compartment =
            compartment_of(cell).expect("nursery cell without a compartment");
        let zone = compartment.zone();

        let size = kind.size();
        let addr = zone
            .heap
            .alloc_cell(zone as *const _, kind, self.runtime.region_pool())
            .expect("out of memory while tenuring");
        let copy = unsafe { CellRef::from_address(addr) };

        // The copy's header (including its kind) is fully written before the
        // forwarding overlay publishes the new address.
        copy.init_header(kind, false);
        copy.set_aux_count(cell.aux_count());
        unsafe {
            std::ptr::copy_nonoverlapping(
                cell.payload_address().to_ptr::<u8>(),
                copy.payload_address().to_mut_ptr::<u8>(),
                size - crate::util::constants::BYTES_IN_WORD,
            );
        }
        if cell.has_uid() {
            copy.set_has_uid();
            zone.unique_ids.lock().unwrap().rekey(cell, copy);
        }
        forwarding::forward(cell, copy);

        zone.accounting.add(size);
        self.promoted_cells += 1;
        self.promoted_bytes += size;

        // A promotion during an incremental collection must keep the copy
        // alive for the rest of that collection. During marking it joins the
        // wavefront so its children get scanned; once sweeping has begun its
        // children are already live-or-promoted, so a bare black mark is
        // enough to protect it from the kinds not yet swept.
        match zone.state() {
            crate::zone::ZoneState::Mark => {
                self.runtime.with_marker(|marker| marker.mark_cell(copy));
            }
            crate::zone::ZoneState::Sweep
            | crate::zone::ZoneState::Finished
            | crate::zone::ZoneState::Compact => {
                copy.mark_if_unmarked(crate::cell::MarkColor::Black);
            }
            crate::zone::ZoneState::NoGc => {}
        }

        self.promoted.push_back(copy);
        copy
    }
}

impl Tracer for TenuringTracer<'_> {
    fn kind(&self) -> TracerKind {
        TracerKind::Tenuring
    }

    fn on_edge(&mut self, edge: Edge, _trace_kind: TraceKind, _name: &'static str) {
        let Some(target) = edge.load() else { return };
        // A forwarded referent was a nursery cell promoted through another
        // edge; only the slot rewrite is left to do. The header of a
        // forwarded cell is an overlay, so this check must come before any
        // header field read.
        if forwarding::is_forwarded(target) {
            edge.store(forwarding::forwarded_target(target));
            return;
        }
        if !target.is_nursery() {
            return;
        }
        // Root tracing is runtime-wide; cells of another group's nursery are
        // that group's business.
        if !self.nursery.contains(target.to_address()) {
            return;
        }
        let copy = self.promote(target);
        edge.store(copy);
    }
}

/// Verify invariant P7: every tenured slot holding a nursery pointer is
/// named by the store buffer. Walks the whole tenured heap of the group;
/// enabled by the verify-post-barrier zeal mode and the `verify_barriers`
/// feature.
pub(crate) fn verify_store_buffer(group: &ZoneGroup) {
    struct Verify<'a> {
        group: &'a ZoneGroup,
        holder: CellRef,
    }
    impl Tracer for Verify<'_> {
        fn kind(&self) -> TracerKind {
            TracerKind::Callback
        }
        fn on_edge(&mut self, edge: Edge, _k: TraceKind, name: &'static str) {
            if let Some(target) = edge.load() {
                if target.is_nursery() {
                    assert!(
                        self.group.store_buffer.contains_slot(edge.address())
                            || self.group.store_buffer.contains_whole_cell(self.holder),
                        "missing store buffer entry for {} slot {} ({})",
                        self.holder,
                        edge.address(),
                        name
                    );
                }
            }
        }
    }
    for zone in group.zones() {
        for region in zone.heap.all_regions() {
            for cell in region.cells() {
                let mut verify = Verify {
                    group,
                    holder: cell,
                };
                trace_children(cell, &mut verify);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_nursery_never_allocates() {
        let nursery = Nursery::new(1 << 16, false);
        assert!(!nursery.is_enabled());
        assert!(nursery.alloc_cell(64).is_none());
    }

    #[test]
    fn bump_allocation_and_exhaustion() {
        let nursery = Nursery::new(BYTES_IN_PAGE, true);
        let a = nursery.alloc_cell(64).unwrap();
        let b = nursery.alloc_cell(64).unwrap();
        assert_eq!(b - a, 64);
        assert!(nursery.contains(a));
        let mut last = b;
        while let Some(next) = nursery.alloc_cell(64) {
            last = next;
        }
        assert!(nursery.used_bytes() <= nursery.capacity());
        assert!(nursery.contains(last));
    }
}
