//! Compaction: relocate the cells of fragmented regions and forward every
//! reference to them.
//!
//! Relocation sources are the most fragmented regions of the compactable
//! kinds. Each live cell is copied into the zone's remaining regions, the old
//! location gets a forwarding overlay, and then every outgoing edge of every
//! cell (plus the roots and the off-heap tables) is rewritten through the
//! overlays. The update runs in three passes: shapes first, then object
//! groups, then everything else, because the later passes read structures the
//! earlier ones own. The overlays die with the source regions at the end of
//! the phase.

use std::sync::Arc;

use crate::cell::alloc_kind::COMPACTABLE_KINDS;
use crate::cell::{forwarding, AllocKind, CellRef, MarkColor, TraceKind};
use crate::heap::RegionRef;
use crate::roots::RootTraceMode;
use crate::runtime::GcRuntime;
use crate::trace::{trace_children, Edge, Tracer, TracerKind};
use crate::zone::Zone;

/// Relocate and update the given zones. Runs with the heap busy and no
/// mutator in the group; nothing yields inside the relocation of a single
/// cell.
pub(crate) fn compact_zones(rt: &GcRuntime, zones: &[Arc<Zone>]) {
    let threshold = rt.options().compact_fragmentation_threshold;
    let mut sources: Vec<(Arc<Zone>, AllocKind, RegionRef)> = Vec::new();

    for zone in zones {
        for &kind in COMPACTABLE_KINDS {
            if zone.heap.region_count(kind) < 2 {
                continue;
            }
            for region in zone.heap.regions(kind) {
                let capacity = region.cell_capacity();
                let fraction = region.live_count() as f64 / capacity as f64;
                if region.live_count() == 0 || fraction >= threshold {
                    continue;
                }
                // Hosts may hold unrooted references to permanent cells, so
                // a region containing one never moves.
                if region.cells().any(|c| c.is_permanent()) {
                    continue;
                }
                zone.heap.remove_region(kind, region);
                sources.push((zone.clone(), kind, region));
            }
        }
    }
    if sources.is_empty() {
        debug!("compaction: nothing fragmented enough to move");
        return;
    }
    info!("compaction: {} relocation source regions", sources.len());

    let mut moved = 0usize;
    for (zone, kind, region) in &sources {
        for cell in region.cells() {
            relocate_cell(rt, zone, *kind, cell);
            moved += 1;
        }
    }

    // Three-phase reference update: shapes own the layout tables the later
    // passes consult.
    update_cells_of(zones, &[
        TraceKind::Shape,
        TraceKind::AccessorShape,
        TraceKind::BaseShape,
    ]);
    update_cells_of(zones, &[TraceKind::ObjectGroup]);
    update_cells_of(zones, &[
        TraceKind::Object,
        TraceKind::String,
        TraceKind::ExternalString,
        TraceKind::Atom,
        TraceKind::Symbol,
        TraceKind::Script,
        TraceKind::LazyScript,
        TraceKind::JitCode,
        TraceKind::Scope,
        TraceKind::RegExpShared,
    ]);

    // Roots and the off-heap side tables.
    let mut updater = UpdatingTracer;
    rt.roots().trace_roots(&mut updater, RootTraceMode::Tracing);
    let forward = |cell: CellRef| forwarding::maybe_forwarded(cell);
    for zone in rt.all_zones() {
        for compartment in zone.compartments() {
            compartment.fixup_wrappers(forward);
            compartment.fixup_defaults(forward);
            compartment.fixup_incoming_gray(forward);
        }
        for map in zone.weak_maps.lock().unwrap().iter() {
            map.fixup(forward);
        }
    }
    rt.fixup_atoms_after_compaction(forward);

    // The overlays are dead from here on.
    for (_zone, _kind, region) in sources {
        rt.region_pool().discard_region(region);
    }
    info!("compaction: moved {} cells", moved);
}

/// Move one cell, preserving its header flags, aux counter, mark color, and
/// unique id. The copy's header is complete before the overlay publishes the
/// new address.
fn relocate_cell(rt: &GcRuntime, zone: &Arc<Zone>, kind: AllocKind, cell: CellRef) {
    debug_assert_eq!(cell.kind(), kind);
    let size = kind.size();
    let addr = zone
        .heap
        .alloc_cell(Arc::as_ptr(zone), kind, rt.region_pool())
        .expect("out of memory while compacting");
    let copy = unsafe { CellRef::from_address(addr) };

    // Copy the whole cell including the header word, then transplant the
    // mark color, which lives in the region bitmap, not the header.
    unsafe {
        std::ptr::copy_nonoverlapping(
            cell.to_address().to_ptr::<u8>(),
            copy.to_address().to_mut_ptr::<u8>(),
            size,
        );
    }
    let bitmap = cell.region().mark_bitmap();
    if bitmap.is_marked(cell.to_address(), MarkColor::Black) {
        copy.mark_if_unmarked(MarkColor::Black);
    } else if bitmap.is_marked(cell.to_address(), MarkColor::Gray) {
        copy.mark_if_unmarked(MarkColor::Gray);
    }

    if cell.has_uid() {
        zone.unique_ids.lock().unwrap().rekey(cell, copy);
    }
    forwarding::forward(cell, copy);
}

/// Rewrite the outgoing edges of every cell of the given trace kinds.
fn update_cells_of(zones: &[Arc<Zone>], kinds: &[TraceKind]) {
    let mut updater = UpdatingTracer;
    for zone in zones {
        for region in zone.heap.all_regions() {
            if !kinds.contains(&region.kind().trace_kind()) {
                continue;
            }
            for cell in region.cells() {
                trace_children(cell, &mut updater);
            }
        }
    }
}

/// The reference updater: follows forwarding overlays and rewrites slots in
/// place.
struct UpdatingTracer;

impl Tracer for UpdatingTracer {
    fn kind(&self) -> TracerKind {
        TracerKind::Updating
    }

    fn on_edge(&mut self, edge: Edge, _trace_kind: TraceKind, _name: &'static str) {
        if let Some(target) = edge.load() {
            if forwarding::is_forwarded(target) {
                edge.store(forwarding::forwarded_target(target));
            }
        }
    }
}
