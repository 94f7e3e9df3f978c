//! The allocator: kind-typed cell allocation with a nursery fast path and a
//! tenured slow path.
//!
//! Every allocation runs the allocator-state check first; the check may
//! trigger a collection (thresholds, zeal) or refuse outright (unsafe-GC
//! region). A failed tenured allocation runs one full last-ditch collection
//! and retries once before reporting out-of-memory to the caller.

use crate::cell::{AllocKind, CellRef, MarkColor};
use crate::driver::GcReason;
use crate::runtime::{GcRuntime, Mutator};
use crate::util::Address;

/// Where the caller wants the cell to live.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum HeapHint {
    /// The kind's default: nursery when the kind allows it.
    #[default]
    Default,
    /// Force the tenured path.
    Tenured,
}

/// Allocation failure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// The heap is out of memory, even after a last-ditch collection.
    OutOfMemory,
    /// Allocation is forbidden in the current state (inside an unsafe-GC
    /// region, or on the collector's own thread mid-phase).
    Forbidden,
    /// No object size class fits the requested slot count.
    TooLarge,
}

/// Resolve the object size class for an allocation request, or pass through
/// non-object kinds.
pub fn resolve_kind(
    kind: AllocKind,
    extra_slots: Option<usize>,
) -> Result<AllocKind, AllocError> {
    match extra_slots {
        None => Ok(kind),
        Some(slots) => {
            debug_assert!(kind.is_object());
            AllocKind::object_kind_for_slots(slots, kind.is_background_finalizable())
                .ok_or(AllocError::TooLarge)
        }
    }
}

/// Run before every allocation. May trigger a collection; returns an error
/// if allocation is forbidden right now.
pub fn check_alloc_state(mutator: &Mutator, _kind: AllocKind) -> Result<(), AllocError> {
    let runtime = mutator.runtime();
    if runtime.state().in_unsafe_region() {
        return Err(AllocError::Forbidden);
    }
    // Collector phases (and the callbacks they invoke) must not allocate
    // through the mutator path; the collector's own copies go straight to
    // the zone heaps.
    if runtime.state().is_heap_busy() {
        return Err(AllocError::Forbidden);
    }

    // Zeal: allocation-triggered collections fire deterministically.
    runtime.zeal_alloc_tick(mutator);

    // Threshold check: start (or advance) an incremental collection once the
    // mutator's zone has allocated past its trigger.
    let zone = mutator.zone();
    if zone.should_trigger_gc() && !zone.is_collecting() {
        runtime.maybe_gc(GcReason::AllocTrigger);
    }
    Ok(())
}

/// Allocate a zeroed cell of at least the kind's size. `extra_slots` selects
/// an object size class; `hint` may force the tenured path.
pub fn allocate(
    mutator: &Mutator,
    kind: AllocKind,
    extra_slots: Option<usize>,
    hint: HeapHint,
) -> Result<CellRef, AllocError> {
    let kind = resolve_kind(kind, extra_slots)?;
    check_alloc_state(mutator, kind)?;

    let group = mutator.group();
    debug_assert!(group.owned_by_current_thread());

    if hint == HeapHint::Default && kind.is_nursery_allocable() && group.nursery.is_enabled() {
        if let Some(addr) = group.nursery.alloc_cell(kind.size()) {
            return Ok(init_nursery_cell(addr, kind));
        }
        // Nursery full: evict and retry the fast path once.
        mutator.runtime().evict_nursery(GcReason::OutOfNursery);
        if let Some(addr) = group.nursery.alloc_cell(kind.size()) {
            return Ok(init_nursery_cell(addr, kind));
        }
        // Fall through to the tenured path.
    }

    allocate_tenured(mutator, kind)
}

fn init_nursery_cell(addr: Address, kind: AllocKind) -> CellRef {
    let cell = unsafe { CellRef::from_address(addr) };
    cell.init_header(kind, true);
    cell
}

fn allocate_tenured(mutator: &Mutator, kind: AllocKind) -> Result<CellRef, AllocError> {
    let runtime = mutator.runtime();
    let zone = mutator.zone();

    let addr = match zone
        .heap
        .alloc_cell(&*zone as *const _, kind, runtime.region_pool())
    {
        Some(addr) => addr,
        None => {
            // Last-ditch: one full synchronous collection, then one retry.
            warn!("tenured allocation failed; running a last-ditch collection");
            runtime.gc(GcReason::LastDitch);
            match zone
                .heap
                .alloc_cell(&*zone as *const _, kind, runtime.region_pool())
            {
                Some(addr) => addr,
                None => {
                    runtime.report_oom(kind);
                    return Err(AllocError::OutOfMemory);
                }
            }
        }
    };

    let cell = unsafe { CellRef::from_address(addr) };
    cell.init_header(kind, false);
    zone.accounting.add(kind.size());

    // Cells born while their zone is being collected are allocated black:
    // they are live by construction for this collection, and marking them
    // keeps a sweep that has not reached this kind yet from freeing them.
    if zone.is_collecting() {
        cell.mark_if_unmarked(MarkColor::Black);
    }
    Ok(cell)
}
