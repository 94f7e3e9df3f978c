//! Host-to-collector interface: safe Rust APIs.
//!
//! This module provides the surface an embedding runtime (interpreter, JIT,
//! shell) programs against: allocation, roots, barriers, collection control,
//! and the typed constructors the test suites use to build heaps. Everything
//! here is a thin layer over the internals; a host that needs to expose the
//! API over FFI manages that unsafety itself.

use std::sync::Arc;

use crate::alloc::{self, AllocError, HeapHint};
use crate::barrier;
use crate::budget::SliceBudget;
use crate::cell::{layout, AllocKind, CellRef, TraceKind, Value};
use crate::driver::GcReason;
use crate::mark::weak::WeakMapHandle;
use crate::roots::StackRootGuard;
use crate::runtime::{GcRuntime, Mutator, ZoneSpec};
use crate::util::Address;
use crate::zone::{Compartment, Zone, ZoneGroup};

// ---- Allocation ------------------------------------------------------------

/// Allocate a zeroed cell of at least the kind's size. May trigger a
/// collection slice.
pub fn allocate(
    mutator: &Mutator,
    kind: AllocKind,
    extra_slots: Option<usize>,
) -> Result<CellRef, AllocError> {
    alloc::allocate(mutator, kind, extra_slots, HeapHint::Default)
}

/// Allocate with an explicit heap hint.
pub fn allocate_with_hint(
    mutator: &Mutator,
    kind: AllocKind,
    extra_slots: Option<usize>,
    hint: HeapHint,
) -> Result<CellRef, AllocError> {
    alloc::allocate(mutator, kind, extra_slots, hint)
}

/// Create a plain object with at least `slots` value slots, wired to the
/// current compartment's default shape and group.
pub fn new_object(mutator: &Mutator, slots: usize) -> Result<CellRef, AllocError> {
    new_object_with_hint(mutator, slots, HeapHint::Default)
}

/// Create a plain object, forcing the tenured heap if asked.
pub fn new_object_with_hint(
    mutator: &Mutator,
    slots: usize,
    hint: HeapHint,
) -> Result<CellRef, AllocError> {
    let compartment = mutator.compartment();
    // The defaults are only reachable through objects wired to them, so they
    // are rooted across the allocation below in case it triggers a
    // collection.
    let (shape, group) = compartment_defaults(mutator, &compartment)?;
    let mut shape_slot: Option<CellRef> = Some(shape);
    let mut group_slot: Option<CellRef> = Some(group);
    let _shape_guard = root_stack_slot(mutator, TraceKind::Shape, &mut shape_slot);
    let _group_guard = root_stack_slot(mutator, TraceKind::ObjectGroup, &mut group_slot);

    let obj = alloc::allocate(mutator, AllocKind::Object0, Some(slots), hint)?;
    layout::object::set_shape(obj, shape_slot.expect("rooted shape vanished"));
    layout::object::set_group(obj, group_slot.expect("rooted group vanished"));
    Ok(obj)
}

/// The compartment's default shape and group for plain objects, created on
/// first use. The intermediates are stack-rooted across the allocations,
/// which may run collection slices.
fn compartment_defaults(
    mutator: &Mutator,
    compartment: &Arc<Compartment>,
) -> Result<(CellRef, CellRef), AllocError> {
    if let Some(pair) = compartment.peek_defaults() {
        return Ok(pair);
    }
    let mut base_slot: Option<CellRef> = Some(alloc::allocate(
        mutator,
        AllocKind::BaseShape,
        None,
        HeapHint::Tenured,
    )?);
    let _base_guard = root_stack_slot(mutator, TraceKind::BaseShape, &mut base_slot);

    let shape = alloc::allocate(mutator, AllocKind::Shape, None, HeapHint::Tenured)?;
    layout::shape::set_base(shape, base_slot.expect("rooted base shape vanished"));
    let mut shape_slot: Option<CellRef> = Some(shape);
    let _shape_guard = root_stack_slot(mutator, TraceKind::Shape, &mut shape_slot);

    let group = alloc::allocate(mutator, AllocKind::ObjectGroup, None, HeapHint::Tenured)?;
    layout::group::set_compartment(group, Arc::as_ptr(compartment));

    Ok(compartment.install_defaults((shape_slot.expect("rooted shape vanished"), group)))
}

/// Create a linear string owning a copy of `text`.
pub fn new_string(mutator: &Mutator, text: &[u8]) -> Result<CellRef, AllocError> {
    let s = alloc::allocate(mutator, AllocKind::String, None, HeapHint::Default)?;
    layout::string::init_linear(s, text.to_vec().into_boxed_slice());
    Ok(s)
}

/// Create a rope over two existing strings.
pub fn new_rope(mutator: &Mutator, left: CellRef, right: CellRef) -> Result<CellRef, AllocError> {
    debug_assert!(layout::string::is_string_kind(left));
    debug_assert!(layout::string::is_string_kind(right));
    let s = alloc::allocate(mutator, AllocKind::String, None, HeapHint::Default)?;
    layout::string::init_rope(s, left, right);
    Ok(s)
}

/// Create an external string over host-owned character data. The host keeps
/// the buffer alive until the cell's finalizer hook releases it.
pub fn new_external_string(
    mutator: &Mutator,
    data: *const u8,
    len: usize,
) -> Result<CellRef, AllocError> {
    let s = alloc::allocate(mutator, AllocKind::ExternalString, None, HeapHint::Default)?;
    s.set_aux_count(len.min(0xffff));
    unsafe {
        layout::word_address(s, layout::string::DATA_WORD).store::<*const u8>(data);
    }
    Ok(s)
}

/// Create a cross-compartment wrapper object in the mutator's current
/// compartment standing for `target` (a cell of another compartment). The
/// wrapper holds the target in its first slot and is registered in the
/// wrapper map.
pub fn new_wrapper(mutator: &Mutator, target: CellRef) -> Result<CellRef, AllocError> {
    assert!(
        target.is_tenured(),
        "cross-compartment wrapper targets must be tenured"
    );
    let wrapper = new_object_with_hint(mutator, 1, HeapHint::Tenured)?;
    layout::object::set_slot(wrapper, 0, Value::from_cell(target));
    mutator.compartment().put_wrapper(target, wrapper);
    Ok(wrapper)
}

// ---- Slot access with barriers ---------------------------------------------

/// Write an object slot, running the pre- and post-barriers.
pub fn write_slot(obj: CellRef, index: usize, value: Value) {
    barrier::write::object_slot(obj, index, value);
}

/// Read an object slot. Handing a gray cell to the host blackens it and its
/// reachable compartment-group cells first.
pub fn read_slot(obj: CellRef, index: usize) -> Value {
    let value = layout::object::slot(obj, index);
    if let Some(cell) = value.as_cell() {
        barrier::read_barrier(cell);
    }
    value
}

/// Hand a cell to host code: if it is gray, it and everything it reaches in
/// its compartment group become black.
pub fn expose_cell(cell: CellRef) {
    barrier::read_barrier(cell);
}

// ---- Roots -----------------------------------------------------------------

/// Register a persistent root slot. The slot must stay valid until removed.
pub fn add_persistent_root(rt: &GcRuntime, kind: TraceKind, slot: *mut Option<CellRef>) {
    rt.roots().add_persistent(kind, Address::from_mut_ptr(slot));
}

/// Unregister a persistent root slot.
pub fn remove_persistent_root(rt: &GcRuntime, slot: *mut Option<CellRef>) {
    rt.roots().remove_persistent(Address::from_mut_ptr(slot));
}

/// Root a stack slot for the returned guard's lifetime (LIFO).
pub fn root_stack_slot(
    mutator: &Mutator,
    kind: TraceKind,
    slot: *mut Option<CellRef>,
) -> StackRootGuard {
    mutator
        .stack_roots()
        .push(kind, Address::from_mut_ptr(slot))
}

// ---- Collection control ----------------------------------------------------

/// Run a full synchronous collection.
pub fn gc(rt: &GcRuntime, reason: GcReason) {
    rt.gc(reason);
}

/// Start an incremental collection (or advance the active one).
pub fn start_gc(rt: &GcRuntime, group: Arc<ZoneGroup>, reason: GcReason, budget: SliceBudget) {
    rt.start_or_slice(group, reason, budget);
}

/// Advance the active incremental collection by one slice.
pub fn gc_slice(rt: &GcRuntime, reason: GcReason, budget: SliceBudget) {
    rt.slice(reason, budget);
}

/// Finish the active incremental collection.
pub fn finish_gc(rt: &GcRuntime, reason: GcReason) {
    rt.finish_gc(reason);
}

/// Abort the active incremental collection.
pub fn abort_gc(rt: &GcRuntime) {
    rt.abort_gc();
}

/// Run a minor collection of the current thread's nursery synchronously.
pub fn evict_nursery(rt: &GcRuntime, reason: GcReason) {
    rt.evict_nursery(reason);
}

/// Create or attach a compartment per the zone spec.
pub fn new_compartment(
    rt: &GcRuntime,
    spec: ZoneSpec,
) -> (Arc<ZoneGroup>, Arc<Zone>, Arc<Compartment>) {
    rt.new_compartment(spec)
}

/// Create a weak map owned by `owner`.
pub fn new_weak_map(rt: &GcRuntime, owner: CellRef) -> WeakMapHandle {
    rt.new_weak_map(owner)
}

/// Enable deterministic debug perturbation, e.g. `"alloc;compact,100"`.
pub fn parse_and_set_zeal(rt: &GcRuntime, spec: &str) -> Result<(), crate::zeal::SetZealError> {
    rt.parse_and_set_zeal(spec)
}
