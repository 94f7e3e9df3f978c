//! Nursery promotion and the generational invariants.

mod common;

use common::{build_chain, new_runtime_with, runtime_and_mutator, walk_chain};
use tephra::alloc::{AllocError, HeapHint};
use tephra::cell::{AllocKind, CellRef, TraceKind, Value};
use tephra::driver::GcReason;
use tephra::memory_manager as mm;
use tephra::trace::trace_children;

#[test]
fn nursery_promotion_keeps_rooted_objects() {
    let (rt, mutator) = runtime_and_mutator();

    // 500 reachable objects (a rooted chain) and 500 garbage ones.
    let mut head_root: Option<CellRef> = Some(build_chain(&mutator, 500));
    mm::add_persistent_root(&rt, TraceKind::Object, &mut head_root);
    for _ in 0..500 {
        let garbage = mm::new_object(&mutator, 2).unwrap();
        assert!(garbage.is_nursery());
    }
    let promoted_before = rt.state().bytes_promoted();

    mm::evict_nursery(&rt, GcReason::ApiRequest);

    // The rooted 500 were copied to the tenured heap and the root now points
    // at the copies; the garbage 500 are gone with the nursery.
    let head = head_root.expect("persistent root cleared by minor GC");
    let nodes = walk_chain(head);
    assert_eq!(nodes.len(), 500);
    for (i, node) in nodes.iter().enumerate() {
        assert!(node.is_tenured());
        assert_eq!(mm::read_slot(*node, 1).as_int(), i as i32);
    }
    assert_eq!(rt.system_group().nursery.used_bytes(), 0);
    assert_eq!(
        rt.state().bytes_promoted() - promoted_before,
        500 * AllocKind::Object2.size()
    );

    mm::remove_persistent_root(&rt, &mut head_root);
}

#[test]
fn minor_gc_leaves_no_nursery_pointers_behind() {
    let (rt, mutator) = runtime_and_mutator();

    let mut head_root: Option<CellRef> = Some(build_chain(&mutator, 100));
    mm::add_persistent_root(&rt, TraceKind::Object, &mut head_root);
    mm::evict_nursery(&rt, GcReason::ApiRequest);

    // Walk the whole reachable graph; nothing may point into the (empty)
    // nursery any more.
    struct NoNursery;
    impl tephra::trace::Tracer for NoNursery {
        fn kind(&self) -> tephra::trace::TracerKind {
            tephra::trace::TracerKind::Callback
        }
        fn on_edge(
            &mut self,
            edge: tephra::trace::Edge,
            _kind: TraceKind,
            name: &'static str,
        ) {
            if let Some(target) = edge.load() {
                assert!(target.is_tenured(), "nursery pointer survived in {}", name);
            }
        }
    }
    let mut visitor = NoNursery;
    for node in walk_chain(head_root.unwrap()) {
        trace_children(node, &mut visitor);
    }

    mm::remove_persistent_root(&rt, &mut head_root);
}

#[test]
fn store_buffer_records_tenured_to_nursery_edges() {
    let (rt, mutator) = runtime_and_mutator();

    let holder = mm::new_object_with_hint(&mutator, 2, HeapHint::Tenured).unwrap();
    let mut holder_root: Option<CellRef> = Some(holder);
    mm::add_persistent_root(&rt, TraceKind::Object, &mut holder_root);

    let young = mm::new_object(&mutator, 0).unwrap();
    assert!(young.is_nursery());
    mm::write_slot(holder, 0, Value::from_cell(young));
    assert!(rt.system_group().store_buffer.entry_count() > 0);

    mm::evict_nursery(&rt, GcReason::ApiRequest);

    // The remembered slot was forwarded to the tenured copy and the buffer
    // discarded.
    let copy = mm::read_slot(holder_root.unwrap(), 0).as_cell().unwrap();
    assert!(copy.is_tenured());
    assert_eq!(rt.system_group().store_buffer.entry_count(), 0);

    mm::remove_persistent_root(&rt, &mut holder_root);
}

#[test]
fn whole_cell_entries_cover_bulk_writes() {
    let (rt, mutator) = runtime_and_mutator();

    let holder = mm::new_object_with_hint(&mutator, 8, HeapHint::Tenured).unwrap();
    let mut holder_root: Option<CellRef> = Some(holder);
    mm::add_persistent_root(&rt, TraceKind::Object, &mut holder_root);

    // Raw bulk initialization followed by a single whole-cell barrier.
    for i in 0..8 {
        let young = mm::new_object(&mutator, 0).unwrap();
        tephra::cell::layout::object::set_slot(holder, i, Value::from_cell(young));
    }
    tephra::barrier::post_write_barrier_whole_cell(holder);

    mm::evict_nursery(&rt, GcReason::ApiRequest);
    for i in 0..8 {
        let copy = mm::read_slot(holder_root.unwrap(), i).as_cell().unwrap();
        assert!(copy.is_tenured());
    }

    mm::remove_persistent_root(&rt, &mut holder_root);
}

#[test]
fn disabling_generational_collection_tenures_everything() {
    let rt = new_runtime_with("generational=false");
    let mutator = rt.bind_mutator(rt.system_group());

    let obj = mm::new_object(&mutator, 2).unwrap();
    assert!(obj.is_tenured());
    assert!(!rt.system_group().nursery.is_enabled());
    assert!(!rt.system_group().store_buffer.is_enabled());

    // Minor GC is a no-op.
    mm::evict_nursery(&rt, GcReason::ApiRequest);
    assert!(obj.is_tenured());
}

#[test]
fn allocation_is_forbidden_in_unsafe_regions() {
    let (rt, mutator) = runtime_and_mutator();
    rt.state().enter_unsafe_region();
    assert_eq!(mm::new_object(&mutator, 0).unwrap_err(), AllocError::Forbidden);
    rt.state().leave_unsafe_region();
    assert!(mm::new_object(&mutator, 0).is_ok());
}

#[test]
fn oversized_slot_requests_are_rejected() {
    let (_rt, mutator) = runtime_and_mutator();
    assert_eq!(
        mm::allocate(&mutator, AllocKind::Object0, Some(17)).unwrap_err(),
        AllocError::TooLarge
    );
}
