//! Resetting an in-progress incremental collection.

mod common;

use common::{build_chain, new_runtime_with, walk_chain};
use tephra::alloc::HeapHint;
use tephra::budget::SliceBudget;
use tephra::cell::{AllocKind, CellRef, TraceKind};
use tephra::driver::{GcReason, GcState, ResetReason};
use tephra::memory_manager as mm;
use tephra::zone::ZoneState;

#[test]
fn reset_mid_mark_collects_the_same_set_as_a_fresh_collection() {
    let rt = new_runtime_with("compacting=false");
    let mutator = rt.bind_mutator(rt.system_group());
    let zone = mutator.zone();

    // 100 live (rooted chain) and 100 tenured garbage objects.
    let mut head_root: Option<CellRef> = Some(build_chain(&mutator, 100));
    mm::add_persistent_root(&rt, TraceKind::Object, &mut head_root);
    for _ in 0..100 {
        mm::new_object_with_hint(&mutator, 2, HeapHint::Tenured).unwrap();
    }

    // One slice of marking, then a reset.
    mm::start_gc(
        &rt,
        rt.system_group(),
        GcReason::ApiRequest,
        SliceBudget::work(10),
    );
    mm::gc_slice(&rt, GcReason::IncrementalSlice, SliceBudget::work(10));
    assert_eq!(rt.driver().state(), GcState::Mark);

    rt.reset_gc(ResetReason::CompartmentRevived);
    assert_eq!(rt.driver().state(), GcState::NotActive);
    assert_eq!(zone.state(), ZoneState::NoGc);
    assert!(!zone.needs_pre_barrier());

    // A subsequent non-incremental collection behaves as if the aborted one
    // had never started: the rooted 100 survive, the garbage 100 die.
    mm::gc(&rt, GcReason::ApiRequest);
    assert_eq!(zone.heap.live_cells(AllocKind::Object2), 100);
    assert_eq!(walk_chain(head_root.unwrap()).len(), 100);

    mm::remove_persistent_root(&rt, &mut head_root);
}

#[test]
fn abort_during_marking_resets() {
    let rt = new_runtime_with("compacting=false");
    let mutator = rt.bind_mutator(rt.system_group());

    let mut head_root: Option<CellRef> = Some(build_chain(&mutator, 1000));
    mm::add_persistent_root(&rt, TraceKind::Object, &mut head_root);

    mm::start_gc(
        &rt,
        rt.system_group(),
        GcReason::ApiRequest,
        SliceBudget::work(10),
    );
    assert!(rt.driver().is_active());
    mm::abort_gc(&rt);
    assert_eq!(rt.driver().state(), GcState::NotActive);

    // The heap is intact.
    assert_eq!(walk_chain(head_root.unwrap()).len(), 1000);
    mm::remove_persistent_root(&rt, &mut head_root);
}

#[test]
fn zone_destruction_resets_an_active_collection() {
    let rt = new_runtime_with("compacting=false");
    let mutator = rt.bind_mutator(rt.system_group());
    let (_, doomed_zone, _) =
        mm::new_compartment(&rt, tephra::ZoneSpec::NewZoneInSystemGroup);

    let mut head_root: Option<CellRef> = Some(build_chain(&mutator, 500));
    mm::add_persistent_root(&rt, TraceKind::Object, &mut head_root);

    mm::start_gc(
        &rt,
        rt.system_group(),
        GcReason::ApiRequest,
        SliceBudget::work(10),
    );
    assert!(rt.driver().is_active());

    rt.schedule_zone_destruction(&doomed_zone);
    assert_eq!(rt.driver().state(), GcState::NotActive);
    assert!(rt
        .system_group()
        .zones()
        .iter()
        .all(|z| z.id() != doomed_zone.id()));

    // Collection still works afterwards.
    mm::gc(&rt, GcReason::ApiRequest);
    assert_eq!(walk_chain(head_root.unwrap()).len(), 500);
    mm::remove_persistent_root(&rt, &mut head_root);
}
