//! Zeal: deterministic debug perturbation.

mod common;

use common::{build_chain, new_runtime_with, walk_chain};
use tephra::cell::{CellRef, TraceKind};
use tephra::driver::GcReason;
use tephra::memory_manager as mm;

#[test]
fn alloc_zeal_collects_every_n_allocations() {
    let rt = new_runtime_with("compacting=false");
    let mutator = rt.bind_mutator(rt.system_group());
    mm::parse_and_set_zeal(&rt, "alloc,50").unwrap();

    let before = rt.state().major_gc_number();
    for _ in 0..120 {
        mm::new_object(&mutator, 0).unwrap();
    }
    let collections = rt.state().major_gc_number() - before;
    assert!(
        collections >= 2,
        "zeal alloc,50 should have collected at least twice over 120 allocations, got {}",
        collections
    );
}

#[test]
fn incremental_zeal_forces_multiple_slices() {
    let rt = new_runtime_with("compacting=false");
    let mutator = rt.bind_mutator(rt.system_group());
    mm::parse_and_set_zeal(&rt, "incremental,100").unwrap();

    let mut head_root: Option<CellRef> = Some(build_chain(&mutator, 2000));
    mm::add_persistent_root(&rt, TraceKind::Object, &mut head_root);

    let slices_before = rt.state().slice_count();
    mm::gc(&rt, GcReason::ApiRequest);
    let slices = rt.state().slice_count() - slices_before;
    assert!(
        slices > 2,
        "zeal-forced incremental collection took only {} slices",
        slices
    );
    assert_eq!(walk_chain(head_root.unwrap()).len(), 2000);

    mm::remove_persistent_root(&rt, &mut head_root);
}

#[test]
fn verify_post_zeal_checks_the_store_buffer() {
    let rt = new_runtime_with("");
    let mutator = rt.bind_mutator(rt.system_group());
    mm::parse_and_set_zeal(&rt, "verifypost").unwrap();

    // A correct barrier sequence passes the verifier.
    let holder = mm::new_object_with_hint(
        &mutator,
        2,
        tephra::alloc::HeapHint::Tenured,
    )
    .unwrap();
    let mut holder_root: Option<CellRef> = Some(holder);
    mm::add_persistent_root(&rt, TraceKind::Object, &mut holder_root);
    let young = mm::new_object(&mutator, 0).unwrap();
    mm::write_slot(holder, 0, tephra::cell::Value::from_cell(young));

    mm::evict_nursery(&rt, GcReason::ApiRequest);
    assert!(mm::read_slot(holder, 0).as_cell().unwrap().is_tenured());

    mm::remove_persistent_root(&rt, &mut holder_root);
}

#[test]
fn verify_pre_zeal_validates_the_snapshot() {
    let rt = new_runtime_with("compacting=false");
    let mutator = rt.bind_mutator(rt.system_group());
    mm::parse_and_set_zeal(&rt, "verifypre").unwrap();

    let mut head_root: Option<CellRef> = Some(build_chain(&mutator, 300));
    mm::add_persistent_root(&rt, TraceKind::Object, &mut head_root);

    // The collection walks the snapshot at mark end and asserts coverage.
    mm::gc(&rt, GcReason::ApiRequest);
    assert_eq!(walk_chain(head_root.unwrap()).len(), 300);

    mm::remove_persistent_root(&rt, &mut head_root);
}

#[test]
fn bad_zeal_specs_are_rejected() {
    let rt = new_runtime_with("");
    assert!(mm::parse_and_set_zeal(&rt, "alloc,50").is_ok());
    assert!(mm::parse_and_set_zeal(&rt, "frobnicate").is_err());
    assert!(mm::parse_and_set_zeal(&rt, "99").is_err());
    assert!(mm::parse_and_set_zeal(&rt, "none").is_ok());
    assert!(!rt.zeal().spec().is_enabled());
}
