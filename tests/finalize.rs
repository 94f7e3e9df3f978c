//! Finalization: per-kind hooks, background sweeping, and the finalize-phase
//! callbacks.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::new_runtime_with;
use tephra::alloc::HeapHint;
use tephra::cell::{AllocKind, CellRef, TraceKind};
use tephra::driver::GcReason;
use tephra::memory_manager as mm;
use tephra::sweep::FinalizePhase;

#[test]
fn background_finalizable_kinds_run_their_hook_off_thread() {
    let rt = new_runtime_with("compacting=false");
    let mutator = rt.bind_mutator(rt.system_group());

    let finalized = Arc::new(AtomicUsize::new(0));
    {
        let finalized = finalized.clone();
        rt.set_finalizer_hook(
            AllocKind::Object0Background,
            Arc::new(move |_cell| {
                finalized.fetch_add(1, Ordering::Relaxed);
            }),
        );
    }

    // 64 dead background-finalizable objects and 8 rooted ones.
    let mut keep: Vec<Option<CellRef>> = Vec::new();
    for i in 0..72 {
        let obj = mm::allocate(&mutator, AllocKind::Object0Background, None).unwrap();
        assert!(obj.is_tenured());
        if i % 9 == 0 {
            keep.push(Some(obj));
        }
    }
    let mut roots: Vec<Box<Option<CellRef>>> = keep.iter().map(|c| Box::new(*c)).collect();
    for slot in roots.iter_mut() {
        mm::add_persistent_root(&rt, TraceKind::Object, &mut **slot);
    }

    // The driver waits for background finalization before it finishes, so
    // the count is stable once gc() returns.
    mm::gc(&rt, GcReason::ApiRequest);
    assert_eq!(finalized.load(Ordering::Relaxed), 64);
    for slot in roots.iter() {
        assert!(slot.unwrap().is_tenured());
    }

    for slot in roots.iter_mut() {
        mm::remove_persistent_root(&rt, &mut **slot);
    }
}

#[test]
fn foreground_kinds_run_their_hook_on_the_mutator_thread() {
    let rt = new_runtime_with("compacting=false");
    let mutator = rt.bind_mutator(rt.system_group());

    let finalized = Arc::new(AtomicUsize::new(0));
    {
        let finalized = finalized.clone();
        rt.set_finalizer_hook(
            AllocKind::Scope,
            Arc::new(move |_cell| {
                finalized.fetch_add(1, Ordering::Relaxed);
            }),
        );
    }
    for _ in 0..10 {
        mm::allocate(&mutator, AllocKind::Scope, None).unwrap();
    }
    mm::gc(&rt, GcReason::ApiRequest);
    assert_eq!(finalized.load(Ordering::Relaxed), 10);
}

#[test]
fn background_finalization_can_run_inline() {
    let rt = new_runtime_with("background_finalization=false compacting=false");
    let mutator = rt.bind_mutator(rt.system_group());

    let finalized = Arc::new(AtomicUsize::new(0));
    {
        let finalized = finalized.clone();
        rt.set_finalizer_hook(
            AllocKind::Symbol,
            Arc::new(move |_cell| {
                finalized.fetch_add(1, Ordering::Relaxed);
            }),
        );
    }
    for _ in 0..5 {
        mm::allocate(&mutator, AllocKind::Symbol, None).unwrap();
    }
    mm::gc(&rt, GcReason::ApiRequest);
    assert_eq!(finalized.load(Ordering::Relaxed), 5);
}

#[test]
fn finalize_phase_callbacks_bracket_sweeping() {
    let rt = new_runtime_with("compacting=false");
    let mutator = rt.bind_mutator(rt.system_group());
    let _obj = mm::new_object_with_hint(&mutator, 0, HeapHint::Tenured).unwrap();

    let starts = Arc::new(AtomicUsize::new(0));
    let ends = Arc::new(AtomicUsize::new(0));
    {
        let starts = starts.clone();
        let ends = ends.clone();
        rt.add_finalize_callback(Box::new(move |phase| match phase {
            FinalizePhase::Start => {
                starts.fetch_add(1, Ordering::Relaxed);
            }
            FinalizePhase::End => {
                ends.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }
    mm::gc(&rt, GcReason::ApiRequest);
    assert_eq!(starts.load(Ordering::Relaxed), 1);
    assert_eq!(ends.load(Ordering::Relaxed), 1);
}

#[test]
fn weak_pointer_zone_callbacks_see_each_sweep_group() {
    let rt = new_runtime_with("compacting=false");
    let mutator = rt.bind_mutator(rt.system_group());
    let _obj = mm::new_object_with_hint(&mutator, 0, HeapHint::Tenured).unwrap();

    let seen_zones = Arc::new(AtomicUsize::new(0));
    {
        let seen_zones = seen_zones.clone();
        rt.add_weak_pointer_zone_callback(Box::new(move |zones| {
            seen_zones.fetch_add(zones.len(), Ordering::Relaxed);
        }));
    }
    mm::gc(&rt, GcReason::ApiRequest);
    // Every collected zone (the system zone and the atoms zone) was handed
    // to the callback exactly once, in some grouping.
    assert_eq!(seen_zones.load(Ordering::Relaxed), 2);
}
