//! Incremental marking: bounded slices, the snapshot pre-barrier, and mark
//! idempotence.

mod common;

use common::{build_chain, new_runtime_with, walk_chain};
use tephra::alloc::HeapHint;
use tephra::budget::SliceBudget;
use tephra::cell::{CellRef, MarkColor, TraceKind, Value};
use tephra::driver::{GcReason, GcState};
use tephra::memory_manager as mm;

#[test]
fn incremental_cycle_marks_the_whole_list() {
    // Compaction off so raw node references stay valid across the cycle.
    let rt = new_runtime_with("compacting=false");
    let mutator = rt.bind_mutator(rt.system_group());

    let mut head_root: Option<CellRef> = Some(build_chain(&mutator, 10_000));
    mm::add_persistent_root(&rt, TraceKind::Object, &mut head_root);

    mm::start_gc(
        &rt,
        rt.system_group(),
        GcReason::ApiRequest,
        SliceBudget::work(100),
    );
    assert!(rt.driver().is_active());

    let mut pauses = 0usize;
    let mut barrier_checked = false;
    let mut unlinked: Option<CellRef> = None;
    let mut added: Option<CellRef> = None;
    while rt.driver().is_active() {
        // At every pause the head is marked: roots go first.
        let head = head_root.unwrap();
        assert!(head.is_marked_any(), "head unmarked at pause {}", pauses);

        if pauses == 5 && !barrier_checked {
            barrier_checked = true;
            // Splice a new object into the list. The overwritten edge runs
            // the snapshot pre-barrier, so the disconnected suffix must
            // still get marked.
            let node = walk_chain(head)[20];
            let old_next = mm::read_slot(node, 0).as_cell().unwrap();
            let fresh = mm::new_object_with_hint(&mutator, 2, HeapHint::Tenured).unwrap();
            mm::write_slot(node, 0, Value::from_cell(fresh));
            assert!(
                old_next.is_marked_any(),
                "pre-barrier did not mark the overwritten edge"
            );
            unlinked = Some(old_next);
            added = Some(fresh);
        }

        mm::gc_slice(&rt, GcReason::IncrementalSlice, SliceBudget::work(100));
        pauses += 1;
        assert!(pauses < 100_000, "collection never finished");
    }
    assert!(pauses > 1, "a work budget of 100 must take many slices");

    // Everything reachable from the head at the start is marked, including
    // the suffix that was unlinked mid-collection and the object added
    // through the barrier.
    let head = head_root.unwrap();
    for node in walk_chain(head) {
        assert!(node.is_marked(MarkColor::Black));
    }
    assert!(added.unwrap().is_marked_any());
    let suffix = walk_chain(unlinked.unwrap());
    for node in &suffix {
        assert!(node.is_marked_any(), "unlinked suffix lost a mark");
    }
    // All 10,000 original nodes plus the spliced-in object are accounted
    // for: the prefix (rewired through the new object) and the suffix.
    assert_eq!(walk_chain(head).len() + suffix.len(), 10_001);

    mm::remove_persistent_root(&rt, &mut head_root);
}

#[test]
fn marking_is_idempotent() {
    let rt = new_runtime_with("compacting=false");
    let mutator = rt.bind_mutator(rt.system_group());

    let mut head_root: Option<CellRef> =
        Some(mm::new_object_with_hint(&mutator, 2, HeapHint::Tenured).unwrap());
    mm::add_persistent_root(&rt, TraceKind::Object, &mut head_root);
    let obj = head_root.unwrap();

    mm::start_gc(
        &rt,
        rt.system_group(),
        GcReason::ApiRequest,
        SliceBudget::work(50),
    );
    assert!(obj.is_marked(MarkColor::Black));
    // Repeated marking of an already-marked cell changes nothing.
    assert!(!obj.mark_if_unmarked(MarkColor::Black));
    assert!(!obj.mark_if_unmarked(MarkColor::Gray));
    assert!(obj.is_marked(MarkColor::Black));

    mm::finish_gc(&rt, GcReason::Finish);
    assert_eq!(rt.driver().state(), GcState::NotActive);
    assert!(obj.is_marked(MarkColor::Black));

    mm::remove_persistent_root(&rt, &mut head_root);
}

#[test]
fn finish_completes_an_active_collection() {
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
    mm::finish_gc(&rt, GcReason::Finish);
    assert_eq!(rt.driver().state(), GcState::NotActive);
    assert_eq!(walk_chain(head_root.unwrap()).len(), 1000);

    mm::remove_persistent_root(&rt, &mut head_root);
}

#[test]
fn slice_callbacks_fire_in_order() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let rt = new_runtime_with("compacting=false");
    let mutator = rt.bind_mutator(rt.system_group());
    let _keep = mm::new_object(&mutator, 0).unwrap();

    let begins = Arc::new(AtomicUsize::new(0));
    let ends = Arc::new(AtomicUsize::new(0));
    {
        let begins = begins.clone();
        let ends = ends.clone();
        rt.add_gc_slice_callback(Box::new(move |progress, _reason| match progress {
            tephra::GcProgress::CycleBegin => {
                begins.fetch_add(1, Ordering::Relaxed);
            }
            tephra::GcProgress::CycleEnd => {
                ends.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }));
    }
    mm::gc(&rt, GcReason::ApiRequest);
    assert_eq!(begins.load(Ordering::Relaxed), 1);
    assert_eq!(ends.load(Ordering::Relaxed), 1);
}
