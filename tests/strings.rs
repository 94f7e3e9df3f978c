//! Strings and ropes: eager inline marking and sweeping.

mod common;

use common::new_runtime_with;
use tephra::cell::{layout, CellRef, MarkColor, TraceKind};
use tephra::driver::GcReason;
use tephra::memory_manager as mm;

#[test]
fn rooted_rope_survives_and_marks_eagerly() {
    let rt = new_runtime_with("compacting=false");
    let mutator = rt.bind_mutator(rt.system_group());

    // A deep rope: each level pairs a fresh leaf with the previous spine.
    let mut spine_slot: Option<CellRef> = Some(mm::new_string(&mutator, b"leaf-0").unwrap());
    let _guard = mm::root_stack_slot(&mutator, TraceKind::String, &mut spine_slot);
    for i in 1..2000usize {
        let leaf = mm::new_string(&mutator, format!("leaf-{}", i).as_bytes()).unwrap();
        let rope = mm::new_rope(&mutator, leaf, spine_slot.unwrap()).unwrap();
        spine_slot = Some(rope);
    }
    let mut rope_root: Option<CellRef> = spine_slot;
    mm::add_persistent_root(&rt, TraceKind::String, &mut rope_root);

    mm::gc(&rt, GcReason::ApiRequest);

    // The whole rope, every leaf included, is black.
    let mut stack = vec![rope_root.unwrap()];
    let mut count = 0usize;
    while let Some(s) = stack.pop() {
        assert!(s.is_marked(MarkColor::Black));
        count += 1;
        if layout::string::is_rope(s) {
            stack.push(layout::string::left(s));
            stack.push(layout::string::right(s));
        }
    }
    // 1999 ropes and 2000 leaves.
    assert_eq!(count, 3999);

    mm::remove_persistent_root(&rt, &mut rope_root);
}

#[test]
fn unreferenced_strings_are_swept() {
    let rt = new_runtime_with("compacting=false");
    let mutator = rt.bind_mutator(rt.system_group());
    let zone = mutator.zone();

    let mut keep_root: Option<CellRef> = Some(mm::new_string(&mutator, b"keep").unwrap());
    mm::add_persistent_root(&rt, TraceKind::String, &mut keep_root);
    for i in 0..100 {
        mm::new_string(&mutator, format!("garbage-{}", i).as_bytes()).unwrap();
    }

    mm::gc(&rt, GcReason::ApiRequest);

    assert_eq!(zone.heap.live_cells(tephra::cell::AllocKind::String), 1);
    assert!(keep_root.unwrap().is_marked_any());

    mm::remove_persistent_root(&rt, &mut keep_root);
}

#[test]
fn string_length_is_preserved() {
    let rt = new_runtime_with("");
    let mutator = rt.bind_mutator(rt.system_group());
    let s = mm::new_string(&mutator, b"twelve bytes").unwrap();
    assert_eq!(s.aux_count(), 12);
    assert!(!layout::string::is_rope(s));
    assert!(layout::string::owns_buffer(s));
}
