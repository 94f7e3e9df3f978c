//! Compaction: fragmented regions shrink and every reference is forwarded.

mod common;

use common::runtime_and_mutator;
use tephra::alloc::HeapHint;
use tephra::cell::{AllocKind, CellRef, TraceKind, Value};
use tephra::driver::GcReason;
use tephra::memory_manager as mm;

/// Allocate `count` tenured 16-slot objects, chaining every `keep_every`th
/// one through slot 0 and stamping slot 1 with the object's index.
fn allocate_fragmented(
    mutator: &tephra::Mutator,
    count: usize,
    keep_every: usize,
) -> CellRef {
    let mut head_slot: Option<CellRef> = None;
    let _head_guard = mm::root_stack_slot(mutator, TraceKind::Object, &mut head_slot);
    let mut tail_slot: Option<CellRef> = None;
    let _tail_guard = mm::root_stack_slot(mutator, TraceKind::Object, &mut tail_slot);

    for i in 0..count {
        let obj = mm::new_object_with_hint(mutator, 16, HeapHint::Tenured).unwrap();
        mm::write_slot(obj, 1, Value::from_int(i as i32));
        if i % keep_every == 0 {
            match tail_slot {
                None => head_slot = Some(obj),
                Some(tail) => mm::write_slot(tail, 0, Value::from_cell(obj)),
            }
            tail_slot = Some(obj);
        }
    }
    head_slot.unwrap()
}

#[test]
fn compaction_shrinks_fragmented_regions_and_forwards_references() {
    let (rt, mutator) = runtime_and_mutator();
    let zone = mutator.zone();

    // 1000 objects of one compactable kind; every 10th survives, spread over
    // every region.
    let mut head_root: Option<CellRef> = Some(allocate_fragmented(&mutator, 1000, 10));
    mm::add_persistent_root(&rt, TraceKind::Object, &mut head_root);

    let regions_before = zone.heap.region_count(AllocKind::Object16);
    assert!(regions_before >= 2, "test needs multiple regions");

    mm::gc(&rt, GcReason::ApiRequest);

    let regions_after = zone.heap.region_count(AllocKind::Object16);
    assert!(
        regions_after < regions_before,
        "compaction should reduce {} regions",
        regions_before
    );
    assert_eq!(zone.heap.live_cells(AllocKind::Object16), 100);

    // Every held reference still dereferences to the same logical cell.
    let mut node = head_root.unwrap();
    let mut index = 0;
    loop {
        assert!(node.is_tenured());
        assert_eq!(mm::read_slot(node, 1).as_int(), index as i32);
        match mm::read_slot(node, 0).as_cell() {
            Some(next) => node = next,
            None => break,
        }
        index += 10;
    }
    assert_eq!(index, 990);

    mm::remove_persistent_root(&rt, &mut head_root);
}

#[test]
fn unique_ids_survive_relocation() {
    let (rt, mutator) = runtime_and_mutator();
    let zone = mutator.zone();

    let mut head_root: Option<CellRef> = Some(allocate_fragmented(&mutator, 800, 20));
    mm::add_persistent_root(&rt, TraceKind::Object, &mut head_root);

    let first = head_root.unwrap();
    let id = rt.cell_uid(first);
    assert!(first.has_uid());

    mm::gc(&rt, GcReason::ApiRequest);

    let moved = head_root.unwrap();
    assert_eq!(
        zone.unique_ids.lock().unwrap().get(moved),
        Some(id),
        "unique id must follow the relocated cell"
    );
    assert_eq!(rt.cell_uid(moved), id);

    mm::remove_persistent_root(&rt, &mut head_root);
}

#[test]
fn compaction_can_be_disabled() {
    let rt = common::new_runtime_with("compacting=false");
    let mutator = rt.bind_mutator(rt.system_group());
    let zone = mutator.zone();

    let mut head_root: Option<CellRef> = Some(allocate_fragmented(&mutator, 1000, 10));
    mm::add_persistent_root(&rt, TraceKind::Object, &mut head_root);
    let before = head_root.unwrap();

    mm::gc(&rt, GcReason::ApiRequest);

    // Nothing moved: the root still holds the original address.
    assert_eq!(head_root.unwrap(), before);
    assert_eq!(zone.heap.live_cells(AllocKind::Object16), 100);

    mm::remove_persistent_root(&rt, &mut head_root);
}
