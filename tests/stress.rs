//! Deterministic random-graph stress: interleaved allocation, mutation,
//! minor collections, incremental slices, and full collections, with the
//! heap only ever reached through a rooted table so moving collections stay
//! observable.

mod common;

use common::new_runtime;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tephra::budget::SliceBudget;
use tephra::cell::{CellRef, TraceKind, Value};
use tephra::driver::GcReason;
use tephra::memory_manager as mm;

const TABLE_SLOTS: usize = 16;
const ITERATIONS: usize = 4000;

#[test]
fn random_mutation_stress() {
    let rt = new_runtime();
    let mutator = rt.bind_mutator(rt.system_group());
    let mut rng = ChaCha8Rng::seed_from_u64(0x7e9a_51ab);

    let table = mm::new_object_with_hint(&mutator, TABLE_SLOTS, tephra::alloc::HeapHint::Tenured)
        .unwrap();
    let mut table_root: Option<CellRef> = Some(table);
    mm::add_persistent_root(&rt, TraceKind::Object, &mut table_root);

    for i in 0..ITERATIONS {
        let table = table_root.unwrap();
        match rng.random_range(0..100) {
            // Allocate a fresh object into a random table slot.
            0..=49 => {
                let obj = mm::new_object(&mutator, 2).unwrap();
                mm::write_slot(obj, 1, Value::from_int(i as i32));
                // The allocation may have run a moving collection; reload
                // the table through its root.
                let table = table_root.unwrap();
                let slot = rng.random_range(0..TABLE_SLOTS);
                mm::write_slot(table, slot, Value::from_cell(obj));
            }
            // Link two random table entries together.
            50..=69 => {
                let a = mm::read_slot(table, rng.random_range(0..TABLE_SLOTS)).as_cell();
                let b = mm::read_slot(table, rng.random_range(0..TABLE_SLOTS)).as_cell();
                if let (Some(a), Some(b)) = (a, b) {
                    mm::write_slot(a, 0, Value::from_cell(b));
                }
            }
            // Drop a random table entry.
            70..=79 => {
                let slot = rng.random_range(0..TABLE_SLOTS);
                mm::write_slot(table, slot, Value::UNDEFINED);
            }
            // Collector activity.
            80..=89 => mm::evict_nursery(&rt, GcReason::ApiRequest),
            90..=96 => mm::start_gc(
                &rt,
                rt.system_group(),
                GcReason::ApiRequest,
                SliceBudget::work(200),
            ),
            _ => mm::gc(&rt, GcReason::ApiRequest),
        }
    }
    mm::finish_gc(&rt, GcReason::Finish);
    mm::gc(&rt, GcReason::ApiRequest);

    // The reachable graph is intact: every edge from the table leads to a
    // well-formed object cell.
    let table = table_root.unwrap();
    let mut stack: Vec<CellRef> = vec![table];
    let mut seen = std::collections::HashSet::new();
    seen.insert(table);
    while let Some(obj) = stack.pop() {
        assert!(obj.kind().is_object());
        assert!(obj.is_tenured() || obj.is_nursery());
        for i in 0..tephra::cell::layout::object::slot_count(obj) {
            if let Some(child) = mm::read_slot(obj, i).as_cell() {
                if child.kind().is_object() && seen.insert(child) {
                    stack.push(child);
                }
            }
        }
    }
    assert!(seen.len() > 1, "the table kept some of its entries");

    mm::remove_persistent_root(&rt, &mut table_root);
}
