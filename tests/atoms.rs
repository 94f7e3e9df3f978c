//! Atom interning and cross-zone atom liveness.

mod common;

use common::new_runtime_with;
use tephra::alloc::HeapHint;
use tephra::cell::{CellRef, TraceKind, Value};
use tephra::driver::GcReason;
use tephra::memory_manager as mm;
use tephra::ZoneSpec;

#[test]
fn interning_is_idempotent() {
    let rt = new_runtime_with("compacting=false");
    let a = rt.intern_atom(b"lambda");
    let b = rt.intern_atom(b"lambda");
    assert_eq!(a, b);
    assert_eq!(rt.atom_count(), 1);
}

#[test]
fn referenced_atoms_survive_a_full_collection() {
    let rt = new_runtime_with("compacting=false");
    let mutator = rt.bind_mutator(rt.system_group());

    let kept = rt.intern_atom_in(&mutator, b"kept");
    let _dropped = rt.intern_atom(b"dropped");
    let permanent = rt.intern_permanent_atom(b"permanent");
    assert_eq!(rt.atom_count(), 3);

    // Reference the kept atom from a rooted object.
    let holder = mm::new_object_with_hint(&mutator, 2, HeapHint::Tenured).unwrap();
    let mut holder_root: Option<CellRef> = Some(holder);
    mm::add_persistent_root(&rt, TraceKind::Object, &mut holder_root);
    mm::write_slot(holder, 0, Value::from_cell(kept));

    mm::gc(&rt, GcReason::ApiRequest);

    assert_eq!(rt.atom_count(), 2, "only the unreferenced atom dies");
    assert_eq!(mm::read_slot(holder, 0).as_cell(), Some(kept));
    assert!(permanent.is_permanent());

    mm::remove_persistent_root(&rt, &mut holder_root);
}

#[test]
fn atoms_referenced_by_uncollected_zones_survive_through_the_bitmap() {
    let rt = new_runtime_with("compacting=false");
    let mutator = rt.bind_mutator(rt.system_group());

    // A second group that will not take part in the collection below.
    let (group2, _zone2, _comp2) = mm::new_compartment(&rt, ZoneSpec::NewZoneInNewGroup);
    let mutator2 = rt.bind_mutator(group2);

    let foreign = rt.intern_atom_in(&mutator2, b"foreign");
    let holder2 = mm::new_object_with_hint(&mutator2, 2, HeapHint::Tenured).unwrap();
    let mut holder2_root: Option<CellRef> = Some(holder2);
    mm::add_persistent_root(&rt, TraceKind::Object, &mut holder2_root);
    mm::write_slot(holder2, 0, Value::from_cell(foreign));

    // Collect the system group (and with it the atoms zone). The foreign
    // atom is named only by the uncollected zone's bitmap, which must keep
    // it alive.
    rt.gc_group(rt.system_group(), GcReason::ApiRequest);

    assert_eq!(rt.atom_count(), 1);
    assert_eq!(mm::read_slot(holder2, 0).as_cell(), Some(foreign));

    mm::remove_persistent_root(&rt, &mut holder2_root);
    drop(mutator2);
    drop(mutator);
}

#[test]
fn well_known_symbols_are_permanent() {
    let rt = new_runtime_with("compacting=false");
    let symbol = rt.new_well_known_symbol(b"iterator");
    assert!(symbol.is_permanent());

    mm::gc(&rt, GcReason::ApiRequest);
    // Permanent cells are skipped by collection wholesale; the description
    // atom is permanent too and the symbol still reaches it.
    let description =
        tephra::cell::layout::symbol::description(symbol).expect("description survives");
    assert!(description.is_permanent());
}
