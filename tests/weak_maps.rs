//! Weak map semantics: ephemeron marking and sweeping.

mod common;

use common::new_runtime_with;
use tephra::alloc::HeapHint;
use tephra::cell::{CellRef, MarkColor, TraceKind, Value};
use tephra::driver::GcReason;
use tephra::memory_manager as mm;

#[test]
fn half_dead_weak_map_keeps_exactly_the_live_half() {
    let rt = new_runtime_with("compacting=false");
    let mutator = rt.bind_mutator(rt.system_group());

    let owner = mm::new_object_with_hint(&mutator, 0, HeapHint::Tenured).unwrap();
    let mut owner_root: Option<CellRef> = Some(owner);
    mm::add_persistent_root(&rt, TraceKind::Object, &mut owner_root);
    let map = mm::new_weak_map(&rt, owner);

    // 100 entries; the even-indexed keys are kept alive through a rooted
    // holder chain, the odd ones are garbage. Values are objects reachable
    // only through the map.
    let mut kept_keys: Vec<CellRef> = Vec::new();
    let mut dead_keys: Vec<CellRef> = Vec::new();
    {
        let mut chain_slot: Option<CellRef> = None;
        let _chain_guard = mm::root_stack_slot(&mutator, TraceKind::Object, &mut chain_slot);
        for i in 0..100 {
            let key = mm::new_object_with_hint(&mutator, 2, HeapHint::Tenured).unwrap();
            let value = mm::new_object_with_hint(&mutator, 2, HeapHint::Tenured).unwrap();
            mm::write_slot(value, 1, Value::from_int(i));
            map.set(key, Value::from_cell(value));
            if i % 2 == 0 {
                // Link the key into the rooted chain.
                if let Some(prev) = chain_slot {
                    mm::write_slot(key, 0, Value::from_cell(prev));
                }
                chain_slot = Some(key);
                kept_keys.push(key);
            } else {
                dead_keys.push(key);
            }
        }
        // Move the chain into a persistent root before the guard drops.
        let mut chain_root: Option<CellRef> = chain_slot;
        mm::add_persistent_root(&rt, TraceKind::Object, &mut chain_root);
        assert_eq!(map.len(), 100);

        mm::gc(&rt, GcReason::ApiRequest);

        // Exactly the 50 live keys survive, with their values.
        assert_eq!(map.len(), 50);
        for (i, key) in kept_keys.iter().enumerate() {
            let value = map
                .get(*key)
                .unwrap_or_else(|| panic!("live key {} lost its entry", i))
                .as_cell()
                .unwrap();
            assert!(value.is_marked_any(), "ephemeron value not marked");
            assert_eq!(mm::read_slot(value, 1).as_int(), (i * 2) as i32);
        }
        for key in &dead_keys {
            assert_eq!(map.get(*key), None);
        }

        mm::remove_persistent_root(&rt, &mut chain_root);
    }

    mm::remove_persistent_root(&rt, &mut owner_root);
}

#[test]
fn registered_weak_caches_are_swept_with_the_zone() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tephra::zone::WeakCache;

    struct HostCache {
        entries: Vec<CellRef>,
        survivors: Arc<AtomicUsize>,
    }
    impl WeakCache for HostCache {
        fn sweep(&mut self, is_live: &dyn Fn(CellRef) -> bool) {
            self.entries.retain(|c| is_live(*c));
            self.survivors.store(self.entries.len(), Ordering::Relaxed);
        }
    }

    let rt = new_runtime_with("compacting=false");
    let mutator = rt.bind_mutator(rt.system_group());
    let zone = mutator.zone();

    let live = mm::new_object_with_hint(&mutator, 0, HeapHint::Tenured).unwrap();
    let mut live_root: Option<CellRef> = Some(live);
    mm::add_persistent_root(&rt, TraceKind::Object, &mut live_root);
    let dead = mm::new_object_with_hint(&mutator, 0, HeapHint::Tenured).unwrap();

    let survivors = Arc::new(AtomicUsize::new(0));
    zone.register_weak_cache(Box::new(HostCache {
        entries: vec![live, dead],
        survivors: survivors.clone(),
    }));

    mm::gc(&rt, GcReason::ApiRequest);
    assert_eq!(survivors.load(Ordering::Relaxed), 1);

    mm::remove_persistent_root(&rt, &mut live_root);
}

#[test]
fn weak_map_dies_with_its_owner() {
    let rt = new_runtime_with("compacting=false");
    let mutator = rt.bind_mutator(rt.system_group());
    let zone = mutator.zone();

    let owner = mm::new_object_with_hint(&mutator, 0, HeapHint::Tenured).unwrap();
    let map = mm::new_weak_map(&rt, owner);

    let mut key_root: Option<CellRef> =
        Some(mm::new_object_with_hint(&mutator, 0, HeapHint::Tenured).unwrap());
    mm::add_persistent_root(&rt, TraceKind::Object, &mut key_root);
    map.set(key_root.unwrap(), Value::from_int(7));

    assert_eq!(zone.weak_maps.lock().unwrap().len(), 1);
    // The owner is unreachable: the map is dropped from the zone wholesale,
    // live key or not.
    mm::gc(&rt, GcReason::ApiRequest);
    assert_eq!(zone.weak_maps.lock().unwrap().len(), 0);

    mm::remove_persistent_root(&rt, &mut key_root);
}

#[test]
fn entries_added_through_a_live_key_mark_their_values() {
    let rt = new_runtime_with("compacting=false");
    let mutator = rt.bind_mutator(rt.system_group());

    let owner = mm::new_object_with_hint(&mutator, 0, HeapHint::Tenured).unwrap();
    let mut owner_root: Option<CellRef> = Some(owner);
    mm::add_persistent_root(&rt, TraceKind::Object, &mut owner_root);
    let map = mm::new_weak_map(&rt, owner);

    // Key reachable, value reachable only through the map: ephemeron
    // marking must keep the value, black.
    let mut key_root: Option<CellRef> =
        Some(mm::new_object_with_hint(&mutator, 0, HeapHint::Tenured).unwrap());
    mm::add_persistent_root(&rt, TraceKind::Object, &mut key_root);
    let value = mm::new_object_with_hint(&mutator, 0, HeapHint::Tenured).unwrap();
    map.set(key_root.unwrap(), Value::from_cell(value));

    mm::gc(&rt, GcReason::ApiRequest);

    assert!(value.is_marked(MarkColor::Black));
    assert_eq!(map.get(key_root.unwrap()).unwrap().as_cell(), Some(value));

    mm::remove_persistent_root(&rt, &mut key_root);
    mm::remove_persistent_root(&rt, &mut owner_root);
}
