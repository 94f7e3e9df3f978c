//! Weak maps and the weak-marking table.
//!
//! A weak map is owned by an ordinary object cell; the entries live off-heap
//! and are visible to the collector only through the owning zone's weak map
//! list. During a minor collection entries are traced strongly (the nursery
//! is too short-lived for ephemeron semantics to pay for itself). During
//! major marking, weak-marking mode applies ephemeron propagation: an entry's
//! value is marked only once its key is, driven by the `WeakKeyTable`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::cell::{forwarding, CellRef, MarkColor, Value};
use crate::trace::{Edge, Tracer};
use crate::util::Address;

/// The off-heap payload of one weak map.
pub struct WeakMapData {
    /// The owning object cell. The map's entries are live only while the
    /// owner is.
    pub owner: CellRef,
    /// key -> value. Keys are weak; values are kept alive by live keys.
    pub entries: HashMap<CellRef, Value>,
}

/// A handle to a weak map, shared between the host and the owning zone's
/// weak map list.
#[derive(Clone)]
pub struct WeakMapHandle {
    data: Arc<Mutex<WeakMapData>>,
}

impl WeakMapHandle {
    pub(crate) fn new(owner: CellRef) -> WeakMapHandle {
        WeakMapHandle {
            data: Arc::new(Mutex::new(WeakMapData {
                owner,
                entries: HashMap::new(),
            })),
        }
    }

    pub fn owner(&self) -> CellRef {
        self.data.lock().unwrap().owner
    }

    pub(crate) fn set_owner(&self, owner: CellRef) {
        self.data.lock().unwrap().owner = owner;
    }

    /// Insert or overwrite an entry. The caller is responsible for the write
    /// barriers (the public API in `memory_manager` wraps this).
    pub fn set(&self, key: CellRef, value: Value) {
        self.data.lock().unwrap().entries.insert(key, value);
    }

    /// Look up an entry.
    pub fn get(&self, key: CellRef) -> Option<Value> {
        self.data.lock().unwrap().entries.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Trace every key and value strongly, rewriting moved referents in
    /// place. Used by the minor collector and by compaction updating.
    pub(crate) fn trace_strongly(&self, tracer: &mut dyn Tracer) {
        let mut data = self.data.lock().unwrap();
        {
            let mut owner_slot: Option<CellRef> = Some(data.owner);
            let owner_edge = Edge::Cell(Address::from_mut_ptr(&mut owner_slot));
            let owner_kind = forwarding::maybe_forwarded(data.owner).trace_kind();
            tracer.on_edge(owner_edge, owner_kind, "weakMapOwner");
            data.owner = owner_slot.expect("weak map owner dropped by tracer");
        }
        let entries = std::mem::take(&mut data.entries);
        for (key, value) in entries {
            let mut key_slot: Option<CellRef> = Some(key);
            let mut value_slot: usize = value.raw();
            {
                let key_edge = Edge::Cell(Address::from_mut_ptr(&mut key_slot));
                let key_kind = forwarding::maybe_forwarded(key).trace_kind();
                tracer.on_edge(key_edge, key_kind, "weakMapKey");
            }
            if let Some(value_cell) = value.as_cell() {
                let value_edge = Edge::Value(Address::from_mut_ptr(&mut value_slot));
                let value_kind = forwarding::maybe_forwarded(value_cell).trace_kind();
                tracer.on_edge(value_edge, value_kind, "weakMapValue");
            }
            let key = key_slot.expect("weak map key dropped by tracer");
            data.entries.insert(key, Value::from_raw(value_slot));
        }
    }

    /// Apply ephemeron marking for this map: values of already-marked keys
    /// are marked through `mark_value`; unmarked keys are registered in the
    /// table so a later marking of the key propagates to the value.
    pub(crate) fn enter_weak_marking(
        &self,
        table: &mut WeakKeyTable,
        mut mark_value: impl FnMut(CellRef),
    ) {
        let data = self.data.lock().unwrap();
        for (&key, &value) in &data.entries {
            if key.is_marked(MarkColor::Black) {
                if let Some(value_cell) = value.as_cell() {
                    mark_value(value_cell);
                }
            } else {
                table.register(key, self.clone());
            }
        }
    }

    /// The value for `key`, if the map still has the entry. Called when a
    /// registered key gets marked.
    pub(crate) fn value_for(&self, key: CellRef) -> Option<Value> {
        self.data.lock().unwrap().entries.get(&key).copied()
    }

    /// Drop entries whose key died. Returns the number of surviving entries.
    pub(crate) fn sweep(&self, is_live: impl Fn(CellRef) -> bool) -> usize {
        let mut data = self.data.lock().unwrap();
        data.entries.retain(|key, _| is_live(*key));
        data.entries.len()
    }

    /// Rewrite keys, values, and the owner through a forwarding function
    /// after compaction.
    pub(crate) fn fixup(&self, forward: impl Fn(CellRef) -> CellRef) {
        let mut data = self.data.lock().unwrap();
        data.owner = forward(data.owner);
        let entries = std::mem::take(&mut data.entries);
        for (key, value) in entries {
            let value = match value.as_cell() {
                Some(cell) => value.with_cell(forward(cell)),
                None => value,
            };
            data.entries.insert(forward(key), value);
        }
    }
}

/// The weak-marking table: unmarked weak-map key -> the maps waiting on it.
/// While weak-marking mode is active, marking any cell consults this table
/// and eagerly propagates to the values it unblocks.
#[derive(Default)]
pub struct WeakKeyTable {
    waiting: HashMap<CellRef, Vec<WeakMapHandle>>,
}

impl WeakKeyTable {
    pub fn new() -> WeakKeyTable {
        WeakKeyTable::default()
    }

    fn register(&mut self, key: CellRef, map: WeakMapHandle) {
        self.waiting.entry(key).or_default().push(map);
    }

    /// A key was just marked: return the values that became reachable.
    pub fn key_marked(&mut self, key: CellRef) -> Vec<CellRef> {
        let mut values = Vec::new();
        if let Some(maps) = self.waiting.remove(&key) {
            for map in maps {
                if let Some(value) = map.value_for(key) {
                    if let Some(cell) = value.as_cell() {
                        values.push(cell);
                    }
                }
            }
        }
        values
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    pub fn clear(&mut self) {
        self.waiting.clear();
    }
}
