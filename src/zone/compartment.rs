//! Compartments: security/isolation scopes within a zone, and the unit of
//! cross-zone reference accounting.
//!
//! An edge from one compartment to another must go through a cross
//! compartment wrapper registered in the source compartment's wrapper map.
//! The map keys are the wrapped (target) cells; the values are the wrapper
//! objects living in this compartment. The marker consults these maps to
//! build the inter-zone edge graph for sweep grouping, and appends to the
//! target compartment's incoming-gray list when a cross-group edge would mark
//! gray.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::cell::CellRef;

use super::Zone;

static NEXT_COMPARTMENT_ID: AtomicUsize = AtomicUsize::new(1);

/// A security scope within a zone.
pub struct Compartment {
    id: usize,
    /// The owning zone. Compartments never migrate between zones.
    zone: *const Zone,
    /// target cell (in some other compartment) -> wrapper object (in this
    /// compartment).
    wrappers: Mutex<HashMap<CellRef, CellRef>>,
    /// Wrappers in *other* compartments pointing at gray cells in this one.
    /// Filled during marking, drained after each slice.
    incoming_gray: Mutex<Vec<CellRef>>,
    /// Lazily created default (shape, group) pair for plain objects.
    defaults: Mutex<Option<(CellRef, CellRef)>>,
}

unsafe impl Send for Compartment {}
unsafe impl Sync for Compartment {}

impl Compartment {
    pub(crate) fn new(zone: &Arc<Zone>) -> Arc<Compartment> {
        let compartment = Arc::new(Compartment {
            id: NEXT_COMPARTMENT_ID.fetch_add(1, Ordering::Relaxed),
            zone: Arc::as_ptr(zone),
            wrappers: Mutex::new(HashMap::new()),
            incoming_gray: Mutex::new(Vec::new()),
            defaults: Mutex::new(None),
        });
        zone.add_compartment(compartment.clone());
        compartment
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// The owning zone.
    pub fn zone(&self) -> &Zone {
        unsafe { &*self.zone }
    }

    /// Register a cross-compartment wrapper: `wrapper` lives in this
    /// compartment and stands for `target` in another one.
    pub fn put_wrapper(&self, target: CellRef, wrapper: CellRef) {
        debug_assert!(target != wrapper);
        self.wrappers.lock().unwrap().insert(target, wrapper);
    }

    /// The wrapper for `target`, if one exists.
    pub fn lookup_wrapper(&self, target: CellRef) -> Option<CellRef> {
        self.wrappers.lock().unwrap().get(&target).copied()
    }

    /// Snapshot of the wrapper map: `(target, wrapper)` pairs.
    pub fn wrapper_entries(&self) -> Vec<(CellRef, CellRef)> {
        self.wrappers
            .lock()
            .unwrap()
            .iter()
            .map(|(t, w)| (*t, *w))
            .collect()
    }

    /// Drop wrapper entries whose target or wrapper died, and rekey targets
    /// that were relocated.
    pub fn sweep_wrappers(&self, is_live: impl Fn(CellRef) -> bool) {
        self.wrappers
            .lock()
            .unwrap()
            .retain(|target, wrapper| is_live(*target) && is_live(*wrapper));
    }

    /// Rewrite wrapper-map keys and values after compaction.
    pub fn fixup_wrappers(&self, forward: impl Fn(CellRef) -> CellRef) {
        let mut map = self.wrappers.lock().unwrap();
        let entries: Vec<(CellRef, CellRef)> = map.drain().collect();
        for (target, wrapper) in entries {
            map.insert(forward(target), forward(wrapper));
        }
    }

    /// Record a wrapper in another compartment that points at a gray cell in
    /// this compartment.
    pub fn push_incoming_gray(&self, wrapper: CellRef) {
        self.incoming_gray.lock().unwrap().push(wrapper);
    }

    /// Take and clear the incoming-gray list. Traversed after each slice.
    pub fn take_incoming_gray(&self) -> Vec<CellRef> {
        std::mem::take(&mut *self.incoming_gray.lock().unwrap())
    }

    pub fn has_incoming_gray(&self) -> bool {
        !self.incoming_gray.lock().unwrap().is_empty()
    }

    /// Rewrite relocated wrappers waiting on the incoming-gray list.
    pub(crate) fn fixup_incoming_gray(&self, forward: impl Fn(CellRef) -> CellRef) {
        for wrapper in self.incoming_gray.lock().unwrap().iter_mut() {
            *wrapper = forward(*wrapper);
        }
    }

    /// The cached default (shape, group) pair, if present.
    pub(crate) fn peek_defaults(&self) -> Option<(CellRef, CellRef)> {
        *self.defaults.lock().unwrap()
    }

    /// Install the default (shape, group) pair if none is cached, returning
    /// whatever ends up cached. The caller must not hold GC locks: the pair
    /// is created (and rooted) before this is called.
    pub(crate) fn install_defaults(&self, pair: (CellRef, CellRef)) -> (CellRef, CellRef) {
        let mut defaults = self.defaults.lock().unwrap();
        if defaults.is_none() {
            *defaults = Some(pair);
        }
        defaults.unwrap()
    }

    /// Rewrite the cached defaults after compaction.
    pub(crate) fn fixup_defaults(&self, forward: impl Fn(CellRef) -> CellRef) {
        let mut defaults = self.defaults.lock().unwrap();
        if let Some((shape, group)) = *defaults {
            *defaults = Some((forward(shape), forward(group)));
        }
    }

    /// Drop the cached defaults if they died.
    pub(crate) fn sweep_defaults(&self, is_live: impl Fn(CellRef) -> bool) {
        let mut defaults = self.defaults.lock().unwrap();
        if let Some((shape, group)) = *defaults {
            if !is_live(shape) || !is_live(group) {
                *defaults = None;
            }
        }
    }
}

impl std::fmt::Debug for Compartment {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Compartment")
            .field("id", &self.id)
            .field("zone", &self.zone().id())
            .finish()
    }
}
