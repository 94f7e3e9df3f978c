//! The root set: stack roots, persistent roots, and embedder-registered
//! tracer callbacks.
//!
//! Roots are registered as slot addresses so that tracers which move cells
//! (tenuring, compaction updating) can rewrite the root in place. Tracing the
//! roots requires the heap-busy token, and visits every root exactly once in
//! registration order.

use std::sync::{Arc, Mutex, Weak};

use crate::cell::{CellRef, TraceKind};
use crate::trace::{Edge, Tracer};
use crate::util::Address;

/// Whether the roots are being visited to mark them or merely to enumerate
/// them (e.g. for a host heap dump). Passed through to embedder callbacks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RootTraceMode {
    Marking,
    Tracing,
}

/// An embedder-registered root tracing callback.
pub type EmbedderTracerFn = Box<dyn Fn(&mut dyn Tracer, RootTraceMode) + Send + Sync>;

struct RootSlot {
    slot: Address,
    kind: TraceKind,
}

/// The scope-bound stack roots of one mutator thread. Slots are pushed and
/// popped in LIFO order by RAII guards.
pub struct StackRoots {
    slots: Mutex<Vec<RootSlot>>,
}

impl StackRoots {
    pub(crate) fn new() -> Arc<StackRoots> {
        Arc::new(StackRoots {
            slots: Mutex::new(Vec::new()),
        })
    }

    /// Register the address of a `Option<CellRef>` slot as a root until the
    /// returned guard drops.
    pub fn push(self: &Arc<Self>, kind: TraceKind, slot: Address) -> StackRootGuard {
        let mut slots = self.slots.lock().unwrap();
        slots.push(RootSlot { slot, kind });
        StackRootGuard {
            roots: self.clone(),
            index: slots.len() - 1,
        }
    }

    fn visit(&self, tracer: &mut dyn Tracer) {
        for root in self.slots.lock().unwrap().iter() {
            let edge = Edge::Cell(root.slot);
            if edge.load().is_some() {
                tracer.on_edge(edge, root.kind, "stackRoot");
            }
        }
    }

    /// Every currently rooted cell, for the verifiers.
    pub fn rooted_cells(&self) -> Vec<CellRef> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| Edge::Cell(r.slot).load())
            .collect()
    }
}

/// RAII guard unregistering a stack root on drop.
pub struct StackRootGuard {
    roots: Arc<StackRoots>,
    index: usize,
}

impl Drop for StackRootGuard {
    fn drop(&mut self) {
        let mut slots = self.roots.slots.lock().unwrap();
        assert_eq!(
            slots.len(),
            self.index + 1,
            "stack roots must be released in LIFO order"
        );
        slots.pop();
    }
}

/// The runtime's root registries.
pub struct RootSet {
    persistent: Mutex<Vec<RootSlot>>,
    stack_lists: Mutex<Vec<Weak<StackRoots>>>,
    black_tracers: Mutex<Vec<EmbedderTracerFn>>,
    gray_tracer: Mutex<Option<EmbedderTracerFn>>,
}

impl RootSet {
    pub(crate) fn new() -> Self {
        Self {
            persistent: Mutex::new(Vec::new()),
            stack_lists: Mutex::new(Vec::new()),
            black_tracers: Mutex::new(Vec::new()),
            gray_tracer: Mutex::new(None),
        }
    }

    /// Register a long-lived root slot. The slot is visited on every root
    /// trace until removed.
    pub fn add_persistent(&self, kind: TraceKind, slot: Address) {
        self.persistent.lock().unwrap().push(RootSlot { slot, kind });
    }

    /// Unregister a persistent root slot.
    pub fn remove_persistent(&self, slot: Address) {
        self.persistent.lock().unwrap().retain(|r| r.slot != slot);
    }

    pub(crate) fn register_stack_roots(&self, roots: &Arc<StackRoots>) {
        self.stack_lists.lock().unwrap().push(Arc::downgrade(roots));
    }

    /// Register a black (strong) root tracing callback.
    pub fn add_black_tracer(&self, tracer: EmbedderTracerFn) {
        self.black_tracers.lock().unwrap().push(tracer);
    }

    /// Install the gray root tracing callback (the cycle collector's roots).
    pub fn set_gray_tracer(&self, tracer: EmbedderTracerFn) {
        *self.gray_tracer.lock().unwrap() = Some(tracer);
    }

    /// Visit every black root exactly once, in registration order:
    /// persistent roots, then each thread's stack roots, then the embedder
    /// callbacks. The caller must hold the heap-busy token.
    pub fn trace_roots(&self, tracer: &mut dyn Tracer, mode: RootTraceMode) {
        for root in self.persistent.lock().unwrap().iter() {
            let edge = Edge::Cell(root.slot);
            if edge.load().is_some() {
                tracer.on_edge(edge, root.kind, "persistentRoot");
            }
        }
        let stack_lists = self.stack_lists.lock().unwrap();
        for list in stack_lists.iter() {
            if let Some(list) = list.upgrade() {
                list.visit(tracer);
            }
        }
        for callback in self.black_tracers.lock().unwrap().iter() {
            callback(tracer, mode);
        }
    }

    /// Invoke the gray root callback, if any. Run when marking finishes, so
    /// cycle-collector roots end up gray rather than black.
    pub fn trace_gray_roots(&self, tracer: &mut dyn Tracer) {
        if let Some(callback) = self.gray_tracer.lock().unwrap().as_ref() {
            callback(tracer, RootTraceMode::Marking);
        }
    }

    /// Drop stack-root lists whose mutators are gone.
    pub(crate) fn prune_dead_mutators(&self) {
        self.stack_lists
            .lock()
            .unwrap()
            .retain(|w| w.upgrade().is_some());
    }

    /// Every currently registered root cell. Used by the verifiers and
    /// tests.
    pub fn all_rooted_cells(&self) -> Vec<CellRef> {
        let mut cells = Vec::new();
        for root in self.persistent.lock().unwrap().iter() {
            if let Some(cell) = Edge::Cell(root.slot).load() {
                cells.push(cell);
            }
        }
        for list in self.stack_lists.lock().unwrap().iter() {
            if let Some(list) = list.upgrade() {
                cells.extend(list.rooted_cells());
            }
        }
        cells
    }
}
