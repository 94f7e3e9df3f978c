//! The polymorphic edge visitor shared by marking, tenuring, reference
//! updating, and host callback traversals.
//!
//! An [`Edge`] is the address of a slot holding a cell pointer (either a bare
//! edge word or a tagged value). Passing slot addresses rather than cell
//! pointers lets the tenuring and updating tracers rewrite the slot in place
//! when the referent moves. For each trace kind,
//! [`trace_children`](children::trace_children) emits every owned edge of a
//! cell exactly once, whatever the tracer variant.

pub mod children;

pub use self::children::trace_children;

use crate::cell::{layout, CellRef, TraceKind, Value};
use crate::util::Address;

/// The tracer variants. The concrete action taken at each edge is chosen by
/// the variant; the edge enumeration is shared.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TracerKind {
    /// Tri-color marking (the marker).
    Marking,
    /// Marking with the weak-map ephemeron table active.
    WeakMarking,
    /// Minor-GC promotion: nursery referents are copied and the edge is
    /// rewritten to the tenured copy.
    Tenuring,
    /// Post-compaction reference forwarding: edges to relocated cells are
    /// rewritten through the forwarding overlay.
    Updating,
    /// A host-supplied callback, e.g. the cycle collector's traversal.
    Callback,
}

/// The address of a slot containing a reference to a cell.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Edge {
    /// A slot holding an optional bare cell pointer.
    Cell(Address),
    /// A slot holding a tagged value that may reference a cell.
    Value(Address),
}

impl Edge {
    /// The slot address.
    pub fn address(self) -> Address {
        match self {
            Edge::Cell(addr) | Edge::Value(addr) => addr,
        }
    }

    /// Read the referent, if the slot currently holds one.
    pub fn load(self) -> Option<CellRef> {
        match self {
            Edge::Cell(addr) => layout::read_edge(addr),
            Edge::Value(addr) => Value::from_raw(unsafe { addr.load::<usize>() }).as_cell(),
        }
    }

    /// Rewrite the slot to point at `cell`, preserving the value tag for
    /// value slots. Only meaningful if `load()` returned `Some`.
    pub fn store(self, cell: CellRef) {
        match self {
            Edge::Cell(addr) => layout::write_edge(addr, Some(cell)),
            Edge::Value(addr) => {
                let value = Value::from_raw(unsafe { addr.load::<usize>() });
                debug_assert!(value.is_cell());
                unsafe { addr.store::<usize>(value.with_cell(cell).raw()) }
            }
        }
    }
}

/// The edge visitor. Implemented by the marker, the tenuring tracer, the
/// compaction updater, and the callback adapter.
pub trait Tracer {
    /// Which variant this is. Dispatch sites occasionally specialize on it
    /// (e.g. the marker's eager string walk).
    fn kind(&self) -> TracerKind;

    /// Visit one edge. `trace_kind` is the referent's trace kind as known to
    /// the layout; `name` labels the edge for debugging.
    fn on_edge(&mut self, edge: Edge, trace_kind: TraceKind, name: &'static str);
}

/// Adapter presenting a host callback pair as a tracer.
pub struct CallbackTracer<'a> {
    callback: &'a mut dyn FnMut(Edge, TraceKind, &'static str),
}

impl<'a> CallbackTracer<'a> {
    pub fn new(callback: &'a mut dyn FnMut(Edge, TraceKind, &'static str)) -> Self {
        Self { callback }
    }
}

impl Tracer for CallbackTracer<'_> {
    fn kind(&self) -> TracerKind {
        TracerKind::Callback
    }

    fn on_edge(&mut self, edge: Edge, trace_kind: TraceKind, name: &'static str) {
        (self.callback)(edge, trace_kind, name)
    }
}
