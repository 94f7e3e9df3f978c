//! Per-kind child tracing.
//!
//! One free function per trace kind, chosen from the cell's kind tag. Each
//! emits every owned edge of the cell exactly once, in layout order, and
//! behaves identically whichever tracer variant is attached. Empty slots are
//! not reported.

use super::{Edge, Tracer};
use crate::cell::layout::{self, word_address};
use crate::cell::{forwarding, CellRef, TraceKind};

/// Visit every owned edge of `cell`.
pub fn trace_children(cell: CellRef, tracer: &mut dyn Tracer) {
    match cell.trace_kind() {
        TraceKind::Object => trace_object(cell, tracer),
        TraceKind::String => trace_string(cell, tracer),
        TraceKind::ExternalString => {} // no owned edges; data is host memory
        TraceKind::Atom => {}           // atoms are leaves
        TraceKind::Symbol => trace_symbol(cell, tracer),
        TraceKind::Script => trace_script(cell, tracer),
        TraceKind::LazyScript => trace_lazy_script(cell, tracer),
        TraceKind::Shape => trace_shape(cell, tracer),
        TraceKind::AccessorShape => trace_accessor_shape(cell, tracer),
        TraceKind::BaseShape => trace_base_shape(cell, tracer),
        TraceKind::ObjectGroup => trace_object_group(cell, tracer),
        TraceKind::JitCode => trace_jit_code(cell, tracer),
        TraceKind::Scope => trace_scope(cell, tracer),
        TraceKind::RegExpShared => trace_regexp_shared(cell, tracer),
    }
}

fn emit_cell_edge(
    tracer: &mut dyn Tracer,
    cell: CellRef,
    word: usize,
    kind: TraceKind,
    name: &'static str,
) {
    let addr = word_address(cell, word);
    if layout::read_edge(addr).is_some() {
        tracer.on_edge(Edge::Cell(addr), kind, name);
    }
}

fn trace_object(obj: CellRef, tracer: &mut dyn Tracer) {
    emit_cell_edge(tracer, obj, layout::object::SHAPE_WORD, TraceKind::Shape, "shape");
    emit_cell_edge(
        tracer,
        obj,
        layout::object::GROUP_WORD,
        TraceKind::ObjectGroup,
        "group",
    );
    let (first, count) = layout::object::slots_range(obj);
    for i in 0..count {
        let addr = first + i * crate::util::constants::BYTES_IN_WORD;
        let value = crate::cell::Value::from_raw(unsafe { addr.load::<usize>() });
        if let Some(target) = value.as_cell() {
            // The referent may have been relocated already; its kind must be
            // read through the overlay.
            let kind = forwarding::maybe_forwarded(target).trace_kind();
            tracer.on_edge(Edge::Value(addr), kind, "slot");
        }
    }
}

fn trace_string(s: CellRef, tracer: &mut dyn Tracer) {
    if layout::string::is_rope(s) {
        tracer.on_edge(
            Edge::Cell(layout::string::left_address(s)),
            TraceKind::String,
            "left",
        );
        tracer.on_edge(
            Edge::Cell(layout::string::right_address(s)),
            TraceKind::String,
            "right",
        );
    }
}

fn trace_symbol(sym: CellRef, tracer: &mut dyn Tracer) {
    emit_cell_edge(
        tracer,
        sym,
        layout::symbol::DESCRIPTION_WORD,
        TraceKind::Atom,
        "description",
    );
}

fn trace_script(script: CellRef, tracer: &mut dyn Tracer) {
    emit_cell_edge(
        tracer,
        script,
        layout::script::SCOPE_WORD,
        TraceKind::Scope,
        "scope",
    );
    emit_cell_edge(
        tracer,
        script,
        layout::script::SOURCE_WORD,
        TraceKind::Atom,
        "source",
    );
    emit_cell_edge(
        tracer,
        script,
        layout::script::LAZY_WORD,
        TraceKind::LazyScript,
        "lazyScript",
    );
}

fn trace_lazy_script(lazy: CellRef, tracer: &mut dyn Tracer) {
    emit_cell_edge(
        tracer,
        lazy,
        layout::lazy_script::SCRIPT_WORD,
        TraceKind::Script,
        "script",
    );
    emit_cell_edge(
        tracer,
        lazy,
        layout::lazy_script::SCOPE_WORD,
        TraceKind::Scope,
        "scope",
    );
    emit_cell_edge(
        tracer,
        lazy,
        layout::lazy_script::SOURCE_WORD,
        TraceKind::Atom,
        "source",
    );
}

fn trace_shape(shape: CellRef, tracer: &mut dyn Tracer) {
    emit_cell_edge(
        tracer,
        shape,
        layout::shape::BASE_WORD,
        TraceKind::BaseShape,
        "base",
    );
    emit_cell_edge(
        tracer,
        shape,
        layout::shape::PARENT_WORD,
        TraceKind::Shape,
        "parent",
    );
    emit_cell_edge(
        tracer,
        shape,
        layout::shape::PROP_ATOM_WORD,
        TraceKind::Atom,
        "propertyAtom",
    );
}

fn trace_accessor_shape(shape: CellRef, tracer: &mut dyn Tracer) {
    trace_shape(shape, tracer);
    emit_cell_edge(
        tracer,
        shape,
        layout::shape::GETTER_WORD,
        TraceKind::Object,
        "getter",
    );
    emit_cell_edge(
        tracer,
        shape,
        layout::shape::SETTER_WORD,
        TraceKind::Object,
        "setter",
    );
}

fn trace_base_shape(base: CellRef, tracer: &mut dyn Tracer) {
    emit_cell_edge(
        tracer,
        base,
        layout::base_shape::UNOWNED_WORD,
        TraceKind::BaseShape,
        "unowned",
    );
}

fn trace_object_group(group: CellRef, tracer: &mut dyn Tracer) {
    let proto = layout::group::proto(group);
    if let Some(target) = proto.as_cell() {
        let kind = forwarding::maybe_forwarded(target).trace_kind();
        tracer.on_edge(Edge::Value(layout::group::proto_address(group)), kind, "proto");
    }
}

fn trace_jit_code(code: CellRef, tracer: &mut dyn Tracer) {
    emit_cell_edge(
        tracer,
        code,
        layout::jit_code::SCRIPT_WORD,
        TraceKind::Script,
        "script",
    );
}

fn trace_scope(scope: CellRef, tracer: &mut dyn Tracer) {
    emit_cell_edge(
        tracer,
        scope,
        layout::scope::ENCLOSING_WORD,
        TraceKind::Scope,
        "enclosing",
    );
    emit_cell_edge(
        tracer,
        scope,
        layout::scope::ENVIRONMENT_SHAPE_WORD,
        TraceKind::Shape,
        "environmentShape",
    );
}

fn trace_regexp_shared(re: CellRef, tracer: &mut dyn Tracer) {
    emit_cell_edge(
        tracer,
        re,
        layout::regexp::SOURCE_WORD,
        TraceKind::Atom,
        "source",
    );
    emit_cell_edge(
        tracer,
        re,
        layout::regexp::JIT_CODE_WORD,
        TraceKind::JitCode,
        "jitCode",
    );
}
