//! Per-kind payload layouts.
//!
//! Payload offsets are in words relative to the first word after the header.
//! These accessors are unbarriered: callers that overwrite an edge of a live
//! cell are responsible for invoking the write barriers first (see
//! `crate::barrier`); the tracing, promotion, and compaction code reads and
//! rewrites edges through the same offsets.

use super::value::Value;
use super::{AllocKind, CellRef, TraceKind};
use crate::util::constants::BYTES_IN_WORD;
use crate::util::Address;

/// The address of payload word `index` of `cell`.
pub fn word_address(cell: CellRef, index: usize) -> Address {
    debug_assert!(index < cell.size() / BYTES_IN_WORD - 1);
    cell.payload_address() + index * BYTES_IN_WORD
}

/// Read an optional cell edge stored at `addr` (zero means none).
pub fn read_edge(addr: Address) -> Option<CellRef> {
    let raw = unsafe { addr.load::<usize>() };
    if raw == 0 {
        None
    } else {
        Some(unsafe { CellRef::from_address(Address::from_usize(raw)) })
    }
}

/// Store an optional cell edge at `addr`.
pub fn write_edge(addr: Address, cell: Option<CellRef>) {
    unsafe { addr.store::<usize>(cell.map_or(0, |c| c.as_usize())) }
}

/// Objects: `shape`, `group`, then the inline value slots.
pub mod object {
    use super::*;

    pub const SHAPE_WORD: usize = 0;
    pub const GROUP_WORD: usize = 1;
    pub const FIRST_SLOT_WORD: usize = 2;

    pub fn shape(obj: CellRef) -> CellRef {
        debug_assert_eq!(obj.trace_kind(), TraceKind::Object);
        read_edge(word_address(obj, SHAPE_WORD)).expect("object without a shape")
    }

    pub fn set_shape(obj: CellRef, shape: CellRef) {
        write_edge(word_address(obj, SHAPE_WORD), Some(shape));
    }

    pub fn group(obj: CellRef) -> CellRef {
        read_edge(word_address(obj, GROUP_WORD)).expect("object without a group")
    }

    pub fn set_group(obj: CellRef, group: CellRef) {
        write_edge(word_address(obj, GROUP_WORD), Some(group));
    }

    /// The number of inline value slots, from the size class.
    pub fn slot_count(obj: CellRef) -> usize {
        obj.kind().object_slot_count()
    }

    pub fn slot_address(obj: CellRef, index: usize) -> Address {
        debug_assert!(index < slot_count(obj));
        word_address(obj, FIRST_SLOT_WORD + index)
    }

    pub fn slot(obj: CellRef, index: usize) -> Value {
        Value::from_raw(unsafe { slot_address(obj, index).load::<usize>() })
    }

    pub fn set_slot(obj: CellRef, index: usize, value: Value) {
        unsafe { slot_address(obj, index).store::<usize>(value.raw()) }
    }

    /// The address range of the slot array: `(first, count)`.
    pub fn slots_range(obj: CellRef) -> (Address, usize) {
        (word_address(obj, FIRST_SLOT_WORD), slot_count(obj))
    }
}

/// Scripts: scope, source atom, an optional lazy-script backlink, and an
/// opaque bytecode blob.
pub mod script {
    use super::*;

    pub const SCOPE_WORD: usize = 0;
    pub const SOURCE_WORD: usize = 1;
    pub const LAZY_WORD: usize = 2;

    pub fn scope(script: CellRef) -> Option<CellRef> {
        debug_assert_eq!(script.kind(), AllocKind::Script);
        read_edge(word_address(script, SCOPE_WORD))
    }

    pub fn set_scope(script: CellRef, scope: Option<CellRef>) {
        write_edge(word_address(script, SCOPE_WORD), scope);
    }

    pub fn source(script: CellRef) -> Option<CellRef> {
        read_edge(word_address(script, SOURCE_WORD))
    }

    pub fn set_source(script: CellRef, atom: Option<CellRef>) {
        write_edge(word_address(script, SOURCE_WORD), atom);
    }

    pub fn lazy(script: CellRef) -> Option<CellRef> {
        read_edge(word_address(script, LAZY_WORD))
    }

    pub fn set_lazy(script: CellRef, lazy: Option<CellRef>) {
        write_edge(word_address(script, LAZY_WORD), lazy);
    }
}

/// Lazy scripts: the delazified script, enclosing scope, and source atom.
pub mod lazy_script {
    use super::*;

    pub const SCRIPT_WORD: usize = 0;
    pub const SCOPE_WORD: usize = 1;
    pub const SOURCE_WORD: usize = 2;

    pub fn script(lazy: CellRef) -> Option<CellRef> {
        debug_assert_eq!(lazy.kind(), AllocKind::LazyScript);
        read_edge(word_address(lazy, SCRIPT_WORD))
    }

    pub fn set_script(lazy: CellRef, script: Option<CellRef>) {
        write_edge(word_address(lazy, SCRIPT_WORD), script);
    }

    pub fn scope(lazy: CellRef) -> Option<CellRef> {
        read_edge(word_address(lazy, SCOPE_WORD))
    }

    pub fn set_scope(lazy: CellRef, scope: Option<CellRef>) {
        write_edge(word_address(lazy, SCOPE_WORD), scope);
    }

    pub fn source(lazy: CellRef) -> Option<CellRef> {
        read_edge(word_address(lazy, SOURCE_WORD))
    }

    pub fn set_source(lazy: CellRef, atom: Option<CellRef>) {
        write_edge(word_address(lazy, SOURCE_WORD), atom);
    }
}

/// Shapes: base shape, parent shape, property atom. Accessor shapes add
/// getter and setter object edges.
pub mod shape {
    use super::*;

    pub const BASE_WORD: usize = 0;
    pub const PARENT_WORD: usize = 1;
    pub const PROP_ATOM_WORD: usize = 2;
    pub const SLOT_INFO_WORD: usize = 3;
    pub const GETTER_WORD: usize = 5;
    pub const SETTER_WORD: usize = 6;

    fn is_shape(cell: CellRef) -> bool {
        matches!(cell.kind(), AllocKind::Shape | AllocKind::AccessorShape)
    }

    pub fn base(shape: CellRef) -> CellRef {
        debug_assert!(is_shape(shape));
        read_edge(word_address(shape, BASE_WORD)).expect("shape without a base")
    }

    pub fn set_base(shape: CellRef, base: CellRef) {
        write_edge(word_address(shape, BASE_WORD), Some(base));
    }

    pub fn parent(shape: CellRef) -> Option<CellRef> {
        read_edge(word_address(shape, PARENT_WORD))
    }

    pub fn set_parent(shape: CellRef, parent: Option<CellRef>) {
        write_edge(word_address(shape, PARENT_WORD), parent);
    }

    pub fn prop_atom(shape: CellRef) -> Option<CellRef> {
        read_edge(word_address(shape, PROP_ATOM_WORD))
    }

    pub fn set_prop_atom(shape: CellRef, atom: Option<CellRef>) {
        write_edge(word_address(shape, PROP_ATOM_WORD), atom);
    }

    pub fn getter(shape: CellRef) -> Option<CellRef> {
        debug_assert_eq!(shape.kind(), AllocKind::AccessorShape);
        read_edge(word_address(shape, GETTER_WORD))
    }

    pub fn set_getter(shape: CellRef, getter: Option<CellRef>) {
        debug_assert_eq!(shape.kind(), AllocKind::AccessorShape);
        write_edge(word_address(shape, GETTER_WORD), getter);
    }

    pub fn setter(shape: CellRef) -> Option<CellRef> {
        debug_assert_eq!(shape.kind(), AllocKind::AccessorShape);
        read_edge(word_address(shape, SETTER_WORD))
    }

    pub fn set_setter(shape: CellRef, setter: Option<CellRef>) {
        debug_assert_eq!(shape.kind(), AllocKind::AccessorShape);
        write_edge(word_address(shape, SETTER_WORD), setter);
    }
}

/// Base shapes: an optional unowned-base edge and a flags word.
pub mod base_shape {
    use super::*;

    pub const FLAGS_WORD: usize = 0;
    pub const UNOWNED_WORD: usize = 1;

    pub fn unowned(base: CellRef) -> Option<CellRef> {
        debug_assert_eq!(base.kind(), AllocKind::BaseShape);
        read_edge(word_address(base, UNOWNED_WORD))
    }

    pub fn set_unowned(base: CellRef, unowned: Option<CellRef>) {
        write_edge(word_address(base, UNOWNED_WORD), unowned);
    }
}

/// Object groups: a prototype value, a flags word, and a raw pointer to the
/// compartment the group's objects belong to.
pub mod group {
    use super::*;

    pub const PROTO_WORD: usize = 0;
    pub const FLAGS_WORD: usize = 1;
    pub const COMPARTMENT_WORD: usize = 2;

    pub fn proto(group: CellRef) -> Value {
        debug_assert_eq!(group.kind(), AllocKind::ObjectGroup);
        Value::from_raw(unsafe { word_address(group, PROTO_WORD).load::<usize>() })
    }

    pub fn proto_address(group: CellRef) -> Address {
        word_address(group, PROTO_WORD)
    }

    pub fn set_proto(group: CellRef, proto: Value) {
        unsafe { word_address(group, PROTO_WORD).store::<usize>(proto.raw()) }
    }

    /// The compartment the group's objects belong to. The pointer is not a
    /// cell edge: compartments are runtime structures with stable addresses.
    pub fn compartment(group: CellRef) -> *const crate::zone::Compartment {
        debug_assert_eq!(group.kind(), AllocKind::ObjectGroup);
        unsafe { word_address(group, COMPARTMENT_WORD).load::<usize>() as *const _ }
    }

    pub fn set_compartment(group: CellRef, compartment: *const crate::zone::Compartment) {
        unsafe { word_address(group, COMPARTMENT_WORD).store::<usize>(compartment as usize) }
    }
}

/// Strings, atoms, and external strings.
///
/// Word 0 is a flags word: the low half holds the rope bit and the
/// owns-buffer bit, the high half holds the atom index for atom kinds. A rope
/// stores its two halves in words 1 and 2; a linear string stores a data
/// pointer and capacity there (or inline bytes for the fat inline kinds).
/// The string length lives in the header's aux counter.
pub mod string {
    use super::*;

    pub const FLAGS_WORD: usize = 0;
    pub const LEFT_WORD: usize = 1;
    pub const RIGHT_WORD: usize = 2;
    pub const DATA_WORD: usize = 1;
    pub const INLINE_WORD: usize = 1;

    const ROPE_FLAG: usize = 1 << 0;
    const OWNS_BUFFER_FLAG: usize = 1 << 1;
    const ATOM_INDEX_SHIFT: usize = 32;

    pub fn is_string_kind(cell: CellRef) -> bool {
        matches!(
            cell.trace_kind(),
            TraceKind::String | TraceKind::ExternalString | TraceKind::Atom
        )
    }

    fn flags(s: CellRef) -> usize {
        debug_assert!(is_string_kind(s));
        unsafe { word_address(s, FLAGS_WORD).load::<usize>() }
    }

    fn set_flags(s: CellRef, flags: usize) {
        unsafe { word_address(s, FLAGS_WORD).store::<usize>(flags) }
    }

    pub fn is_rope(s: CellRef) -> bool {
        flags(s) & ROPE_FLAG != 0
    }

    /// Does this string own a malloc'd character buffer that finalization
    /// must free?
    pub fn owns_buffer(s: CellRef) -> bool {
        flags(s) & OWNS_BUFFER_FLAG != 0
    }

    pub fn left(s: CellRef) -> CellRef {
        debug_assert!(is_rope(s));
        read_edge(word_address(s, LEFT_WORD)).expect("rope without a left half")
    }

    pub fn right(s: CellRef) -> CellRef {
        debug_assert!(is_rope(s));
        read_edge(word_address(s, RIGHT_WORD)).expect("rope without a right half")
    }

    /// Turn `s` into a rope over the two halves.
    pub fn init_rope(s: CellRef, left: CellRef, right: CellRef) {
        debug_assert_eq!(s.kind(), AllocKind::String);
        set_flags(s, flags(s) | ROPE_FLAG);
        write_edge(word_address(s, LEFT_WORD), Some(left));
        write_edge(word_address(s, RIGHT_WORD), Some(right));
    }

    pub fn left_address(s: CellRef) -> Address {
        word_address(s, LEFT_WORD)
    }

    pub fn right_address(s: CellRef) -> Address {
        word_address(s, RIGHT_WORD)
    }

    /// Initialize a linear string over a leaked boxed buffer. The cell takes
    /// ownership; the sweeper frees the buffer when the cell dies.
    pub fn init_linear(s: CellRef, data: Box<[u8]>) {
        let len = data.len();
        debug_assert!(len <= 0xffff);
        s.set_aux_count(len);
        set_flags(s, (flags(s) & !ROPE_FLAG) | OWNS_BUFFER_FLAG);
        let raw = Box::into_raw(data);
        unsafe { word_address(s, DATA_WORD).store::<*mut u8>(raw as *mut u8) }
    }

    /// Free a linear string's owned buffer. Called by finalization only.
    pub(crate) fn finalize_buffer(s: CellRef) {
        if owns_buffer(s) {
            let len = s.aux_count();
            let ptr = unsafe { word_address(s, DATA_WORD).load::<*mut u8>() };
            drop(unsafe { Box::from_raw(std::slice::from_raw_parts_mut(ptr, len)) });
            set_flags(s, flags(s) & !OWNS_BUFFER_FLAG);
        }
    }

    /// The interned atom's index into the per-zone atom bitmaps.
    pub fn atom_index(atom: CellRef) -> usize {
        debug_assert_eq!(atom.trace_kind(), TraceKind::Atom);
        flags(atom) >> ATOM_INDEX_SHIFT
    }

    pub(crate) fn set_atom_index(atom: CellRef, index: usize) {
        debug_assert_eq!(atom.trace_kind(), TraceKind::Atom);
        debug_assert!(index < (1 << 32));
        let low = flags(atom) & ((1 << ATOM_INDEX_SHIFT) - 1);
        set_flags(atom, low | (index << ATOM_INDEX_SHIFT));
    }
}

/// Symbols: an optional description atom and a hash code.
pub mod symbol {
    use super::*;

    pub const DESCRIPTION_WORD: usize = 0;
    pub const HASH_WORD: usize = 1;

    pub fn description(sym: CellRef) -> Option<CellRef> {
        debug_assert_eq!(sym.kind(), AllocKind::Symbol);
        read_edge(word_address(sym, DESCRIPTION_WORD))
    }

    pub fn set_description(sym: CellRef, atom: Option<CellRef>) {
        write_edge(word_address(sym, DESCRIPTION_WORD), atom);
    }
}

/// Jit code: a backlink to the owning script; the rest is opaque code bytes.
pub mod jit_code {
    use super::*;

    pub const SCRIPT_WORD: usize = 0;

    pub fn script(code: CellRef) -> Option<CellRef> {
        debug_assert_eq!(code.kind(), AllocKind::JitCode);
        read_edge(word_address(code, SCRIPT_WORD))
    }

    pub fn set_script(code: CellRef, script: Option<CellRef>) {
        write_edge(word_address(code, SCRIPT_WORD), script);
    }
}

/// Scopes: the enclosing scope and the shape of the environment object.
pub mod scope {
    use super::*;

    pub const ENCLOSING_WORD: usize = 0;
    pub const ENVIRONMENT_SHAPE_WORD: usize = 1;

    pub fn enclosing(scope: CellRef) -> Option<CellRef> {
        debug_assert_eq!(scope.kind(), AllocKind::Scope);
        read_edge(word_address(scope, ENCLOSING_WORD))
    }

    pub fn set_enclosing(scope: CellRef, enclosing: Option<CellRef>) {
        write_edge(word_address(scope, ENCLOSING_WORD), enclosing);
    }

    pub fn environment_shape(scope: CellRef) -> Option<CellRef> {
        read_edge(word_address(scope, ENVIRONMENT_SHAPE_WORD))
    }

    pub fn set_environment_shape(scope: CellRef, shape: Option<CellRef>) {
        write_edge(word_address(scope, ENVIRONMENT_SHAPE_WORD), shape);
    }
}

/// Compiled regexps: source atom and optional jit code.
pub mod regexp {
    use super::*;

    pub const SOURCE_WORD: usize = 0;
    pub const FLAGS_WORD: usize = 1;
    pub const JIT_CODE_WORD: usize = 2;

    pub fn source(re: CellRef) -> Option<CellRef> {
        debug_assert_eq!(re.kind(), AllocKind::RegExpShared);
        read_edge(word_address(re, SOURCE_WORD))
    }

    pub fn set_source(re: CellRef, atom: Option<CellRef>) {
        write_edge(word_address(re, SOURCE_WORD), atom);
    }

    pub fn jit_code(re: CellRef) -> Option<CellRef> {
        read_edge(word_address(re, JIT_CODE_WORD))
    }

    pub fn set_jit_code(re: CellRef, code: Option<CellRef>) {
        write_edge(word_address(re, JIT_CODE_WORD), code);
    }
}
