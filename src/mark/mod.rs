//! The marker: an explicit tri-color mark stack with eager inline marking
//! for strings, shapes, scopes, and lazy scripts.
//!
//! Marking terminates on arbitrary cyclic graphs because `mark_if_unmarked`
//! is monotonic: each cell enters the stack at most once per collection.
//! Objects, object groups, scripts, and jit code get stack entries; the
//! eagerly walked kinds are scanned on the spot without growing the stack
//! beyond a bounded left-spine walk. When the stack would overflow its
//! configured limit, the offending cell's whole region is enqueued on the
//! delayed list and rescanned later.

pub mod weak;

use crate::budget::SliceBudget;
use crate::cell::layout::{self, string as string_layout};
use crate::cell::{AllocKind, CellRef, MarkColor, TraceKind};
use crate::heap::RegionRef;
use crate::trace::{trace_children, Edge, Tracer, TracerKind};
use crate::zone::Zone;
use std::sync::Arc;

use self::weak::WeakKeyTable;

/// Did a bounded operation run to completion?
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Progress {
    Finished,
    NotFinished,
}

/// One mark stack entry.
#[derive(Copy, Clone, Debug)]
pub enum MarkEntry {
    /// An object whose group and slots still need scanning.
    Object(CellRef),
    /// An object group.
    Group(CellRef),
    /// A script.
    Script(CellRef),
    /// Jit code.
    JitCode(CellRef),
    /// A slot range of an object, scanned incrementally.
    ValueArray { obj: CellRef, index: usize },
    /// A value array surviving a slice boundary: only the index and the
    /// object kind are kept, so the mutator is free to change the object
    /// while the collector is paused.
    SavedValueArray {
        obj: CellRef,
        index: usize,
        kind: AllocKind,
    },
    /// A rope whose halves still need scanning.
    TempRope(CellRef),
}

/// The explicit mark stack. Grows geometrically (by `Vec` doubling) up to a
/// configured limit; pushes past the limit fail and the caller takes the
/// delayed-marking path.
pub struct MarkStack {
    entries: Vec<MarkEntry>,
    limit: usize,
}

/// Default mark stack entry limit.
pub const DEFAULT_MARK_STACK_LIMIT: usize = 1 << 15;

impl MarkStack {
    fn new(limit: usize) -> MarkStack {
        MarkStack {
            entries: Vec::with_capacity(64),
            limit,
        }
    }

    fn try_push(&mut self, entry: MarkEntry) -> bool {
        if self.entries.len() >= self.limit {
            return false;
        }
        self.entries.push(entry);
        true
    }

    fn pop(&mut self) -> Option<MarkEntry> {
        self.entries.pop()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    /// Convert every in-flight value array to its saved form. Called at
    /// slice boundaries.
    fn save_value_arrays(&mut self) {
        for entry in &mut self.entries {
            if let MarkEntry::ValueArray { obj, index } = *entry {
                *entry = MarkEntry::SavedValueArray {
                    obj,
                    index,
                    kind: obj.kind(),
                };
            }
        }
    }
}

/// Ring buffer of recently visited ropes; a repeat within the window means a
/// cycle, which the string layout forbids.
const ROPE_RING_SIZE: usize = 100;
/// A single rope spine longer than this is finished through the mark stack
/// instead of the inline loop.
const ROPE_SPINE_CAP: usize = 1000;

struct RopeRing {
    entries: [Option<CellRef>; ROPE_RING_SIZE],
    cursor: usize,
}

impl RopeRing {
    fn new() -> RopeRing {
        RopeRing {
            entries: [None; ROPE_RING_SIZE],
            cursor: 0,
        }
    }

    fn note(&mut self, rope: CellRef) {
        debug_assert!(
            !self.entries.contains(&Some(rope)),
            "cycle in rope structure at {}",
            rope
        );
        self.entries[self.cursor] = Some(rope);
        self.cursor = (self.cursor + 1) % ROPE_RING_SIZE;
    }

    fn reset(&mut self) {
        self.entries = [None; ROPE_RING_SIZE];
        self.cursor = 0;
    }
}

/// The marker.
pub struct Marker {
    stack: MarkStack,
    /// Regions whose marked cells still need their children scanned, queued
    /// when the mark stack was full.
    delayed: Vec<RegionRef>,
    color: MarkColor,
    /// The zone group being collected; edges leaving it are not followed.
    group_id: usize,
    /// The cell whose children are currently being scanned. Used for the
    /// atom bitmaps and for the incoming-gray bookkeeping.
    source: Option<CellRef>,
    weak_mode: bool,
    weak_keys: WeakKeyTable,
    rope_ring: RopeRing,
    cells_marked: usize,
}

impl Marker {
    pub fn new(stack_limit: usize) -> Marker {
        Marker {
            stack: MarkStack::new(stack_limit),
            delayed: Vec::new(),
            color: MarkColor::Black,
            group_id: 0,
            source: None,
            weak_mode: false,
            weak_keys: WeakKeyTable::new(),
            rope_ring: RopeRing::new(),
            cells_marked: 0,
        }
    }

    /// Prepare for a new collection of the given zone group.
    pub fn start_collection(&mut self, group_id: usize) {
        debug_assert!(self.stack.is_empty() && self.delayed.is_empty());
        self.group_id = group_id;
        self.color = MarkColor::Black;
        self.weak_mode = false;
        self.weak_keys.clear();
        self.rope_ring.reset();
        self.cells_marked = 0;
    }

    /// Discard all marking state (collection reset or abort).
    pub fn reset(&mut self) {
        self.stack.entries.clear();
        self.delayed.clear();
        self.weak_mode = false;
        self.weak_keys.clear();
        self.rope_ring.reset();
    }

    pub fn set_color(&mut self, color: MarkColor) {
        self.color = color;
    }

    pub fn color(&self) -> MarkColor {
        self.color
    }

    /// Enable weak-marking mode and seed it from the weak maps of the given
    /// zones. Returns the number of values that became markable right away.
    pub fn enter_weak_marking(&mut self, zones: &[Arc<Zone>]) -> usize {
        self.weak_mode = true;
        let mut pending: Vec<CellRef> = Vec::new();
        for zone in zones {
            for map in zone.weak_maps.lock().unwrap().iter() {
                if map.owner().is_marked_any() {
                    let table = &mut self.weak_keys;
                    map.enter_weak_marking(table, |value| pending.push(value));
                }
            }
        }
        let count = pending.len();
        for value in pending {
            self.mark_cell(value);
        }
        count
    }

    pub fn leave_weak_marking(&mut self) {
        self.weak_mode = false;
        self.weak_keys.clear();
    }

    /// Is there nothing left to drain?
    pub fn is_drained(&self) -> bool {
        self.stack.is_empty() && self.delayed.is_empty()
    }

    pub fn cells_marked(&self) -> usize {
        self.cells_marked
    }

    /// Convert in-flight value arrays at a slice boundary.
    pub fn save_value_arrays(&mut self) {
        self.stack.save_value_arrays();
    }

    /// Mark a cell and queue its children as appropriate for its kind.
    pub fn mark_cell(&mut self, cell: CellRef) {
        if cell.is_permanent() {
            return;
        }
        debug_assert!(
            cell.is_tenured(),
            "the nursery is evicted before marking starts"
        );
        let zone = cell.zone();

        // Atom liveness is tracked per referencing zone, whether or not the
        // atoms zone is in this collection.
        if cell.trace_kind() == TraceKind::Atom {
            if let Some(source) = self.source {
                if source.is_tenured() && !source.zone().is_atoms_zone() {
                    let index = string_layout::atom_index(cell);
                    source.zone().atom_bitmap.lock().unwrap().set(index);
                }
            }
        }

        if !zone.is_collecting() {
            // A gray edge into a zone group we are not collecting is
            // remembered on the destination compartment instead of being
            // followed.
            if self.color == MarkColor::Gray && !zone.is_atoms_zone() {
                if let (Some(wrapper), Some(compartment)) = (self.source, compartment_of(cell)) {
                    compartment.push_incoming_gray(wrapper);
                }
            }
            return;
        }

        if !cell.mark_if_unmarked(self.color) {
            return;
        }
        self.cells_marked += 1;

        if self.weak_mode {
            // This cell may be a weak-map key someone is waiting on.
            let values = self.weak_keys.key_marked(cell);
            for value in values {
                self.mark_cell(value);
            }
        }

        match cell.trace_kind() {
            TraceKind::Object => self.push_or_delay(MarkEntry::Object(cell), cell),
            TraceKind::ObjectGroup => self.push_or_delay(MarkEntry::Group(cell), cell),
            TraceKind::Script => self.push_or_delay(MarkEntry::Script(cell), cell),
            TraceKind::JitCode => self.push_or_delay(MarkEntry::JitCode(cell), cell),
            TraceKind::String => self.scan_string(cell),
            TraceKind::Shape | TraceKind::AccessorShape => self.scan_shape(cell),
            TraceKind::BaseShape => self.scan_base_shape(cell),
            TraceKind::Scope => self.scan_scope(cell),
            TraceKind::LazyScript => self.scan_lazy_script(cell),
            TraceKind::RegExpShared => self.scan_regexp(cell),
            TraceKind::ExternalString | TraceKind::Atom | TraceKind::Symbol => {
                // Leaves, except a symbol's description atom.
                if cell.trace_kind() == TraceKind::Symbol {
                    let saved = self.set_source(Some(cell));
                    if let Some(description) = layout::symbol::description(cell) {
                        self.mark_cell(description);
                    }
                    self.source = saved;
                }
            }
        }
    }

    fn set_source(&mut self, source: Option<CellRef>) -> Option<CellRef> {
        std::mem::replace(&mut self.source, source)
    }

    fn push_or_delay(&mut self, entry: MarkEntry, cell: CellRef) {
        if !self.stack.try_push(entry) {
            // The cell stays marked; its region is rescanned later for
            // marked cells with unmarked children.
            let region = cell.region();
            if !self.delayed.contains(&region) {
                self.delayed.push(region);
            }
            debug!(
                "mark stack limit {} hit; delaying region {}",
                self.stack.limit,
                region.start()
            );
        }
    }

    /// Eagerly scan a newly marked string. Linear strings are leaves; ropes
    /// walk their left spine inline, queueing right halves that are
    /// themselves ropes.
    fn scan_string(&mut self, s: CellRef) {
        if string_layout::is_rope(s) {
            self.scan_rope_children(s);
        }
    }

    fn scan_rope_children(&mut self, rope: CellRef) {
        let mut cur = rope;
        for _ in 0..ROPE_SPINE_CAP {
            debug_assert!(string_layout::is_rope(cur));
            self.rope_ring.note(cur);
            let left = string_layout::left(cur);
            let right = string_layout::right(cur);

            if self.mark_string_half(right) && string_layout::is_rope(right) {
                self.push_or_delay(MarkEntry::TempRope(right), right);
            }
            if self.mark_string_half(left) && string_layout::is_rope(left) {
                cur = left;
                continue;
            }
            return;
        }
        // Spine deeper than the cap: finish through the stack.
        self.push_or_delay(MarkEntry::TempRope(cur), cur);
    }

    /// Mark one rope half without scanning it. Returns true if this call
    /// marked it (so the caller scans or queues it).
    fn mark_string_half(&mut self, s: CellRef) -> bool {
        if s.is_permanent() || !s.zone().is_collecting() {
            return false;
        }
        if s.mark_if_unmarked(self.color) {
            self.cells_marked += 1;
            true
        } else {
            false
        }
    }

    /// Eagerly scan a shape: base, property atom, parent chain, and for
    /// accessor shapes the getter/setter objects.
    fn scan_shape(&mut self, shape: CellRef) {
        let mut cur = shape;
        loop {
            let saved = self.set_source(Some(cur));
            self.mark_cell(layout::shape::base(cur));
            if let Some(atom) = layout::shape::prop_atom(cur) {
                self.mark_cell(atom);
            }
            if cur.kind() == AllocKind::AccessorShape {
                if let Some(getter) = layout::shape::getter(cur) {
                    self.mark_cell(getter);
                }
                if let Some(setter) = layout::shape::setter(cur) {
                    self.mark_cell(setter);
                }
            }
            self.source = saved;

            match layout::shape::parent(cur) {
                Some(parent)
                    if !parent.is_permanent()
                        && parent.zone().is_collecting()
                        && parent.mark_if_unmarked(self.color) =>
                {
                    self.cells_marked += 1;
                    cur = parent;
                }
                _ => return,
            }
        }
    }

    fn scan_base_shape(&mut self, base: CellRef) {
        let saved = self.set_source(Some(base));
        if let Some(unowned) = layout::base_shape::unowned(base) {
            self.mark_cell(unowned);
        }
        self.source = saved;
    }

    fn scan_scope(&mut self, scope: CellRef) {
        let mut cur = scope;
        loop {
            let saved = self.set_source(Some(cur));
            if let Some(shape) = layout::scope::environment_shape(cur) {
                self.mark_cell(shape);
            }
            self.source = saved;
            match layout::scope::enclosing(cur) {
                Some(enclosing)
                    if !enclosing.is_permanent()
                        && enclosing.zone().is_collecting()
                        && enclosing.mark_if_unmarked(self.color) =>
                {
                    self.cells_marked += 1;
                    cur = enclosing;
                }
                _ => return,
            }
        }
    }

    fn scan_lazy_script(&mut self, lazy: CellRef) {
        let saved = self.set_source(Some(lazy));
        if let Some(script) = layout::lazy_script::script(lazy) {
            self.mark_cell(script);
        }
        if let Some(scope) = layout::lazy_script::scope(lazy) {
            self.mark_cell(scope);
        }
        if let Some(source) = layout::lazy_script::source(lazy) {
            self.mark_cell(source);
        }
        self.source = saved;
    }

    fn scan_regexp(&mut self, re: CellRef) {
        let saved = self.set_source(Some(re));
        if let Some(source) = layout::regexp::source(re) {
            self.mark_cell(source);
        }
        if let Some(code) = layout::regexp::jit_code(re) {
            self.mark_cell(code);
        }
        self.source = saved;
    }

    /// Drain the mark stack and the delayed list within the given budget.
    /// Every pop is a suspension point.
    pub fn drain(&mut self, budget: &mut SliceBudget) -> Progress {
        loop {
            while let Some(entry) = self.stack.pop() {
                if self.process_entry(entry, budget) == Progress::NotFinished {
                    return Progress::NotFinished;
                }
                if budget.step(1) {
                    self.save_value_arrays();
                    return Progress::NotFinished;
                }
            }
            if let Some(region) = self.delayed.pop() {
                self.mark_delayed_children(region);
                if budget.step(region.live_count()) {
                    return Progress::NotFinished;
                }
                continue;
            }
            return Progress::Finished;
        }
    }

    fn process_entry(&mut self, entry: MarkEntry, budget: &mut SliceBudget) -> Progress {
        match entry {
            MarkEntry::Object(obj) => {
                let saved = self.set_source(Some(obj));
                // A freshly allocated object may not have its shape and
                // group wired yet.
                if let Some(shape) = layout::read_edge(layout::word_address(
                    obj,
                    layout::object::SHAPE_WORD,
                )) {
                    self.mark_cell(shape);
                }
                if let Some(group) = layout::read_edge(layout::word_address(
                    obj,
                    layout::object::GROUP_WORD,
                )) {
                    self.mark_cell(group);
                }
                self.source = saved;
                self.process_value_array(obj, 0, budget)
            }
            MarkEntry::ValueArray { obj, index } => self.process_value_array(obj, index, budget),
            MarkEntry::SavedValueArray { obj, index, kind } => {
                if obj.kind() == kind {
                    self.process_value_array(obj, index, budget)
                } else {
                    // The object changed size class across the pause; rescan
                    // it from the start.
                    self.push_or_delay(MarkEntry::Object(obj), obj);
                    Progress::Finished
                }
            }
            MarkEntry::Group(group) => {
                let saved = self.set_source(Some(group));
                if let Some(proto) = layout::group::proto(group).as_cell() {
                    self.mark_cell(proto);
                }
                self.source = saved;
                Progress::Finished
            }
            MarkEntry::Script(script) => {
                let saved = self.set_source(Some(script));
                if let Some(scope) = layout::script::scope(script) {
                    self.mark_cell(scope);
                }
                if let Some(source) = layout::script::source(script) {
                    self.mark_cell(source);
                }
                if let Some(lazy) = layout::script::lazy(script) {
                    self.mark_cell(lazy);
                }
                self.source = saved;
                Progress::Finished
            }
            MarkEntry::JitCode(code) => {
                let saved = self.set_source(Some(code));
                if let Some(script) = layout::jit_code::script(code) {
                    self.mark_cell(script);
                }
                self.source = saved;
                Progress::Finished
            }
            MarkEntry::TempRope(rope) => {
                self.scan_rope_children(rope);
                Progress::Finished
            }
        }
    }

    fn process_value_array(
        &mut self,
        obj: CellRef,
        start: usize,
        budget: &mut SliceBudget,
    ) -> Progress {
        let count = layout::object::slot_count(obj);
        let saved = self.set_source(Some(obj));
        for index in start..count {
            if budget.step(1) {
                self.source = saved;
                // Keep only the index and kind across the pause; the mutator
                // may reallocate the object's storage while we are paused.
                self.stack.entries.push(MarkEntry::SavedValueArray {
                    obj,
                    index,
                    kind: obj.kind(),
                });
                return Progress::NotFinished;
            }
            if let Some(cell) = layout::object::slot(obj, index).as_cell() {
                self.mark_cell(cell);
            }
        }
        self.source = saved;
        Progress::Finished
    }

    /// Rescan a region from the delayed list: every marked cell gets its
    /// children marked, since the overflow may have dropped them.
    fn mark_delayed_children(&mut self, region: RegionRef) {
        trace!("marking delayed children in region {}", region.start());
        for cell in region.cells() {
            if cell.is_marked_any() {
                let saved = self.set_source(Some(cell));
                let mut marking = MarkingEdgeVisitor { marker: self };
                trace_children(cell, &mut marking);
                self.source = saved;
            }
        }
    }
}

/// The marker's face as a `Tracer`, used for root tracing and delayed
/// rescans.
struct MarkingEdgeVisitor<'a> {
    marker: &'a mut Marker,
}

impl Tracer for MarkingEdgeVisitor<'_> {
    fn kind(&self) -> TracerKind {
        if self.marker.weak_mode {
            TracerKind::WeakMarking
        } else {
            TracerKind::Marking
        }
    }

    fn on_edge(&mut self, edge: Edge, _trace_kind: TraceKind, _name: &'static str) {
        if let Some(target) = edge.load() {
            self.marker.mark_cell(target);
        }
    }
}

impl Tracer for Marker {
    fn kind(&self) -> TracerKind {
        if self.weak_mode {
            TracerKind::WeakMarking
        } else {
            TracerKind::Marking
        }
    }

    fn on_edge(&mut self, edge: Edge, _trace_kind: TraceKind, _name: &'static str) {
        if let Some(target) = edge.load() {
            self.mark_cell(target);
        }
    }
}

/// The compartment a cell belongs to, where the layout records one (objects,
/// via their group).
pub(crate) fn compartment_of(cell: CellRef) -> Option<&'static crate::zone::Compartment> {
    if cell.trace_kind() == TraceKind::Object {
        let group = layout::read_edge(layout::word_address(
            cell,
            layout::object::GROUP_WORD,
        ))?;
        let raw = layout::group::compartment(group);
        if !raw.is_null() {
            return Some(unsafe { &*raw });
        }
    }
    None
}
