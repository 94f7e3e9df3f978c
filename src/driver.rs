//! The incremental driver: a state machine advanced one budgeted slice at a
//! time.
//!
//! ```text
//! NotActive -> MarkRoots -> Mark -> Sweep -> Finalize -> Compact -> Decommit -> NotActive
//! ```
//!
//! The first slice evicts the nursery, flips the collecting zones into
//! marking, and pushes the roots. Subsequent slices drain the mark stack,
//! then iterate sweep groups x phases x zones x actions (each resumable), and
//! finally compact and decommit. A hard blocker resets the driver to
//! `NotActive`; a reset during sweeping first finishes the current sweep
//! group.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use atomic::Atomic;
use bytemuck::NoUninit;

use crate::budget::SliceBudget;
use crate::cell::{CellRef, MarkColor};
use crate::global_state::HeapBusyGuard;
use crate::mark::{Marker, Progress};
use crate::roots::RootTraceMode;
use crate::runtime::{GcProgress, GcRuntime};
use crate::sweep::{self, SweepSchedule};
use crate::trace::{trace_children, Edge, Tracer, TracerKind};
use crate::zeal::ZealMode;
use crate::zone::{sweep_groups, Zone, ZoneGroup, ZoneState};

/// The driver states.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, NoUninit)]
pub enum GcState {
    NotActive,
    MarkRoots,
    Mark,
    Sweep,
    Finalize,
    Compact,
    Decommit,
}

/// Why a collection (or slice) was requested.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GcReason {
    /// The host asked through the API.
    ApiRequest,
    /// A zone allocated past its trigger threshold.
    AllocTrigger,
    /// The nursery filled up.
    OutOfNursery,
    /// The store buffer hit its capacity.
    FullStoreBuffer,
    /// A failed allocation's last-ditch collection.
    LastDitch,
    /// A zeal mode fired.
    Zeal,
    /// The host asked for memory to be given back.
    Shrink,
    /// Driving an already-active collection forward.
    IncrementalSlice,
    /// Finishing an active collection non-incrementally.
    Finish,
}

/// Why an incremental collection was reset.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResetReason {
    /// A compartment was brought back to life mid-collection.
    CompartmentRevived,
    /// A zone was scheduled for destruction mid-collection.
    ZoneDestroyed,
    /// The host aborted the collection.
    Abort,
}

/// Per-collection state, live from `start` to the final slice.
struct GcSession {
    reason: GcReason,
    group: Arc<ZoneGroup>,
    /// The zones being collected, including the atoms zone on full
    /// collections.
    zones: Vec<Arc<Zone>>,
    is_full: bool,
    /// Sweep groups in sweep order, computed at the mark->sweep transition.
    sweep_groups: Vec<Vec<Arc<Zone>>>,
    /// Resume state for sweeping: group x phase x zone x action.
    sweep_group_index: usize,
    sweep_phase_index: usize,
    sweep_zone_index: usize,
    sweep_action_index: usize,
    /// Snapshot of cells reachable at mark start; zeal VerifyPre checks it
    /// against the mark bits when marking completes.
    verify_snapshot: Vec<CellRef>,
    /// An abort was requested; honored at the next suspension point.
    abort_requested: bool,
    /// Whether this collection will compact.
    will_compact: bool,
}

/// The incremental GC driver. One per runtime.
pub struct GcDriver {
    state: Atomic<GcState>,
    pub(crate) marker: Mutex<Marker>,
    session: Mutex<Option<GcSession>>,
    schedule: SweepSchedule,
}

impl GcDriver {
    pub(crate) fn new(mark_stack_limit: usize) -> GcDriver {
        GcDriver {
            state: Atomic::new(GcState::NotActive),
            marker: Mutex::new(Marker::new(mark_stack_limit)),
            session: Mutex::new(None),
            schedule: sweep::build_sweep_schedule(),
        }
    }

    /// The current state.
    pub fn state(&self) -> GcState {
        self.state.load(Ordering::Acquire)
    }

    /// Is a collection in progress?
    pub fn is_active(&self) -> bool {
        self.state() != GcState::NotActive
    }

    fn set_state(&self, state: GcState) {
        debug!("gc driver -> {:?}", state);
        self.state.store(state, Ordering::Release);
    }

    /// Start a collection of `group`'s zones (plus the atoms zone when
    /// `full`). Idempotent: starting while active just runs a slice.
    pub(crate) fn start(
        &self,
        rt: &GcRuntime,
        group: Arc<ZoneGroup>,
        full: bool,
        reason: GcReason,
        mut budget: SliceBudget,
    ) {
        if self.is_active() {
            self.slice(rt, reason, budget);
            return;
        }
        info!("major GC start (reason: {:?}, full: {})", reason, full);
        rt.invoke_gc_callbacks(GcProgress::CycleBegin, reason);

        // The nursery must be empty before marking: the marker only deals
        // with tenured cells.
        rt.evict_group(&group, reason);

        let mut zones: Vec<Arc<Zone>> = group.zones();
        if full {
            zones.push(rt.atoms_zone());
        }
        for zone in &zones {
            zone.schedule(true);
            zone.heap.zero_mark_bitmaps();
            if !zone.is_atoms_zone() {
                // The zone's atom bitmap is rebuilt from its live cells as
                // marking traces them (plus write-time notes between slices).
                zone.atom_bitmap.lock().unwrap().clear();
            }
            zone.set_state(ZoneState::Mark);
            zone.set_needs_barrier(true);
        }

        let verify_snapshot = if rt.zeal().has(ZealMode::VerifyPre) {
            snapshot_reachable(rt)
        } else {
            Vec::new()
        };

        *self.session.lock().unwrap() = Some(GcSession {
            reason,
            group: group.clone(),
            zones,
            is_full: full,
            sweep_groups: Vec::new(),
            sweep_group_index: 0,
            sweep_phase_index: 0,
            sweep_zone_index: 0,
            sweep_action_index: 0,
            verify_snapshot,
            abort_requested: false,
            will_compact: false,
        });

        // The first slice is consumed by root marking.
        self.set_state(GcState::MarkRoots);
        {
            let _busy = HeapBusyGuard::new(rt.state());
            let mut marker = self.marker.lock().unwrap();
            marker.start_collection(group.id());
            rt.roots()
                .trace_roots(&mut *marker, RootTraceMode::Marking);
            // Wrappers recorded on our compartments by earlier collections
            // of other groups enter as gray roots.
            self.mark_incoming_gray(&mut marker);
        }
        self.set_state(GcState::Mark);
        rt.state().slice_count.fetch_add(1, Ordering::Relaxed);
        rt.invoke_gc_callbacks(GcProgress::SliceEnd, reason);

        if !budget.is_over_budget() && budget.is_unlimited() {
            self.slice(rt, reason, budget);
        }
    }

    /// Run one slice of the active collection.
    pub(crate) fn slice(&self, rt: &GcRuntime, reason: GcReason, mut budget: SliceBudget) {
        if !self.is_active() {
            return;
        }
        rt.invoke_gc_callbacks(GcProgress::SliceBegin, reason);
        let progress = {
            let _busy = HeapBusyGuard::new(rt.state());
            self.run_slice(rt, &mut budget)
        };
        rt.state().slice_count.fetch_add(1, Ordering::Relaxed);
        if progress == Progress::Finished {
            self.finish_collection(rt, reason);
        } else {
            // Between slices the mutator runs; the snapshot barrier is what
            // keeps marking sound, and the incoming-gray lists are flushed.
            let mut marker = self.marker.lock().unwrap();
            marker.save_value_arrays();
            self.mark_incoming_gray(&mut marker);
            rt.invoke_gc_callbacks(GcProgress::SliceEnd, reason);
        }
    }

    /// Finish the active collection synchronously.
    pub(crate) fn finish(&self, rt: &GcRuntime, reason: GcReason) {
        while self.is_active() {
            self.slice(rt, reason, SliceBudget::unlimited());
        }
    }

    /// Request an abort. During marking the collection is reset on the spot;
    /// during sweeping the current sweep group completes first.
    pub(crate) fn abort(&self, rt: &GcRuntime) {
        match self.state() {
            GcState::NotActive => {}
            GcState::MarkRoots | GcState::Mark => self.reset(rt, ResetReason::Abort),
            _ => {
                if let Some(session) = self.session.lock().unwrap().as_mut() {
                    session.abort_requested = true;
                }
                // Finish the current sweep group, then unwind.
                self.finish(rt, GcReason::Finish);
            }
        }
    }

    /// Reset to `NotActive`, discarding collection state. The next
    /// collection starts fresh (and non-incrementally, if the caller asks it
    /// to).
    pub(crate) fn reset(&self, rt: &GcRuntime, reason: ResetReason) {
        warn!("incremental GC reset: {:?}", reason);
        debug_assert!(
            !matches!(self.state(), GcState::Sweep),
            "mid-sweep resets must finish the current sweep group first"
        );
        let session = self.session.lock().unwrap().take();
        if let Some(session) = session {
            for zone in &session.zones {
                zone.set_needs_barrier(false);
                zone.set_state(ZoneState::NoGc);
                zone.schedule(false);
            }
        }
        self.marker.lock().unwrap().reset();
        self.set_state(GcState::NotActive);
    }

    /// The state-machine core: advance until the budget expires or the
    /// collection completes. Runs under the heap-busy token on the thread
    /// owning the target group.
    fn run_slice(&self, rt: &GcRuntime, budget: &mut SliceBudget) -> Progress {
        loop {
            if self.session_aborted() && self.state() == GcState::Mark {
                self.reset(rt, ResetReason::Abort);
                return Progress::NotFinished;
            }
            match self.state() {
                GcState::NotActive | GcState::MarkRoots => return Progress::NotFinished,
                GcState::Mark => {
                    if self.mark_slice(rt, budget) == Progress::NotFinished {
                        return Progress::NotFinished;
                    }
                    self.begin_sweeping(rt);
                    self.set_state(GcState::Sweep);
                }
                GcState::Sweep => {
                    if self.sweep_slice(rt, budget) == Progress::NotFinished {
                        return Progress::NotFinished;
                    }
                    self.set_state(GcState::Finalize);
                }
                GcState::Finalize => {
                    // Background finalization for earlier groups may still
                    // be running; the next phase touches the same regions.
                    rt.helper().wait_for_idle();
                    rt.invoke_finalize_callbacks(crate::sweep::FinalizePhase::End);
                    let compact = {
                        let session = self.session.lock().unwrap();
                        session.as_ref().map_or(false, |s| s.will_compact)
                    };
                    self.set_state(if compact {
                        GcState::Compact
                    } else {
                        GcState::Decommit
                    });
                }
                GcState::Compact => {
                    let zones = self.session_zones();
                    for zone in &zones {
                        zone.set_state(ZoneState::Compact);
                    }
                    crate::compact::compact_zones(rt, &zones);
                    for zone in &zones {
                        zone.set_state(ZoneState::Finished);
                    }
                    self.set_state(GcState::Decommit);
                }
                GcState::Decommit => {
                    rt.region_pool().drain_excess();
                    if rt.zeal().has(ZealMode::Shrinking) {
                        self.session_group().nursery.request_shrink();
                    }
                    return Progress::Finished;
                }
            }
            if budget.is_over_budget() {
                return Progress::NotFinished;
            }
        }
    }

    /// One bounded chunk of marking. Finishing requires the stack and the
    /// delayed list drained, weak marking completed, atoms integrated, and
    /// gray roots traced.
    fn mark_slice(&self, rt: &GcRuntime, budget: &mut SliceBudget) -> Progress {
        let mut marker = self.marker.lock().unwrap();
        if marker.drain(budget) == Progress::NotFinished {
            return Progress::NotFinished;
        }

        // Weak marking: ephemeron propagation to a fixpoint.
        let zones = self.session_zones();
        marker.enter_weak_marking(&zones);
        if marker.drain(budget) == Progress::NotFinished {
            return Progress::NotFinished;
        }
        marker.leave_weak_marking();

        // Atoms referenced by zones outside this collection survive through
        // the atom bitmaps.
        if self.session_is_full() {
            self.mark_atoms_from_bitmaps(rt, &mut marker);
            if marker.drain(budget) == Progress::NotFinished {
                return Progress::NotFinished;
            }
        }

        // Gray roots: the cycle collector's roots are integrated last, so
        // anything they reach that black marking did not is gray. On budget
        // exhaustion the marker keeps its gray color, so the leftover stack
        // entries finish gray on the next slice.
        marker.set_color(MarkColor::Gray);
        rt.roots().trace_gray_roots(&mut *marker);
        self.mark_incoming_gray(&mut marker);
        if marker.drain(budget) == Progress::NotFinished {
            return Progress::NotFinished;
        }
        marker.set_color(MarkColor::Black);

        debug_assert!(marker.is_drained());
        info!("marking finished: {} cells marked", marker.cells_marked());

        if !self.session_verify_snapshot_is_empty() {
            self.verify_pre_barrier_snapshot();
        }
        #[cfg(feature = "extreme_assertions")]
        validate_marking(&zones);
        Progress::Finished
    }

    /// Mark->Sweep transition: compute sweep groups and flip the first group
    /// into the sweeping state.
    fn begin_sweeping(&self, rt: &GcRuntime) {
        let mut session = self.session.lock().unwrap();
        let session = session.as_mut().expect("no active session");
        session.sweep_groups = sweep_groups::compute_sweep_groups(&session.zones);
        session.sweep_group_index = 0;
        session.sweep_phase_index = 0;
        session.sweep_zone_index = 0;
        session.sweep_action_index = 0;
        session.will_compact = rt.should_compact(session.is_full);

        // Marking is over: the snapshot barrier is no longer needed.
        for zone in &session.zones {
            zone.set_needs_barrier(false);
        }
        if let Some(first) = session.sweep_groups.first() {
            for zone in first {
                zone.set_state(ZoneState::Sweep);
            }
            rt.invoke_weak_pointer_callbacks(first);
        }
        rt.invoke_finalize_callbacks(crate::sweep::FinalizePhase::Start);
    }

    /// One bounded chunk of sweeping: groups x phases x zones x actions,
    /// resumable at every level.
    fn sweep_slice(&self, rt: &GcRuntime, budget: &mut SliceBudget) -> Progress {
        loop {
            let (group_index, phase_index, zone_index, action_index, group_count) = {
                let session = self.session.lock().unwrap();
                let s = session.as_ref().expect("no active session");
                (
                    s.sweep_group_index,
                    s.sweep_phase_index,
                    s.sweep_zone_index,
                    s.sweep_action_index,
                    s.sweep_groups.len(),
                )
            };
            if group_index >= group_count {
                return Progress::Finished;
            }
            let group_zones: Vec<Arc<Zone>> = {
                let session = self.session.lock().unwrap();
                session.as_ref().unwrap().sweep_groups[group_index].clone()
            };

            if phase_index >= self.schedule.phases.len() {
                // This sweep group is done.
                for zone in &group_zones {
                    zone.set_state(ZoneState::Finished);
                }
                let mut session = self.session.lock().unwrap();
                let s = session.as_mut().unwrap();
                s.sweep_group_index += 1;
                s.sweep_phase_index = 0;
                s.sweep_zone_index = 0;
                s.sweep_action_index = 0;
                if s.abort_requested {
                    // An abort finishes the sweep group that was in progress
                    // and unwinds; the remaining groups keep their cells
                    // until the next collection.
                    s.sweep_group_index = s.sweep_groups.len();
                    s.will_compact = false;
                }
                let next = s.sweep_group_index;
                if next < s.sweep_groups.len() {
                    let next_zones = s.sweep_groups[next].clone();
                    drop(session);
                    for zone in &next_zones {
                        zone.set_state(ZoneState::Sweep);
                    }
                    rt.invoke_weak_pointer_callbacks(&next_zones);
                }
                // A sweep group boundary is both a suspension point and the
                // earliest point an abort can unwind.
                if budget.is_over_budget() {
                    return Progress::NotFinished;
                }
                continue;
            }

            let phase = &self.schedule.phases[phase_index];
            if zone_index >= group_zones.len() {
                let mut session = self.session.lock().unwrap();
                let s = session.as_mut().unwrap();
                s.sweep_phase_index += 1;
                s.sweep_zone_index = 0;
                s.sweep_action_index = 0;
                continue;
            }
            let zone = group_zones[zone_index].clone();
            if action_index >= phase.actions.len() {
                let mut session = self.session.lock().unwrap();
                let s = session.as_mut().unwrap();
                s.sweep_zone_index += 1;
                s.sweep_action_index = 0;
                continue;
            }

            let action = &phase.actions[action_index];
            let progress = (action.func)(rt, &zone, action.kind, budget);
            if progress == Progress::NotFinished {
                return Progress::NotFinished;
            }
            {
                let mut session = self.session.lock().unwrap();
                session.as_mut().unwrap().sweep_action_index += 1;
            }
            if budget.is_over_budget() {
                return Progress::NotFinished;
            }
        }
    }

    /// Wrap up: thresholds, zone states, statistics, callbacks.
    fn finish_collection(&self, rt: &GcRuntime, reason: GcReason) {
        let session = self.session.lock().unwrap().take();
        let Some(session) = session else { return };
        for zone in &session.zones {
            zone.set_state(ZoneState::NoGc);
            zone.schedule(false);
            zone.set_needs_barrier(false);
            zone.accounting.reset_peak();
            zone.update_gc_threshold(
                rt.options().gc_growth_factor,
                rt.options().gc_min_threshold_bytes,
            );
        }
        self.marker.lock().unwrap().reset();
        self.set_state(GcState::NotActive);
        rt.state().major_gc_number.fetch_add(1, Ordering::Relaxed);
        info!(
            "major GC finished (reason: {:?}, number {})",
            session.reason,
            rt.state().major_gc_number()
        );
        rt.invoke_gc_callbacks(GcProgress::CycleEnd, reason);
    }

    /// Atoms named by any zone's bitmap survive (I7): mark them black before
    /// the atoms zone is swept. Zones in this collection contributed their
    /// bitmaps during marking; zones outside it keep atoms alive here.
    fn mark_atoms_from_bitmaps(&self, rt: &GcRuntime, marker: &mut Marker) {
        let atoms = rt.atoms_zone();
        debug_assert!(atoms.is_collecting());
        for (index, atom) in rt.atom_table_entries() {
            let alive = rt
                .all_zones()
                .iter()
                .filter(|z| !z.is_atoms_zone())
                .any(|z| z.atom_bitmap.lock().unwrap().get(index));
            if alive {
                marker.mark_cell(atom);
            }
        }
    }

    /// Traverse and clear the incoming-gray lists of the collecting zones'
    /// compartments, marking the wrapped targets gray.
    fn mark_incoming_gray(&self, marker: &mut Marker) {
        let saved = marker.color();
        marker.set_color(MarkColor::Gray);
        for zone in self.session_zones() {
            for compartment in zone.compartments() {
                for wrapper in compartment.take_incoming_gray() {
                    if wrapper.trace_kind() == crate::cell::TraceKind::Object
                        && crate::cell::layout::object::slot_count(wrapper) > 0
                    {
                        if let Some(target) = crate::cell::layout::object::slot(wrapper, 0).as_cell()
                        {
                            marker.mark_cell(target);
                        }
                    }
                }
            }
        }
        marker.set_color(saved);
    }

    fn session_zones(&self) -> Vec<Arc<Zone>> {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.zones.clone())
            .unwrap_or_default()
    }

    fn session_group(&self) -> Arc<ZoneGroup> {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.group.clone())
            .expect("no active session")
    }

    fn session_is_full(&self) -> bool {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .map_or(false, |s| s.is_full)
    }

    fn session_aborted(&self) -> bool {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .map_or(false, |s| s.abort_requested)
    }

    fn session_verify_snapshot_is_empty(&self) -> bool {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .map_or(true, |s| s.verify_snapshot.is_empty())
    }

    /// Zeal VerifyPre: every cell reachable when marking started must be
    /// marked now; the snapshot barrier promises exactly this.
    fn verify_pre_barrier_snapshot(&self) {
        let snapshot = {
            let session = self.session.lock().unwrap();
            session
                .as_ref()
                .map(|s| s.verify_snapshot.clone())
                .unwrap_or_default()
        };
        for cell in snapshot {
            if cell.is_tenured() && cell.zone().is_collecting() {
                assert!(
                    cell.is_marked_any(),
                    "pre-barrier verifier: {} was reachable at mark start but is unmarked",
                    cell
                );
            }
        }
    }
}

/// Everything reachable from the roots right now, by plain traversal.
fn snapshot_reachable(rt: &GcRuntime) -> Vec<CellRef> {
    struct Collect {
        seen: std::collections::HashSet<CellRef>,
        stack: Vec<CellRef>,
    }
    impl Tracer for Collect {
        fn kind(&self) -> TracerKind {
            TracerKind::Callback
        }
        fn on_edge(&mut self, edge: Edge, _k: crate::cell::TraceKind, _n: &'static str) {
            if let Some(target) = edge.load() {
                if !target.is_permanent() && self.seen.insert(target) {
                    self.stack.push(target);
                }
            }
        }
    }
    let mut collect = Collect {
        seen: std::collections::HashSet::new(),
        stack: Vec::new(),
    };
    rt.roots()
        .trace_roots(&mut collect, RootTraceMode::Tracing);
    while let Some(cell) = collect.stack.pop() {
        trace_children(cell, &mut collect);
    }
    collect.seen.into_iter().collect()
}

/// Validate I2 over the whole heap: no black cell in a collecting zone
/// points at an unmarked cell of a collecting zone.
#[cfg(feature = "extreme_assertions")]
fn validate_marking(zones: &[Arc<Zone>]) {
    struct Validate {
        source: Option<CellRef>,
    }
    impl Tracer for Validate {
        fn kind(&self) -> TracerKind {
            TracerKind::Callback
        }
        fn on_edge(&mut self, edge: Edge, _k: crate::cell::TraceKind, name: &'static str) {
            if let Some(target) = edge.load() {
                if target.is_tenured() && !target.is_permanent() && target.zone().is_collecting() {
                    assert!(
                        target.is_marked_any(),
                        "black cell {:?} points at unmarked {} ({})",
                        self.source,
                        target,
                        name
                    );
                }
            }
        }
    }
    for zone in zones {
        for region in zone.heap.all_regions() {
            for cell in region.cells() {
                if cell.is_marked(MarkColor::Black) {
                    let mut validate = Validate { source: Some(cell) };
                    trace_children(cell, &mut validate);
                }
            }
        }
    }
}
