//! Sweeping: a list of phases of actions computed at initialization, iterated
//! by the driver as sweep groups x phases x zones x actions, with every level
//! resumable after budget exhaustion.
//!
//! Weak structures go first (weak maps, unique ids, weak caches, wrapper
//! maps), then the background-finalizable kinds are handed to the helper
//! thread, then the foreground kinds are finalized in kind order. The helper
//! signals completion through a condition variable that the driver waits on
//! before any phase that could touch the same regions.

use std::sync::{Arc, Condvar, Mutex};

use crossbeam::channel::{unbounded, Receiver, Sender};
use enum_map::EnumMap;

use crate::budget::SliceBudget;
use crate::cell::alloc_kind::{BACKGROUND_SWEEP_ORDER, FOREGROUND_SWEEP_ORDER};
use crate::cell::{layout, AllocKind, CellRef, TraceKind};
use crate::heap::{RegionPool, RegionRef};
use crate::mark::Progress;
use crate::runtime::GcRuntime;
use crate::zone::Zone;

/// Host finalize-callback phases.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FinalizePhase {
    /// Sweeping is about to begin.
    Start,
    /// All sweeping (including background) has completed.
    End,
}

/// One sweep action: a function applied to `(runtime, zone, kind, budget)`.
pub struct SweepAction {
    pub func: fn(&GcRuntime, &Arc<Zone>, AllocKind, &mut SliceBudget) -> Progress,
    pub kind: AllocKind,
}

/// A named phase of sweep actions.
pub struct SweepPhase {
    pub name: &'static str,
    pub actions: Vec<SweepAction>,
}

/// The full sweep schedule, computed once at driver initialization.
pub struct SweepSchedule {
    pub phases: Vec<SweepPhase>,
}

/// Build the sweep schedule: weak structures, background launch, foreground
/// finalization in kind order, then the atoms table.
pub fn build_sweep_schedule() -> SweepSchedule {
    let weak_phase = SweepPhase {
        name: "weak-structures",
        actions: vec![
            SweepAction {
                func: sweep_weak_maps,
                kind: AllocKind::Object0,
            },
            SweepAction {
                func: sweep_unique_ids,
                kind: AllocKind::Object0,
            },
            SweepAction {
                func: sweep_weak_caches,
                kind: AllocKind::Object0,
            },
            SweepAction {
                func: sweep_wrappers,
                kind: AllocKind::Object0,
            },
        ],
    };
    let background_phase = SweepPhase {
        name: "background-launch",
        actions: vec![SweepAction {
            func: launch_background_finalization,
            kind: AllocKind::Object0Background,
        }],
    };
    let foreground_phase = SweepPhase {
        name: "foreground-finalize",
        actions: FOREGROUND_SWEEP_ORDER
            .iter()
            .map(|&kind| SweepAction {
                func: sweep_kind,
                kind,
            })
            .collect(),
    };
    let atoms_phase = SweepPhase {
        name: "atoms",
        actions: vec![SweepAction {
            func: sweep_atom_table,
            kind: AllocKind::Atom,
        }],
    };
    // The atom table goes before the background launch: it reads atom
    // headers, which the helper thread overwrites when it frees dead cells.
    SweepSchedule {
        phases: vec![weak_phase, atoms_phase, background_phase, foreground_phase],
    }
}

/// Is a cell still live at sweep time, from the sweeper's point of view?
pub(crate) fn is_live(cell: CellRef) -> bool {
    cell.is_permanent()
        || cell.is_nursery()
        || !cell.zone().is_collecting()
        || cell.is_marked_any()
}

fn sweep_weak_maps(
    _rt: &GcRuntime,
    zone: &Arc<Zone>,
    _kind: AllocKind,
    _budget: &mut SliceBudget,
) -> Progress {
    let mut maps = zone.weak_maps.lock().unwrap();
    maps.retain(|map| is_live(map.owner()));
    for map in maps.iter() {
        let survivors = map.sweep(is_live);
        trace!("weak map {} entries survive in zone {}", survivors, zone.id());
    }
    Progress::Finished
}

fn sweep_unique_ids(
    _rt: &GcRuntime,
    zone: &Arc<Zone>,
    _kind: AllocKind,
    _budget: &mut SliceBudget,
) -> Progress {
    // The unique-id table drops dead entries before any cell of this zone is
    // finalized, so no table key ever dangles.
    zone.unique_ids.lock().unwrap().sweep(is_live);
    Progress::Finished
}

fn sweep_weak_caches(
    _rt: &GcRuntime,
    zone: &Arc<Zone>,
    _kind: AllocKind,
    _budget: &mut SliceBudget,
) -> Progress {
    for cache in zone.weak_caches.lock().unwrap().iter_mut() {
        cache.sweep(&is_live);
    }
    Progress::Finished
}

fn sweep_wrappers(
    _rt: &GcRuntime,
    zone: &Arc<Zone>,
    _kind: AllocKind,
    _budget: &mut SliceBudget,
) -> Progress {
    for compartment in zone.compartments() {
        compartment.sweep_wrappers(is_live);
        compartment.sweep_defaults(is_live);
    }
    Progress::Finished
}

/// Hand every background-finalizable kind's regions to the helper thread.
/// The mutator resumes while the helper sweeps.
fn launch_background_finalization(
    rt: &GcRuntime,
    zone: &Arc<Zone>,
    _kind: AllocKind,
    budget: &mut SliceBudget,
) -> Progress {
    for &kind in BACKGROUND_SWEEP_ORDER {
        let regions = zone.heap.detach_regions(kind);
        if regions.is_empty() {
            continue;
        }
        budget.step(regions.len());
        if rt.options().background_finalization {
            rt.helper().submit(zone.clone(), kind, regions);
        } else {
            finalize_regions(zone, kind, regions, rt.region_pool(), rt.finalizer_hooks());
        }
    }
    Progress::Finished
}

/// Foreground sweep of one kind in one zone.
fn sweep_kind(
    rt: &GcRuntime,
    zone: &Arc<Zone>,
    kind: AllocKind,
    budget: &mut SliceBudget,
) -> Progress {
    let regions = zone.heap.detach_regions(kind);
    if !regions.is_empty() {
        budget.step(regions.len() * regions[0].cell_capacity());
        finalize_regions(zone, kind, regions, rt.region_pool(), rt.finalizer_hooks());
    }
    Progress::Finished
}

/// Sweep the runtime's atom table: entries for dead atoms are dropped before
/// the atoms zone's regions are finalized.
fn sweep_atom_table(
    rt: &GcRuntime,
    zone: &Arc<Zone>,
    _kind: AllocKind,
    _budget: &mut SliceBudget,
) -> Progress {
    if zone.is_atoms_zone() {
        rt.sweep_atom_table();
    }
    Progress::Finished
}

/// Finalize the dead cells of a batch of regions, returning emptied regions
/// to the pool and survivors to the zone. Shared by the foreground path and
/// the helper thread.
fn finalize_regions(
    zone: &Arc<Zone>,
    kind: AllocKind,
    regions: Vec<RegionRef>,
    pool: &RegionPool,
    hooks: &FinalizerHooks,
) {
    let size = kind.size();
    let mut survivors = Vec::new();
    let mut freed_total = 0;
    for region in regions {
        let freed = region.sweep(|cell| finalize_cell(hooks, cell));
        freed_total += freed;
        if region.is_empty() {
            pool.return_region(region);
        } else {
            survivors.push(region);
        }
    }
    if freed_total > 0 {
        zone.accounting.sub(freed_total * size);
    }
    zone.heap.reattach_regions(kind, survivors);
    debug!(
        "swept {:?} in zone {}: {} cells freed",
        kind,
        zone.id(),
        freed_total
    );
}

/// Kind-specific cell destruction. Finalizers must not fail; anything that
/// panics here takes the process down, by contract.
fn finalize_cell(hooks: &FinalizerHooks, cell: CellRef) {
    match cell.trace_kind() {
        TraceKind::String | TraceKind::Atom => layout::string::finalize_buffer(cell),
        _ => {}
    }
    hooks.invoke(cell);
}

/// Per-kind host finalizer hooks. Hooks for background-finalizable kinds run
/// on the helper thread, so they must be thread-safe.
pub struct FinalizerHooks {
    hooks: Mutex<EnumMap<AllocKind, Option<Arc<dyn Fn(CellRef) + Send + Sync>>>>,
}

impl FinalizerHooks {
    pub(crate) fn new() -> Arc<FinalizerHooks> {
        Arc::new(FinalizerHooks {
            hooks: Mutex::new(EnumMap::default()),
        })
    }

    /// Install a finalizer hook for a kind.
    pub fn set(&self, kind: AllocKind, hook: Arc<dyn Fn(CellRef) + Send + Sync>) {
        self.hooks.lock().unwrap()[kind] = Some(hook);
    }

    fn invoke(&self, cell: CellRef) {
        let hook = self.hooks.lock().unwrap()[cell.kind()].clone();
        if let Some(hook) = hook {
            hook(cell);
        }
    }
}

enum Job {
    Finalize {
        zone: Arc<Zone>,
        kind: AllocKind,
        regions: Vec<RegionRef>,
    },
    Shutdown,
}

struct HelperShared {
    /// Number of submitted-but-unfinished jobs.
    pending: Mutex<usize>,
    idle: Condvar,
}

/// The background finalization helper. Jobs are handed over a channel; the
/// driver waits on `wait_for_idle` before any phase that could touch the
/// regions being swept.
pub struct HelperThread {
    sender: Sender<Job>,
    shared: Arc<HelperShared>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl HelperThread {
    pub(crate) fn new(
        worker_count: usize,
        pool: Arc<RegionPool>,
        hooks: Arc<FinalizerHooks>,
    ) -> HelperThread {
        let (sender, receiver) = unbounded::<Job>();
        let shared = Arc::new(HelperShared {
            pending: Mutex::new(0),
            idle: Condvar::new(),
        });
        let mut workers = Vec::new();
        for i in 0..worker_count.max(1) {
            let receiver: Receiver<Job> = receiver.clone();
            let shared = shared.clone();
            let pool = pool.clone();
            let hooks = hooks.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("tephra-finalize-{}", i))
                    .spawn(move || helper_loop(receiver, shared, pool, hooks))
                    .expect("failed to spawn the finalization helper"),
            );
        }
        HelperThread {
            sender,
            shared,
            workers: Mutex::new(workers),
        }
    }

    fn submit(&self, zone: Arc<Zone>, kind: AllocKind, regions: Vec<RegionRef>) {
        *self.shared.pending.lock().unwrap() += 1;
        self.sender
            .send(Job::Finalize {
                zone,
                kind,
                regions,
            })
            .expect("finalization helper is gone");
    }

    /// Block until every submitted finalization job has completed.
    pub fn wait_for_idle(&self) {
        let mut pending = self.shared.pending.lock().unwrap();
        while *pending > 0 {
            pending = self.shared.idle.wait(pending).unwrap();
        }
    }
}

impl Drop for HelperThread {
    fn drop(&mut self) {
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock().unwrap());
        for _ in &workers {
            let _ = self.sender.send(Job::Shutdown);
        }
        for worker in workers {
            let _ = worker.join();
        }
    }
}

fn helper_loop(
    receiver: Receiver<Job>,
    shared: Arc<HelperShared>,
    pool: Arc<RegionPool>,
    hooks: Arc<FinalizerHooks>,
) {
    while let Ok(job) = receiver.recv() {
        match job {
            Job::Shutdown => break,
            Job::Finalize {
                zone,
                kind,
                regions,
            } => {
                finalize_regions(&zone, kind, regions, &pool, &hooks);
                let mut pending = shared.pending.lock().unwrap();
                *pending -= 1;
                if *pending == 0 {
                    shared.idle.notify_all();
                }
            }
        }
    }
}
