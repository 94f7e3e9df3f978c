//! The tenured heap: regions of kind-homogeneous cells, organized per zone.

pub mod accounting;
pub mod region;

pub use self::accounting::HeapAccounting;
pub use self::region::{RegionPool, RegionRef};

use enum_map::EnumMap;
use spin::Mutex;

use crate::cell::{AllocKind, CellRef};
use crate::util::Address;
use crate::zone::Zone;

/// The region lists for one allocation kind.
#[derive(Default)]
struct KindRegions {
    /// Regions with at least one free cell. Allocation uses the last entry.
    available: Vec<RegionRef>,
    /// Regions with no free cells.
    full: Vec<RegionRef>,
}

impl KindRegions {
    fn all(&self) -> impl Iterator<Item = RegionRef> + '_ {
        self.available.iter().chain(self.full.iter()).copied()
    }
}

/// A zone's tenured heap: per-kind region lists.
///
/// Lists are guarded by short spin locks. Allocation runs only on the thread
/// holding the zone group, so the locks are uncontended except when the
/// background finalizer detaches or reattaches a kind's regions.
pub struct ZoneHeap {
    lists: EnumMap<AllocKind, Mutex<KindRegions>>,
}

impl ZoneHeap {
    pub fn new() -> Self {
        Self {
            lists: EnumMap::default(),
        }
    }

    /// Allocate a zeroed cell of `kind`, pulling a fresh region from the pool
    /// when every region of this kind is full. Returns `None` on OOM. The
    /// caller initializes the header.
    pub fn alloc_cell(
        &self,
        zone: *const Zone,
        kind: AllocKind,
        pool: &RegionPool,
    ) -> Option<Address> {
        let mut list = self.lists[kind].lock();
        while let Some(&region) = list.available.last() {
            if let Some(addr) = region.alloc_cell() {
                return Some(addr);
            }
            list.available.pop();
            list.full.push(region);
        }
        let region = pool.alloc_region()?;
        region.init(zone, kind);
        let addr = region.alloc_cell();
        debug_assert!(addr.is_some(), "fresh region must have a free cell");
        list.available.push(region);
        addr
    }

    /// Every region currently holding cells of `kind`.
    pub fn regions(&self, kind: AllocKind) -> Vec<RegionRef> {
        self.lists[kind].lock().all().collect()
    }

    /// Every region of every kind.
    pub fn all_regions(&self) -> Vec<RegionRef> {
        let mut out = Vec::new();
        for (_, list) in &self.lists {
            out.extend(list.lock().all());
        }
        out
    }

    /// Iterate every allocated cell of `kind`.
    pub fn cells_of_kind(&self, kind: AllocKind) -> Vec<CellRef> {
        let mut out = Vec::new();
        for region in self.regions(kind) {
            out.extend(region.cells());
        }
        out
    }

    /// The number of regions holding cells of `kind`.
    pub fn region_count(&self, kind: AllocKind) -> usize {
        let list = self.lists[kind].lock();
        list.available.len() + list.full.len()
    }

    /// Detach all regions of `kind`, e.g. to hand them to the background
    /// finalizer. Allocation of this kind will use fresh regions until the
    /// survivors are reattached.
    pub fn detach_regions(&self, kind: AllocKind) -> Vec<RegionRef> {
        let mut list = self.lists[kind].lock();
        let mut regions: Vec<RegionRef> = list.available.drain(..).collect();
        regions.extend(list.full.drain(..));
        regions
    }

    /// Reattach regions after sweeping, partitioning them by fullness.
    /// Empty regions should have been returned to the pool instead.
    pub fn reattach_regions(&self, kind: AllocKind, regions: Vec<RegionRef>) {
        let mut list = self.lists[kind].lock();
        for region in regions {
            debug_assert!(!region.is_empty());
            debug_assert_eq!(region.kind(), kind);
            if region.live_count() < region.cell_capacity() {
                list.available.push(region);
            } else {
                list.full.push(region);
            }
        }
    }

    /// Remove one region from the lists (compaction relocates its cells and
    /// frees it).
    pub fn remove_region(&self, kind: AllocKind, region: RegionRef) {
        let mut list = self.lists[kind].lock();
        list.available.retain(|r| *r != region);
        list.full.retain(|r| *r != region);
    }

    /// Zero the mark bitmaps of every region. Done when a collection of this
    /// zone starts marking.
    pub fn zero_mark_bitmaps(&self) {
        for (_, list) in &self.lists {
            for region in list.lock().all() {
                region.mark_bitmap().zero();
            }
        }
    }

    /// The number of live cells of `kind`, summed over regions.
    pub fn live_cells(&self, kind: AllocKind) -> usize {
        self.lists[kind].lock().all().map(|r| r.live_count()).sum()
    }
}

impl Default for ZoneHeap {
    fn default() -> Self {
        Self::new()
    }
}
