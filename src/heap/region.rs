//! Page-aligned heap regions.
//!
//! Tenured memory is carved into 64 KiB aligned regions, each holding cells
//! of a single kind, so iteration and sweeping never consult per-cell tags.
//! The first page of a region holds its metadata: the owning zone, the kind,
//! a free list, an allocation bitmap (one bit per cell-aligned granule) and
//! the mark bitmap (two bits per granule, encoding the tri-color state).

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::cell::{AllocKind, CellRef, MarkColor};
use crate::util::constants::{BYTES_IN_PAGE, LOG_CELL_ALIGN};
use crate::util::{memory, Address};
use crate::zone::Zone;

/// log2 of the region size.
pub const LOG_BYTES_IN_REGION: usize = 16;
/// The region size in bytes.
pub const BYTES_IN_REGION: usize = 1 << LOG_BYTES_IN_REGION;
/// Mask to extract the offset within a region.
pub const REGION_MASK: usize = BYTES_IN_REGION - 1;

/// Cells start after the metadata page.
pub const DATA_OFFSET: usize = BYTES_IN_PAGE;

const GRANULES_IN_REGION: usize = BYTES_IN_REGION >> LOG_CELL_ALIGN;
const BITS_IN_WORD: usize = usize::BITS as usize;
const ALLOC_BITMAP_WORDS: usize = GRANULES_IN_REGION / BITS_IN_WORD;
const MARK_BITMAP_WORDS: usize = GRANULES_IN_REGION * 2 / BITS_IN_WORD;

const BLACK_BIT: usize = 0b01;
const GRAY_BIT: usize = 0b10;
const COLOR_MASK: usize = 0b11;

/// The metadata at the start of every region.
#[repr(C)]
pub struct RegionHeader {
    /// The owning zone. Stable for the lifetime of the region: zones are
    /// heap-allocated once and never move.
    zone: AtomicUsize,
    /// The kind of every cell in this region.
    kind: AtomicUsize,
    /// Number of allocated cells.
    live: AtomicU32,
    /// Head of the intrusive free list threaded through free cells' first
    /// words. Zero when the region is full.
    free_list: AtomicUsize,
    /// One bit per granule: is a cell allocated at this granule?
    alloc_bitmap: [AtomicUsize; ALLOC_BITMAP_WORDS],
    /// Two bits per granule: the mark color of the cell at this granule.
    mark_bitmap: MarkBitmap,
}

const_assert!(std::mem::size_of::<RegionHeader>() <= DATA_OFFSET);

/// The per-region tri-color mark bitmap.
#[repr(C)]
pub struct MarkBitmap {
    words: [AtomicUsize; MARK_BITMAP_WORDS],
}

impl MarkBitmap {
    fn index_of(addr: Address) -> (usize, usize) {
        let granule = (addr & REGION_MASK) >> LOG_CELL_ALIGN;
        let bit = granule * 2;
        (bit / BITS_IN_WORD, bit % BITS_IN_WORD)
    }

    fn color_bits(&self, addr: Address) -> usize {
        let (word, shift) = Self::index_of(addr);
        (self.words[word].load(Ordering::Acquire) >> shift) & COLOR_MASK
    }

    /// Is the cell at `addr` marked with exactly this color?
    pub fn is_marked(&self, addr: Address, color: MarkColor) -> bool {
        let bits = self.color_bits(addr);
        match color {
            MarkColor::Black => bits & BLACK_BIT != 0,
            MarkColor::Gray => bits == GRAY_BIT,
        }
    }

    /// Is the cell at `addr` marked at all?
    pub fn is_marked_any(&self, addr: Address) -> bool {
        self.color_bits(addr) != 0
    }

    /// Atomically mark the cell at `addr`. Black overrides gray; gray never
    /// overrides anything. Returns true if this call changed the state.
    pub fn mark_if_unmarked(&self, addr: Address, color: MarkColor) -> bool {
        let (word, shift) = Self::index_of(addr);
        let slot = &self.words[word];
        let mut old = slot.load(Ordering::Acquire);
        loop {
            let bits = (old >> shift) & COLOR_MASK;
            let new_bits = match color {
                MarkColor::Black => {
                    if bits & BLACK_BIT != 0 {
                        return false;
                    }
                    BLACK_BIT
                }
                MarkColor::Gray => {
                    if bits != 0 {
                        return false;
                    }
                    GRAY_BIT
                }
            };
            let new = (old & !(COLOR_MASK << shift)) | (new_bits << shift);
            match slot.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(cur) => old = cur,
            }
        }
    }

    /// Atomically turn a gray mark black. Returns true if the cell was gray.
    /// Used by the gray-unmarking read barrier.
    pub fn unmark_gray(&self, addr: Address) -> bool {
        let (word, shift) = Self::index_of(addr);
        let slot = &self.words[word];
        let mut old = slot.load(Ordering::Acquire);
        loop {
            if (old >> shift) & COLOR_MASK != GRAY_BIT {
                return false;
            }
            let new = (old & !(COLOR_MASK << shift)) | (BLACK_BIT << shift);
            match slot.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(cur) => old = cur,
            }
        }
    }

    /// Clear the mark bits for the cell at `addr`.
    pub fn clear(&self, addr: Address) {
        let (word, shift) = Self::index_of(addr);
        self.words[word].fetch_and(!(COLOR_MASK << shift), Ordering::AcqRel);
    }

    /// Zero the whole bitmap. Done per collecting zone when marking starts.
    pub fn zero(&self) {
        for word in &self.words {
            word.store(0, Ordering::Relaxed);
        }
    }
}

/// A reference to a region, by its aligned start address.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionRef(Address);

impl RegionRef {
    /// Wrap an aligned region start address.
    pub fn from_aligned_address(addr: Address) -> RegionRef {
        debug_assert!(addr.is_aligned_to(BYTES_IN_REGION));
        RegionRef(addr)
    }

    /// The region containing the given (tenured cell) address.
    pub fn containing(addr: Address) -> RegionRef {
        RegionRef(addr.align_down(BYTES_IN_REGION))
    }

    /// The region start address.
    pub fn start(self) -> Address {
        self.0
    }

    /// The address of the first cell.
    pub fn data_start(self) -> Address {
        self.0 + DATA_OFFSET
    }

    fn header(self) -> &'static RegionHeader {
        unsafe { self.0.as_ref::<RegionHeader>() }
    }

    /// Initialize a fresh (or recycled) region for the given zone and kind,
    /// threading every cell onto the free list.
    pub fn init(self, zone: *const Zone, kind: AllocKind) {
        let header = self.header();
        header.zone.store(zone as usize, Ordering::Release);
        header.kind.store(kind as usize, Ordering::Release);
        header.live.store(0, Ordering::Release);
        header.mark_bitmap.zero();
        for word in &header.alloc_bitmap {
            word.store(0, Ordering::Relaxed);
        }

        // Thread the free list front to back so allocation walks the region
        // in address order.
        let size = kind.size();
        let count = self.cell_capacity();
        let mut next: usize = 0;
        for i in (0..count).rev() {
            let cell = self.data_start() + i * size;
            unsafe { cell.store::<usize>(next) };
            next = cell.as_usize();
        }
        header.free_list.store(next, Ordering::Release);
    }

    /// The number of cells this region can hold.
    pub fn cell_capacity(self) -> usize {
        (BYTES_IN_REGION - DATA_OFFSET) / self.kind().size()
    }

    /// The kind of every cell in this region.
    pub fn kind(self) -> AllocKind {
        unsafe { AllocKind::from_tag(self.header().kind.load(Ordering::Acquire) as u8) }
    }

    /// The owning zone.
    pub fn zone(self) -> &'static Zone {
        let raw = self.header().zone.load(Ordering::Acquire);
        debug_assert!(raw != 0, "region accessed before init");
        unsafe { &*(raw as *const Zone) }
    }

    /// The number of allocated cells.
    pub fn live_count(self) -> usize {
        self.header().live.load(Ordering::Acquire) as usize
    }

    /// Is every cell slot free?
    pub fn is_empty(self) -> bool {
        self.live_count() == 0
    }

    /// The per-region mark bitmap.
    pub fn mark_bitmap(self) -> &'static MarkBitmap {
        &self.header().mark_bitmap
    }

    fn alloc_bit_index(self, addr: Address) -> (usize, usize) {
        let granule = (addr & REGION_MASK) >> LOG_CELL_ALIGN;
        (granule / BITS_IN_WORD, granule % BITS_IN_WORD)
    }

    /// Is a cell allocated at `addr`?
    pub fn is_allocated(self, addr: Address) -> bool {
        let (word, bit) = self.alloc_bit_index(addr);
        self.header().alloc_bitmap[word].load(Ordering::Acquire) & (1 << bit) != 0
    }

    fn set_allocated(self, addr: Address, allocated: bool) {
        let (word, bit) = self.alloc_bit_index(addr);
        if allocated {
            self.header().alloc_bitmap[word].fetch_or(1 << bit, Ordering::AcqRel);
        } else {
            self.header().alloc_bitmap[word].fetch_and(!(1 << bit), Ordering::AcqRel);
        }
    }

    /// Pop a free cell off the region's free list and return its zeroed
    /// memory, or `None` if the region is full. The caller writes the header.
    pub fn alloc_cell(self) -> Option<Address> {
        let header = self.header();
        let head = header.free_list.load(Ordering::Acquire);
        if head == 0 {
            return None;
        }
        let cell = unsafe { Address::from_usize(head) };
        let next = unsafe { cell.load::<usize>() };
        header.free_list.store(next, Ordering::Release);
        header.live.fetch_add(1, Ordering::AcqRel);
        self.set_allocated(cell, true);
        memory::zero(cell, self.kind().size());
        Some(cell)
    }

    /// Release a dead cell back to the free list. Used by sweeping.
    fn free_cell(self, addr: Address) {
        let header = self.header();
        self.set_allocated(addr, false);
        let head = header.free_list.load(Ordering::Acquire);
        unsafe { addr.store::<usize>(head) };
        header.free_list.store(addr.as_usize(), Ordering::Release);
        header.live.fetch_sub(1, Ordering::AcqRel);
    }

    /// Iterate the allocated cells of this region.
    pub fn cells(self) -> RegionCellIter {
        RegionCellIter {
            region: self,
            size: self.kind().size(),
            index: 0,
            count: self.cell_capacity(),
        }
    }

    /// Sweep the region: every allocated, unmarked cell is finalized and
    /// returned to the free list. Mark bits are left in place so liveness
    /// stays queryable until the next collection zeroes them. Returns the
    /// number of cells freed.
    pub fn sweep(self, mut finalize: impl FnMut(CellRef)) -> usize {
        let mut freed = 0;
        for cell in self.cells() {
            // Permanent cells (permanent atoms, well-known symbols) are
            // trivially live and carry no mark.
            if !self.mark_bitmap().is_marked_any(cell.to_address()) && !cell.is_permanent() {
                finalize(cell);
                self.free_cell(cell.to_address());
                freed += 1;
            }
        }
        trace!(
            "swept region {} kind {:?}: freed {}, live {}",
            self.0,
            self.kind(),
            freed,
            self.live_count()
        );
        freed
    }
}

/// Iterator over the allocated cells of a region.
pub struct RegionCellIter {
    region: RegionRef,
    size: usize,
    index: usize,
    count: usize,
}

impl Iterator for RegionCellIter {
    type Item = CellRef;

    fn next(&mut self) -> Option<CellRef> {
        while self.index < self.count {
            let addr = self.region.data_start() + self.index * self.size;
            self.index += 1;
            if self.region.is_allocated(addr) {
                return Some(unsafe { CellRef::from_address(addr) });
            }
        }
        None
    }
}

/// The process-wide pool of mapped regions. Regions released by sweeping are
/// recycled here; `drain_excess` decommits them once the pool grows past a
/// small watermark.
pub struct RegionPool {
    free: spin::Mutex<Vec<RegionRef>>,
    mapped: AtomicUsize,
}

/// How many free regions the pool keeps committed for reuse.
const POOL_WATERMARK: usize = 8;

impl RegionPool {
    pub fn new() -> Self {
        Self {
            free: spin::Mutex::new(Vec::new()),
            mapped: AtomicUsize::new(0),
        }
    }

    /// Take a region from the pool, mapping a fresh one if the pool is empty.
    pub fn alloc_region(&self) -> Option<RegionRef> {
        if let Some(region) = self.free.lock().pop() {
            return Some(region);
        }
        match memory::map_aligned(BYTES_IN_REGION, BYTES_IN_REGION) {
            Ok(addr) => {
                self.mapped.fetch_add(1, Ordering::Relaxed);
                Some(RegionRef::from_aligned_address(addr))
            }
            Err(e) => {
                if memory::is_mmap_oom(&e) {
                    warn!("out of memory mapping a heap region");
                    None
                } else {
                    panic!("failed to map a heap region: {}", e)
                }
            }
        }
    }

    /// Return an empty region to the pool.
    pub fn return_region(&self, region: RegionRef) {
        debug_assert!(region.is_empty());
        self.free.lock().push(region);
    }

    /// Return a region whose remaining contents are being discarded wholesale
    /// (compaction relocation sources). The forwarding overlays inside die
    /// with the region.
    pub fn discard_region(&self, region: RegionRef) {
        self.free.lock().push(region);
    }

    /// Decommit pooled regions beyond the watermark. Returns the number of
    /// regions decommitted.
    pub fn drain_excess(&self) -> usize {
        let excess: Vec<RegionRef> = {
            let mut free = self.free.lock();
            if free.len() <= POOL_WATERMARK {
                return 0;
            }
            free.split_off(POOL_WATERMARK)
        };
        let mut count = 0;
        for region in &excess {
            if memory::decommit(region.start(), BYTES_IN_REGION).is_ok() {
                count += 1;
            }
        }
        // Decommitted regions stay mapped and reusable.
        self.free.lock().extend(excess);
        debug!("decommitted {} pooled regions", count);
        count
    }

    /// The total number of regions ever mapped.
    pub fn mapped_regions(&self) -> usize {
        self.mapped.load(Ordering::Relaxed)
    }
}

impl Default for RegionPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoffset::offset_of;

    #[test]
    fn metadata_fits_in_the_first_page() {
        assert!(offset_of!(RegionHeader, mark_bitmap) + std::mem::size_of::<MarkBitmap>() <= DATA_OFFSET);
        assert!(offset_of!(RegionHeader, alloc_bitmap) < offset_of!(RegionHeader, mark_bitmap));
    }

    fn test_region(pool: &RegionPool, kind: AllocKind) -> RegionRef {
        let region = pool.alloc_region().unwrap();
        region.init(std::ptr::null(), kind);
        region
    }

    #[test]
    fn alloc_until_full_then_sweep_everything() {
        let pool = RegionPool::new();
        let region = test_region(&pool, AllocKind::Symbol);
        let capacity = region.cell_capacity();

        let mut cells = Vec::new();
        while let Some(addr) = region.alloc_cell() {
            let cell = unsafe { CellRef::from_address(addr) };
            cell.init_header(AllocKind::Symbol, false);
            cells.push(cell);
        }
        assert_eq!(cells.len(), capacity);
        assert_eq!(region.live_count(), capacity);
        assert_eq!(region.cells().count(), capacity);

        // Nothing is marked: sweeping frees every cell.
        let mut finalized = 0;
        let freed = region.sweep(|_| finalized += 1);
        assert_eq!(freed, capacity);
        assert_eq!(finalized, capacity);
        assert!(region.is_empty());

        // The free list is usable again.
        assert!(region.alloc_cell().is_some());
    }

    #[test]
    fn sweep_keeps_marked_cells() {
        let pool = RegionPool::new();
        let region = test_region(&pool, AllocKind::Scope);
        let mut cells = Vec::new();
        for _ in 0..10 {
            let addr = region.alloc_cell().unwrap();
            let cell = unsafe { CellRef::from_address(addr) };
            cell.init_header(AllocKind::Scope, false);
            cells.push(cell);
        }
        for cell in cells.iter().step_by(2) {
            assert!(region.mark_bitmap().mark_if_unmarked(cell.to_address(), MarkColor::Black));
        }
        let freed = region.sweep(|_| ());
        assert_eq!(freed, 5);
        assert_eq!(region.live_count(), 5);
        for (i, cell) in cells.iter().enumerate() {
            assert_eq!(region.is_allocated(cell.to_address()), i % 2 == 0);
        }
    }

    #[test]
    fn mark_bitmap_color_transitions() {
        let pool = RegionPool::new();
        let region = test_region(&pool, AllocKind::Symbol);
        let addr = region.alloc_cell().unwrap();
        let bitmap = region.mark_bitmap();

        assert!(!bitmap.is_marked_any(addr));
        assert!(bitmap.mark_if_unmarked(addr, MarkColor::Gray));
        assert!(bitmap.is_marked(addr, MarkColor::Gray));
        // Gray never overrides, black upgrades.
        assert!(!bitmap.mark_if_unmarked(addr, MarkColor::Gray));
        assert!(bitmap.mark_if_unmarked(addr, MarkColor::Black));
        assert!(bitmap.is_marked(addr, MarkColor::Black));
        assert!(!bitmap.is_marked(addr, MarkColor::Gray));
        assert!(!bitmap.mark_if_unmarked(addr, MarkColor::Black));

        bitmap.clear(addr);
        assert!(!bitmap.is_marked_any(addr));

        // unmark_gray only fires on gray cells.
        assert!(bitmap.mark_if_unmarked(addr, MarkColor::Gray));
        assert!(bitmap.unmark_gray(addr));
        assert!(bitmap.is_marked(addr, MarkColor::Black));
        assert!(!bitmap.unmark_gray(addr));
    }
}
