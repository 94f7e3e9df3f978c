//! The cell model: a uniform one-word header giving every allocated cell a
//! kind tag, forwarding support, and assorted flag bits, plus the typed
//! accessors for each kind's payload.
//!
//! The tri-color mark state of a tenured cell lives in its region's mark
//! bitmap, not in the header word; the accessors here hide that distinction.
//! The header word doubles as the forwarding overlay during relocation: a set
//! low bit means the rest of the word is the cell's new address, and nothing
//! else of the old cell may be read.

pub mod alloc_kind;
pub mod forwarding;
pub mod layout;
pub mod value;

pub use self::alloc_kind::{AllocKind, TraceKind, ALLOC_KIND_COUNT, KIND_INFO};
pub use self::value::Value;

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::util::constants::{BYTES_IN_WORD, CELL_ALIGN};
use crate::util::Address;

/// A set low bit turns the header word into a forwarding overlay.
pub(crate) const FORWARDED_BIT: usize = 1 << 0;
const KIND_SHIFT: usize = 1;
const KIND_MASK: usize = 0b11111 << KIND_SHIFT;
const IN_NURSERY_BIT: usize = 1 << 6;
const PERMANENT_BIT: usize = 1 << 7;
const UID_ASSIGNED_BIT: usize = 1 << 8;
const AUX_SHIFT: usize = 16;
const AUX_MASK: usize = 0xffff << AUX_SHIFT;

/// The two mark colors. An unmarked (white) cell has neither.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MarkColor {
    /// Reached, and children scanned (or queued for scanning).
    Black,
    /// Reached, but only on behalf of the external cycle collector; children
    /// are not followed by this collector.
    Gray,
}

/// A reference to a live cell. Never null; the empty case is `Option<CellRef>`
/// which has the same size.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq)]
pub struct CellRef(NonZeroUsize);

const_assert_eq!(
    std::mem::size_of::<Option<CellRef>>(),
    std::mem::size_of::<usize>()
);

impl CellRef {
    /// Create a cell reference from the address of the cell's header word.
    ///
    /// # Safety
    /// `addr` must be a non-zero, cell-aligned address of an initialized cell
    /// header.
    pub unsafe fn from_address(addr: Address) -> CellRef {
        debug_assert!(!addr.is_zero());
        debug_assert!(addr.is_aligned_to(CELL_ALIGN));
        CellRef(NonZeroUsize::new_unchecked(addr.as_usize()))
    }

    /// The address of the cell's header word.
    pub fn to_address(self) -> Address {
        unsafe { Address::from_usize(self.0.get()) }
    }

    /// The raw address value.
    pub fn as_usize(self) -> usize {
        self.0.get()
    }

    /// The address of the first payload word, just after the header.
    pub fn payload_address(self) -> Address {
        self.to_address() + BYTES_IN_WORD
    }

    fn header(self) -> &'static AtomicUsize {
        unsafe { self.to_address().as_ref::<AtomicUsize>() }
    }

    /// Write a fresh header. Only valid for a cell that is being allocated or
    /// promoted; the store is plain because nothing else can see the cell yet.
    pub(crate) fn init_header(self, kind: AllocKind, in_nursery: bool) {
        let mut word = (kind as usize) << KIND_SHIFT;
        if in_nursery {
            word |= IN_NURSERY_BIT;
        }
        self.header().store(word, Ordering::Relaxed);
    }

    pub(crate) fn header_word(self) -> usize {
        self.header().load(Ordering::Acquire)
    }

    /// The allocation kind from the header tag.
    pub fn kind(self) -> AllocKind {
        let word = self.header_word();
        debug_assert_eq!(
            word & FORWARDED_BIT,
            0,
            "kind read through a forwarding overlay"
        );
        unsafe { AllocKind::from_tag(((word & KIND_MASK) >> KIND_SHIFT) as u8) }
    }

    /// The fixed size of the cell in bytes.
    pub fn size(self) -> usize {
        self.kind().size()
    }

    /// The trace kind used to visit this cell's children.
    pub fn trace_kind(self) -> TraceKind {
        self.kind().trace_kind()
    }

    /// Does this cell currently live in the nursery?
    pub fn is_nursery(self) -> bool {
        self.header_word() & IN_NURSERY_BIT != 0
    }

    /// Is this cell tenured?
    pub fn is_tenured(self) -> bool {
        !self.is_nursery()
    }

    /// Is this a permanent cell (permanent atom or well-known symbol)?
    /// Permanent cells are trivially live and are skipped by both generations.
    pub fn is_permanent(self) -> bool {
        self.header_word() & PERMANENT_BIT != 0
    }

    pub(crate) fn set_permanent(self) {
        self.header().fetch_or(PERMANENT_BIT, Ordering::Release);
    }

    /// Has a unique id been assigned to this cell? When set, the owning
    /// zone's unique-id table has an entry for this cell that sweeping and
    /// compaction must maintain.
    pub fn has_uid(self) -> bool {
        self.header_word() & UID_ASSIGNED_BIT != 0
    }

    pub(crate) fn set_has_uid(self) {
        self.header().fetch_or(UID_ASSIGNED_BIT, Ordering::Release);
    }

    /// Kind-specific auxiliary counter packed in the header: the used slot
    /// count for objects, the length for strings.
    pub fn aux_count(self) -> usize {
        (self.header_word() & AUX_MASK) >> AUX_SHIFT
    }

    pub(crate) fn set_aux_count(self, count: usize) {
        debug_assert!(count <= 0xffff);
        let mut word = self.header().load(Ordering::Relaxed);
        loop {
            let new = (word & !AUX_MASK) | (count << AUX_SHIFT);
            match self
                .header()
                .compare_exchange_weak(word, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(cur) => word = cur,
            }
        }
    }

    /// The region holding this cell. Only valid for tenured cells.
    pub fn region(self) -> crate::heap::region::RegionRef {
        debug_assert!(self.is_tenured());
        crate::heap::region::RegionRef::containing(self.to_address())
    }

    /// The zone owning this cell. Only valid for tenured cells.
    pub fn zone(self) -> &'static crate::zone::Zone {
        self.region().zone()
    }

    /// Is this cell marked with the given color? Nursery cells are never
    /// marked.
    pub fn is_marked(self, color: MarkColor) -> bool {
        if self.is_nursery() {
            return false;
        }
        self.region().mark_bitmap().is_marked(self.to_address(), color)
    }

    /// Is this cell marked at all (black or gray)?
    pub fn is_marked_any(self) -> bool {
        if self.is_nursery() {
            return false;
        }
        self.region().mark_bitmap().is_marked_any(self.to_address())
    }

    /// Atomically mark the cell with the given color if it is not already
    /// marked with it. Returns true if this call did the marking.
    ///
    /// Marking black a cell that is currently gray succeeds and clears the
    /// gray bit; marking gray a cell that is already black is a no-op that
    /// returns false (black is the stronger color).
    pub fn mark_if_unmarked(self, color: MarkColor) -> bool {
        debug_assert!(self.is_tenured(), "nursery cells are promoted, not marked");
        self.region().mark_bitmap().mark_if_unmarked(self.to_address(), color)
    }

    /// Clear this cell's mark bits. Used by the minor collector for cells it
    /// promotes mid-collection, and by tests.
    pub fn clear_mark(self) {
        if self.is_tenured() {
            self.region().mark_bitmap().clear(self.to_address());
        }
    }
}

impl fmt::Debug for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}
