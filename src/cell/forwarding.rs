//! The forwarding overlay. When a cell is relocated (promotion out of the
//! nursery, or compaction of the tenured heap), its header word is overwritten
//! in place with the new address plus a set low bit. Readers that may race
//! with relocation must check `is_forwarded` before touching any other field
//! of the cell.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::{CellRef, FORWARDED_BIT};
use crate::util::constants::CELL_ALIGN;
use crate::util::Address;

fn header(cell: CellRef) -> &'static AtomicUsize {
    unsafe { cell.to_address().as_ref::<AtomicUsize>() }
}

/// Has this cell been relocated?
pub fn is_forwarded(cell: CellRef) -> bool {
    header(cell).load(Ordering::Acquire) & FORWARDED_BIT != 0
}

/// Overwrite the cell's header with a forwarding overlay pointing at
/// `new_cell`. The release store publishes the fully initialized copy: the
/// copy's header (including its kind) must be written before this is called,
/// so a concurrent kind-reader either sees the old header or a complete new
/// cell, never a half-built one.
pub fn forward(cell: CellRef, new_cell: CellRef) {
    debug_assert!(!is_forwarded(cell));
    debug_assert!(new_cell.to_address().is_aligned_to(CELL_ALIGN));
    trace!("forward {} -> {}", cell, new_cell);
    header(cell).store(new_cell.as_usize() | FORWARDED_BIT, Ordering::Release);
}

/// Read the forwarding overlay. Only valid if `is_forwarded(cell)`.
pub fn forwarded_target(cell: CellRef) -> CellRef {
    let word = header(cell).load(Ordering::Acquire);
    debug_assert!(word & FORWARDED_BIT != 0, "cell {} is not forwarded", cell);
    unsafe { CellRef::from_address(Address::from_usize(word & !FORWARDED_BIT)) }
}

/// Follow the overlay if the cell has moved, otherwise return the cell
/// itself. This is the "maybe forwarded" read every pointer dereference must
/// go through while a relocating phase is in progress.
pub fn maybe_forwarded(cell: CellRef) -> CellRef {
    if is_forwarded(cell) {
        forwarded_target(cell)
    } else {
        cell
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::AllocKind;

    #[test]
    fn overlay_round_trip() {
        // Two fake cells backed by plain arrays; the overlay only touches the
        // header word.
        let mut old = [0usize; 4];
        let mut new = [0usize; 4];
        let old_cell = unsafe { CellRef::from_address(Address::from_mut_ptr(old.as_mut_ptr())) };
        let new_cell = unsafe { CellRef::from_address(Address::from_mut_ptr(new.as_mut_ptr())) };
        old_cell.init_header(AllocKind::Symbol, false);
        new_cell.init_header(AllocKind::Symbol, false);

        assert!(!is_forwarded(old_cell));
        assert_eq!(maybe_forwarded(old_cell), old_cell);

        forward(old_cell, new_cell);
        assert!(is_forwarded(old_cell));
        assert_eq!(forwarded_target(old_cell), new_cell);
        assert_eq!(maybe_forwarded(old_cell), new_cell);
        assert_eq!(maybe_forwarded(new_cell), new_cell);
    }
}
