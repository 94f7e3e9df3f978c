use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

/// Byte accounting for a zone's tenured heap. The allocator adds to it on
/// every tenured allocation (and promotion), sweeping subtracts what it
/// frees, and the GC trigger compares the total against the zone threshold.
pub struct HeapAccounting {
    /// Bytes currently allocated to live-or-not-yet-swept cells.
    allocated: AtomicUsize,
    /// High-water mark since the last collection.
    peak: AtomicUsize,
}

impl HeapAccounting {
    pub fn new() -> Self {
        Self {
            allocated: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn add(&self, bytes: usize) {
        let now = self.allocated.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak.fetch_max(now, Ordering::Relaxed);
    }

    pub fn sub(&self, bytes: usize) {
        let prev = self.allocated.fetch_sub(bytes, Ordering::Relaxed);
        debug_assert!(prev >= bytes, "heap accounting went negative");
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Reset the high-water mark to the current allocation, after a
    /// collection finishes.
    pub fn reset_peak(&self) {
        self.peak
            .store(self.allocated.load(Ordering::Relaxed), Ordering::Relaxed);
    }
}

impl Default for HeapAccounting {
    fn default() -> Self {
        Self::new()
    }
}
