use atomic_refcell::AtomicRefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

/// Global states for a runtime instance. Components keep a reference to this
/// struct rather than to the runtime, so the access pattern stays easy to
/// reason about.
pub struct GlobalState {
    /// Set once the runtime is fully constructed.
    pub(crate) initialized: AtomicBool,
    /// The heap-busy token: a collector phase (major slice or minor GC) is
    /// running. Root iteration requires it; barriers consult it to tell
    /// collector writes from mutator writes.
    heap_busy: AtomicBool,
    /// Depth of nested unsafe-GC regions: sections of host code that must
    /// not trigger a collection (and therefore may not allocate).
    unsafe_regions: AtomicUsize,
    /// Completed major collections.
    pub(crate) major_gc_number: AtomicUsize,
    /// Completed minor collections.
    pub(crate) minor_gc_count: AtomicUsize,
    /// Incremental slices run, over all collections.
    pub(crate) slice_count: AtomicUsize,
    /// Bytes promoted out of the nursery, over all minor collections.
    pub(crate) bytes_promoted: AtomicUsize,
    /// When the in-progress major collection started.
    pub(crate) gc_start_time: AtomicRefCell<Option<Instant>>,
}

impl GlobalState {
    pub(crate) fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            heap_busy: AtomicBool::new(false),
            unsafe_regions: AtomicUsize::new(0),
            major_gc_number: AtomicUsize::new(0),
            minor_gc_count: AtomicUsize::new(0),
            slice_count: AtomicUsize::new(0),
            bytes_promoted: AtomicUsize::new(0),
            gc_start_time: AtomicRefCell::new(None),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Is a collector phase running right now?
    pub fn is_heap_busy(&self) -> bool {
        self.heap_busy.load(Ordering::Acquire)
    }

    pub(crate) fn set_heap_busy(&self, busy: bool) {
        let was = self.heap_busy.swap(busy, Ordering::AcqRel);
        debug_assert_ne!(was, busy, "heap-busy token is not reentrant");
    }

    /// Enter a region in which triggering a GC is forbidden.
    pub fn enter_unsafe_region(&self) {
        self.unsafe_regions.fetch_add(1, Ordering::AcqRel);
    }

    /// Leave an unsafe-GC region.
    pub fn leave_unsafe_region(&self) {
        let prev = self.unsafe_regions.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unbalanced unsafe-region exit");
    }

    pub fn in_unsafe_region(&self) -> bool {
        self.unsafe_regions.load(Ordering::Acquire) > 0
    }

    /// The number of completed major collections.
    pub fn major_gc_number(&self) -> usize {
        self.major_gc_number.load(Ordering::Relaxed)
    }

    /// The number of completed minor collections.
    pub fn minor_gc_count(&self) -> usize {
        self.minor_gc_count.load(Ordering::Relaxed)
    }

    /// The number of incremental slices run.
    pub fn slice_count(&self) -> usize {
        self.slice_count.load(Ordering::Relaxed)
    }

    /// Total bytes promoted out of nurseries.
    pub fn bytes_promoted(&self) -> usize {
        self.bytes_promoted.load(Ordering::Relaxed)
    }
}

/// RAII guard for the heap-busy token.
pub(crate) struct HeapBusyGuard<'a> {
    state: &'a GlobalState,
}

impl<'a> HeapBusyGuard<'a> {
    pub fn new(state: &'a GlobalState) -> HeapBusyGuard<'a> {
        state.set_heap_busy(true);
        HeapBusyGuard { state }
    }
}

impl Drop for HeapBusyGuard<'_> {
    fn drop(&mut self) {
        self.state.set_heap_busy(false);
    }
}
