//! The closed set of allocation kinds, and the static metadata table that
//! drives size classes, nursery policy, finalization discipline, and tracing.

use enum_map::Enum;
use strum_macros::{EnumCount, EnumIter, EnumString};

use crate::util::constants::BYTES_IN_WORD;

/// Every cell in the heap belongs to exactly one allocation kind. The kind is
/// stored in the cell header and determines the cell's size class, whether it
/// may live in the nursery, how it is finalized, and how its children are
/// traced.
///
/// The `ObjectN` kinds are object size classes: an object with `N` inline
/// value slots. Each size class comes in a plain flavor and a
/// background-finalizable flavor, so that objects whose finalizers are
/// thread-safe can be swept off-thread.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Enum, EnumCount, EnumIter, EnumString)]
pub enum AllocKind {
    Object0,
    Object0Background,
    Object2,
    Object2Background,
    Object4,
    Object4Background,
    Object8,
    Object8Background,
    Object12,
    Object12Background,
    Object16,
    Object16Background,
    Script,
    LazyScript,
    Shape,
    AccessorShape,
    BaseShape,
    ObjectGroup,
    FatInlineString,
    String,
    ExternalString,
    FatInlineAtom,
    Atom,
    Symbol,
    JitCode,
    Scope,
    RegExpShared,
}

/// The number of allocation kinds.
pub const ALLOC_KIND_COUNT: usize = <AllocKind as strum::EnumCount>::COUNT;
const_assert_eq!(ALLOC_KIND_COUNT, 27);

/// How the children of a cell are traced. There is one trace kind per cell
/// layout; several allocation kinds can share a layout (all object size
/// classes trace as `Object`).
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Enum, EnumCount, EnumIter)]
pub enum TraceKind {
    Object,
    String,
    ExternalString,
    Atom,
    Symbol,
    Script,
    LazyScript,
    Shape,
    AccessorShape,
    BaseShape,
    ObjectGroup,
    JitCode,
    Scope,
    RegExpShared,
}

const_assert_eq!(<TraceKind as strum::EnumCount>::COUNT, 14);

/// Static metadata for one allocation kind.
pub struct KindInfo {
    /// Fixed cell size in bytes, including the header word.
    pub size: usize,
    /// May cells of this kind be allocated in the nursery?
    pub nursery_allocable: bool,
    /// Is this kind finalized on the background helper thread?
    pub background_finalizable: bool,
    /// Does this kind participate in the external cycle collector (i.e. may
    /// it be marked gray)?
    pub cycle_collectable: bool,
    /// The trace kind used to visit this cell's children.
    pub trace_kind: TraceKind,
}

const W: usize = BYTES_IN_WORD;

const fn object_info(slots: usize, background: bool) -> KindInfo {
    KindInfo {
        // header + shape + group + inline slots
        size: (3 + slots) * W,
        // Objects with untrusted finalizers stay out of the nursery.
        nursery_allocable: !background,
        background_finalizable: background,
        cycle_collectable: true,
        trace_kind: TraceKind::Object,
    }
}

const fn info(
    size_words: usize,
    nursery_allocable: bool,
    background_finalizable: bool,
    cycle_collectable: bool,
    trace_kind: TraceKind,
) -> KindInfo {
    KindInfo {
        size: size_words * W,
        nursery_allocable,
        background_finalizable,
        cycle_collectable,
        trace_kind,
    }
}

/// The kind metadata table. Indexed by `AllocKind as usize`.
#[rustfmt::skip]
pub static KIND_INFO: [KindInfo; ALLOC_KIND_COUNT] = [
    /* Object0 */            object_info(0, false),
    /* Object0Background */  object_info(0, true),
    /* Object2 */            object_info(2, false),
    /* Object2Background */  object_info(2, true),
    /* Object4 */            object_info(4, false),
    /* Object4Background */  object_info(4, true),
    /* Object8 */            object_info(8, false),
    /* Object8Background */  object_info(8, true),
    /* Object12 */           object_info(12, false),
    /* Object12Background */ object_info(12, true),
    /* Object16 */           object_info(16, false),
    /* Object16Background */ object_info(16, true),
    /* Script */             info(8, false, false, true,  TraceKind::Script),
    /* LazyScript */         info(6, false, false, true,  TraceKind::LazyScript),
    /* Shape */              info(6, false, false, false, TraceKind::Shape),
    /* AccessorShape */      info(8, false, false, false, TraceKind::AccessorShape),
    /* BaseShape */          info(4, false, false, false, TraceKind::BaseShape),
    /* ObjectGroup */        info(4, false, false, false, TraceKind::ObjectGroup),
    /* FatInlineString */    info(4, false, true,  false, TraceKind::String),
    /* String */             info(4, false, true,  false, TraceKind::String),
    /* ExternalString */     info(4, false, true,  false, TraceKind::ExternalString),
    /* FatInlineAtom */      info(4, false, true,  false, TraceKind::Atom),
    /* Atom */               info(4, false, true,  false, TraceKind::Atom),
    /* Symbol */             info(3, false, true,  false, TraceKind::Symbol),
    /* JitCode */            info(8, false, false, true,  TraceKind::JitCode),
    /* Scope */              info(4, false, false, false, TraceKind::Scope),
    /* RegExpShared */       info(5, false, false, false, TraceKind::RegExpShared),
];

impl AllocKind {
    /// Static metadata for this kind.
    pub fn info(self) -> &'static KindInfo {
        &KIND_INFO[self as usize]
    }

    /// Fixed cell size in bytes, including the header word.
    pub fn size(self) -> usize {
        self.info().size
    }

    /// May cells of this kind be allocated in the nursery?
    pub fn is_nursery_allocable(self) -> bool {
        self.info().nursery_allocable
    }

    /// Is this kind finalized on the background helper thread?
    pub fn is_background_finalizable(self) -> bool {
        self.info().background_finalizable
    }

    /// Does this kind participate in the external cycle collector?
    pub fn is_cycle_collectable(self) -> bool {
        self.info().cycle_collectable
    }

    /// The trace kind used to visit this cell's children.
    pub fn trace_kind(self) -> TraceKind {
        self.info().trace_kind
    }

    /// Is this one of the object size classes?
    pub fn is_object(self) -> bool {
        matches!(self.trace_kind(), TraceKind::Object)
    }

    /// The number of inline value slots for an object kind. Panics for
    /// non-object kinds.
    pub fn object_slot_count(self) -> usize {
        debug_assert!(self.is_object());
        self.size() / BYTES_IN_WORD - 3
    }

    /// The smallest object kind with at least `slots` inline slots, in the
    /// requested finalization flavor. `None` if no size class fits.
    pub fn object_kind_for_slots(slots: usize, background: bool) -> Option<AllocKind> {
        let plain = match slots {
            0 => AllocKind::Object0,
            1..=2 => AllocKind::Object2,
            3..=4 => AllocKind::Object4,
            5..=8 => AllocKind::Object8,
            9..=12 => AllocKind::Object12,
            13..=16 => AllocKind::Object16,
            _ => return None,
        };
        if background {
            // The background flavor is always the next enum value.
            Some(unsafe { std::mem::transmute::<u8, AllocKind>(plain as u8 + 1) })
        } else {
            Some(plain)
        }
    }

    /// Map the plain/background flavors of a kind onto the plain one, so that
    /// the two flavors can share lookup tables keyed by layout.
    pub fn canonical(self) -> AllocKind {
        match self {
            AllocKind::Object0Background => AllocKind::Object0,
            AllocKind::Object2Background => AllocKind::Object2,
            AllocKind::Object4Background => AllocKind::Object4,
            AllocKind::Object8Background => AllocKind::Object8,
            AllocKind::Object12Background => AllocKind::Object12,
            AllocKind::Object16Background => AllocKind::Object16,
            k => k,
        }
    }

    /// Decode a kind from its header tag value.
    ///
    /// # Safety
    /// `tag` must be a value previously produced by `kind as u8`.
    pub unsafe fn from_tag(tag: u8) -> AllocKind {
        debug_assert!((tag as usize) < ALLOC_KIND_COUNT);
        std::mem::transmute::<u8, AllocKind>(tag)
    }
}

/// The kinds swept on the foreground (mutator) thread, in sweep order.
/// Shapes and base shapes go last: finalizing scripts and objects may still
/// consult their shape tables.
pub static FOREGROUND_SWEEP_ORDER: &[AllocKind] = &[
    AllocKind::Object0,
    AllocKind::Object2,
    AllocKind::Object4,
    AllocKind::Object8,
    AllocKind::Object12,
    AllocKind::Object16,
    AllocKind::Script,
    AllocKind::LazyScript,
    AllocKind::JitCode,
    AllocKind::RegExpShared,
    AllocKind::Scope,
    AllocKind::ObjectGroup,
    AllocKind::AccessorShape,
    AllocKind::Shape,
    AllocKind::BaseShape,
];

/// The kinds handed to the background finalization thread.
pub static BACKGROUND_SWEEP_ORDER: &[AllocKind] = &[
    AllocKind::Object0Background,
    AllocKind::Object2Background,
    AllocKind::Object4Background,
    AllocKind::Object8Background,
    AllocKind::Object12Background,
    AllocKind::Object16Background,
    AllocKind::FatInlineString,
    AllocKind::String,
    AllocKind::ExternalString,
    AllocKind::FatInlineAtom,
    AllocKind::Atom,
    AllocKind::Symbol,
];

/// The kinds eligible for compaction. Cells that external code may hold raw
/// pointers to (external strings, jit code) never move.
pub static COMPACTABLE_KINDS: &[AllocKind] = &[
    AllocKind::Object0,
    AllocKind::Object0Background,
    AllocKind::Object2,
    AllocKind::Object2Background,
    AllocKind::Object4,
    AllocKind::Object4Background,
    AllocKind::Object8,
    AllocKind::Object8Background,
    AllocKind::Object12,
    AllocKind::Object12Background,
    AllocKind::Object16,
    AllocKind::Object16Background,
    AllocKind::Shape,
    AllocKind::AccessorShape,
    AllocKind::BaseShape,
    AllocKind::ObjectGroup,
    AllocKind::FatInlineString,
    AllocKind::String,
    AllocKind::FatInlineAtom,
    AllocKind::Atom,
    AllocKind::Scope,
];

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn every_kind_has_sane_metadata() {
        for kind in AllocKind::iter() {
            let info = kind.info();
            assert!(info.size >= 2 * BYTES_IN_WORD, "{:?} too small", kind);
            assert_eq!(info.size % BYTES_IN_WORD, 0, "{:?} misaligned", kind);
            assert_eq!(info.trace_kind, kind.trace_kind());
        }
    }

    #[test]
    fn object_size_classes() {
        assert_eq!(AllocKind::Object0.object_slot_count(), 0);
        assert_eq!(AllocKind::Object16Background.object_slot_count(), 16);
        assert_eq!(
            AllocKind::object_kind_for_slots(3, false),
            Some(AllocKind::Object4)
        );
        assert_eq!(
            AllocKind::object_kind_for_slots(3, true),
            Some(AllocKind::Object4Background)
        );
        assert_eq!(
            AllocKind::object_kind_for_slots(16, false),
            Some(AllocKind::Object16)
        );
        assert_eq!(AllocKind::object_kind_for_slots(17, false), None);
    }

    // One size-class test per object kind.
    macro_rules! object_size_class_tests {
        ($($kind:ident => $slots:literal),* $(,)?) => {
            paste::paste! {
                $(
                    #[test]
                    fn [<$kind:snake _has_ $slots _inline_slots>]() {
                        assert!(AllocKind::$kind.is_object());
                        assert_eq!(AllocKind::$kind.object_slot_count(), $slots);
                        assert_eq!(
                            AllocKind::$kind.size(),
                            (3 + $slots) * BYTES_IN_WORD
                        );
                    }
                )*
            }
        };
    }

    object_size_class_tests! {
        Object0 => 0,
        Object2 => 2,
        Object4 => 4,
        Object8 => 8,
        Object12 => 12,
        Object16 => 16,
    }

    #[test]
    fn sweep_orders_cover_all_kinds() {
        let mut seen: Vec<AllocKind> = FOREGROUND_SWEEP_ORDER
            .iter()
            .chain(BACKGROUND_SWEEP_ORDER.iter())
            .copied()
            .collect();
        seen.sort_by_key(|k| *k as u8);
        seen.dedup();
        assert_eq!(seen.len(), ALLOC_KIND_COUNT);
        for kind in BACKGROUND_SWEEP_ORDER {
            assert!(kind.is_background_finalizable());
        }
        for kind in FOREGROUND_SWEEP_ORDER {
            assert!(!kind.is_background_finalizable());
        }
    }
}
