//! Zeal: deterministic debug perturbation of the collector.
//!
//! A zeal spec names a set of modes and a frequency, e.g. `alloc,100` to run
//! a full collection every 100 allocations, or `incremental;compact,50` to
//! force multi-slice incremental collections and compact every 50th one.
//! Zeal is meant for tests: each mode enables the named behavior
//! deterministically and promises nothing else.

use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use strum_macros::{EnumIter, EnumString};

/// The zeal modes.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumIter, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ZealMode {
    /// Run a full collection every `frequency` allocations.
    Alloc = 1,
    /// Walk the heap before each incremental slice and assert the snapshot
    /// pre-barrier has not been missed.
    VerifyPre = 2,
    /// Force incremental collections to take multiple slices by capping the
    /// per-slice budget.
    Incremental = 3,
    /// Compact every `frequency`th collection regardless of fragmentation.
    Compact = 4,
    /// Shrink: decommit nursery and free regions after every collection.
    Shrinking = 5,
    /// Walk the tenured heap before each minor collection and assert
    /// store-buffer coverage.
    VerifyPost = 6,
}

impl ZealMode {
    fn from_number(n: u8) -> Option<ZealMode> {
        match n {
            1 => Some(ZealMode::Alloc),
            2 => Some(ZealMode::VerifyPre),
            3 => Some(ZealMode::Incremental),
            4 => Some(ZealMode::Compact),
            5 => Some(ZealMode::Shrinking),
            6 => Some(ZealMode::VerifyPost),
            _ => None,
        }
    }

    fn bit(self) -> u32 {
        1 << (self as u8)
    }
}

/// A parsed zeal specification: a mode set and a frequency.
#[derive(Clone, PartialEq, Eq)]
pub struct ZealSpec {
    mode_bits: u32,
    frequency: usize,
}

/// The default zeal frequency, in the unit of the mode (allocations,
/// collections).
pub const DEFAULT_ZEAL_FREQUENCY: usize = 100;

impl ZealSpec {
    /// No zeal.
    pub const fn none() -> ZealSpec {
        ZealSpec {
            mode_bits: 0,
            frequency: DEFAULT_ZEAL_FREQUENCY,
        }
    }

    /// A spec with the given modes and frequency.
    pub fn new(modes: &[ZealMode], frequency: usize) -> ZealSpec {
        let mut mode_bits = 0;
        for mode in modes {
            mode_bits |= mode.bit();
        }
        ZealSpec {
            mode_bits,
            frequency: frequency.max(1),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.mode_bits != 0
    }

    pub fn has(&self, mode: ZealMode) -> bool {
        self.mode_bits & mode.bit() != 0
    }

    pub fn frequency(&self) -> usize {
        self.frequency
    }
}

impl fmt::Debug for ZealSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ZealSpec({:#b}, every {})", self.mode_bits, self.frequency)
    }
}

/// Error from parsing a zeal spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetZealError(pub String);

impl fmt::Display for SetZealError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid zeal spec: {}", self.0)
    }
}

impl std::error::Error for SetZealError {}

impl FromStr for ZealSpec {
    type Err = SetZealError;

    /// Parse `mode[;mode...][,frequency]`, where each mode is a name
    /// (`alloc`, `verifypre`, `incremental`, `compact`, `shrinking`,
    /// `verifypost`) or its number. An empty string or `none` disables zeal.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        lazy_static! {
            static ref ZEAL_REGEX: Regex =
                Regex::new(r"^(?P<modes>[A-Za-z0-9;]*)(,(?P<freq>\d+))?$").unwrap();
        }
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("none") {
            return Ok(ZealSpec::none());
        }
        let captures = ZEAL_REGEX
            .captures(s)
            .ok_or_else(|| SetZealError(s.to_string()))?;
        let frequency = match captures.name("freq") {
            Some(freq) => freq
                .as_str()
                .parse::<usize>()
                .map_err(|_| SetZealError(s.to_string()))?,
            None => DEFAULT_ZEAL_FREQUENCY,
        };
        let mut modes = Vec::new();
        for word in captures["modes"].split(';').filter(|w| !w.is_empty()) {
            let mode = if let Ok(number) = word.parse::<u8>() {
                ZealMode::from_number(number)
            } else {
                ZealMode::from_str(&word.to_lowercase()).ok()
            };
            modes.push(mode.ok_or_else(|| SetZealError(s.to_string()))?);
        }
        if modes.is_empty() {
            return Err(SetZealError(s.to_string()));
        }
        Ok(ZealSpec::new(&modes, frequency))
    }
}

/// The runtime's live zeal state.
pub struct ZealState {
    spec: Mutex<ZealSpec>,
    /// Allocations left until the next alloc-triggered collection.
    alloc_countdown: AtomicUsize,
    /// Collections since the last forced compaction.
    gc_countdown: AtomicUsize,
}

impl ZealState {
    pub(crate) fn new(spec: ZealSpec) -> ZealState {
        let frequency = spec.frequency();
        ZealState {
            spec: Mutex::new(spec),
            alloc_countdown: AtomicUsize::new(frequency),
            gc_countdown: AtomicUsize::new(frequency),
        }
    }

    pub fn spec(&self) -> ZealSpec {
        self.spec.lock().unwrap().clone()
    }

    /// Install a new mode set and frequency.
    pub fn set(&self, spec: ZealSpec) {
        self.alloc_countdown.store(spec.frequency(), Ordering::Relaxed);
        self.gc_countdown.store(spec.frequency(), Ordering::Relaxed);
        *self.spec.lock().unwrap() = spec;
    }

    pub fn has(&self, mode: ZealMode) -> bool {
        self.spec.lock().unwrap().has(mode)
    }

    /// Count one allocation; returns true when the alloc-trigger fires.
    pub(crate) fn count_alloc(&self) -> bool {
        if !self.has(ZealMode::Alloc) {
            return false;
        }
        let prev = self.alloc_countdown.fetch_sub(1, Ordering::Relaxed);
        if prev <= 1 {
            self.alloc_countdown
                .store(self.spec.lock().unwrap().frequency(), Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Count one major collection; returns true when a forced compaction is
    /// due.
    pub(crate) fn count_gc_for_compact(&self) -> bool {
        if !self.has(ZealMode::Compact) {
            return false;
        }
        let prev = self.gc_countdown.fetch_sub(1, Ordering::Relaxed);
        if prev <= 1 {
            self.gc_countdown
                .store(self.spec.lock().unwrap().frequency(), Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_named_modes() {
        let spec: ZealSpec = "alloc;compact,50".parse().unwrap();
        assert!(spec.has(ZealMode::Alloc));
        assert!(spec.has(ZealMode::Compact));
        assert!(!spec.has(ZealMode::VerifyPre));
        assert_eq!(spec.frequency(), 50);
    }

    #[test]
    fn parse_numbered_modes() {
        let spec: ZealSpec = "2;3".parse().unwrap();
        assert!(spec.has(ZealMode::VerifyPre));
        assert!(spec.has(ZealMode::Incremental));
        assert_eq!(spec.frequency(), DEFAULT_ZEAL_FREQUENCY);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("7".parse::<ZealSpec>().is_err());
        assert!("alloc,".parse::<ZealSpec>().is_err());
        assert!("frob".parse::<ZealSpec>().is_err());
    }

    #[test]
    fn parse_none() {
        assert!(!"".parse::<ZealSpec>().unwrap().is_enabled());
        assert!(!"none".parse::<ZealSpec>().unwrap().is_enabled());
    }

    #[test]
    fn alloc_countdown_fires_at_frequency() {
        let state = ZealState::new(ZealSpec::new(&[ZealMode::Alloc], 3));
        assert!(!state.count_alloc());
        assert!(!state.count_alloc());
        assert!(state.count_alloc());
        assert!(!state.count_alloc());
    }
}
