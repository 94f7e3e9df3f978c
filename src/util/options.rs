//! Runtime options.
//!
//! `Options` is a plain struct of typed fields with built-in defaults. All
//! mutation goes through [`Options::set`], which parses the textual value and
//! enforces each option's range in one place, so an `Options` in hand is
//! always internally valid. Values can come from the builder API, from
//! `key=value` bulk strings, or from `TEPHRA_`-prefixed environment variables
//! (e.g. `TEPHRA_NURSERY_BYTES=65536`).

use std::fmt;
use std::str::FromStr;

use crate::util::constants::BYTES_IN_MBYTE;
use crate::zeal::ZealSpec;

/// The runtime options. Read directly; write through [`Options::set`].
#[derive(Clone)]
pub struct Options {
    /// The nursery size in bytes. At least one page.
    pub nursery_bytes: usize,
    /// Generational collection. When off, every allocation is tenured and
    /// minor collections are no-ops.
    pub generational: bool,
    /// Allow incremental collection; when off, every collection runs in one
    /// unbounded slice.
    pub incremental: bool,
    /// The mark stack entry limit; past it, marking takes the delayed path.
    pub mark_stack_limit: usize,
    /// Zone trigger growth: the surviving heap size is multiplied by this to
    /// give the next collection threshold.
    pub gc_growth_factor: f64,
    /// The smallest per-zone trigger threshold, in bytes.
    pub gc_min_threshold_bytes: usize,
    /// Finalize background-finalizable kinds on the helper thread.
    pub background_finalization: bool,
    /// Compact the tenured heap at the end of full collections.
    pub compacting: bool,
    /// A region whose live-cell fraction is below this is a relocation
    /// source.
    pub compact_fragmentation_threshold: f64,
    /// Deterministic debug perturbation, e.g. `alloc;compact,100`.
    pub zeal: ZealSpec,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            nursery_bytes: 256 * 1024,
            generational: true,
            incremental: true,
            mark_stack_limit: crate::mark::DEFAULT_MARK_STACK_LIMIT,
            gc_growth_factor: 1.5,
            gc_min_threshold_bytes: BYTES_IN_MBYTE,
            background_finalization: true,
            compacting: true,
            compact_fragmentation_threshold: 0.5,
            zeal: ZealSpec::none(),
        }
    }
}

/// Why an option could not be set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionError {
    /// The key names no option.
    UnknownKey(String),
    /// The value did not parse as the option's type.
    Unparsable { key: &'static str, value: String },
    /// The value parsed but fails the option's range check.
    OutOfRange { key: &'static str, value: String },
    /// A bulk string entry was not of the form `key=value`.
    MalformedPair(String),
}

impl fmt::Display for OptionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OptionError::UnknownKey(key) => write!(f, "unknown option {:?}", key),
            OptionError::Unparsable { key, value } => {
                write!(f, "option {} cannot take the value {:?}", key, value)
            }
            OptionError::OutOfRange { key, value } => {
                write!(f, "option {} is out of range at {:?}", key, value)
            }
            OptionError::MalformedPair(pair) => {
                write!(f, "expected key=value, got {:?}", pair)
            }
        }
    }
}

impl std::error::Error for OptionError {}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, OptionError> {
    value.parse::<T>().map_err(|_| OptionError::Unparsable {
        key,
        value: value.to_string(),
    })
}

fn in_range<T>(key: &'static str, value: &str, v: T, ok: bool) -> Result<T, OptionError> {
    if ok {
        Ok(v)
    } else {
        Err(OptionError::OutOfRange {
            key,
            value: value.to_string(),
        })
    }
}

impl Options {
    /// Set one option from its textual value, validating it on the way in.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), OptionError> {
        match key {
            "nursery_bytes" => {
                let v = parse::<usize>("nursery_bytes", value)?;
                self.nursery_bytes = in_range("nursery_bytes", value, v, v >= 4096)?;
            }
            "generational" => self.generational = parse("generational", value)?,
            "incremental" => self.incremental = parse("incremental", value)?,
            "mark_stack_limit" => {
                let v = parse::<usize>("mark_stack_limit", value)?;
                self.mark_stack_limit = in_range("mark_stack_limit", value, v, v >= 16)?;
            }
            "gc_growth_factor" => {
                let v = parse::<f64>("gc_growth_factor", value)?;
                self.gc_growth_factor =
                    in_range("gc_growth_factor", value, v, (1.0..=10.0).contains(&v))?;
            }
            "gc_min_threshold_bytes" => {
                let v = parse::<usize>("gc_min_threshold_bytes", value)?;
                self.gc_min_threshold_bytes =
                    in_range("gc_min_threshold_bytes", value, v, v > 0)?;
            }
            "background_finalization" => {
                self.background_finalization = parse("background_finalization", value)?
            }
            "compacting" => self.compacting = parse("compacting", value)?,
            "compact_fragmentation_threshold" => {
                let v = parse::<f64>("compact_fragmentation_threshold", value)?;
                self.compact_fragmentation_threshold = in_range(
                    "compact_fragmentation_threshold",
                    value,
                    v,
                    v > 0.0 && v <= 1.0,
                )?;
            }
            "zeal" => self.zeal = parse("zeal", value)?,
            _ => return Err(OptionError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Set several options at once from `key=value` pairs separated by
    /// whitespace or commas. Stops at the first bad pair.
    pub fn set_bulk(&mut self, pairs: &str) -> Result<(), OptionError> {
        for pair in pairs.replace(',', " ").split_ascii_whitespace() {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| OptionError::MalformedPair(pair.to_string()))?;
            self.set(key, value)?;
        }
        Ok(())
    }

    /// Apply every `TEPHRA_`-prefixed environment variable that names an
    /// option. Bad values are logged and skipped rather than failing runtime
    /// construction.
    pub fn apply_env_vars(&mut self) {
        for (key, value) in std::env::vars() {
            let Some(name) = key.strip_prefix("TEPHRA_") else {
                continue;
            };
            let name = name.to_lowercase();
            match self.set(&name, &value) {
                Ok(()) => debug!("option {} = {:?} from the environment", name, value),
                Err(OptionError::UnknownKey(_)) => {}
                Err(e) => warn!("ignoring {}={:?}: {}", key, value, e),
            }
        }
    }
}
