//! Tephra is an incremental, generational, compacting mark-and-sweep garbage
//! collector core for dynamic-language runtimes. The heap holds many small
//! cells of a closed set of kinds (objects, strings, scripts, shapes, scopes,
//! symbols and friends), partitioned into zones that are the unit of
//! independent collection.
//!
//! Logically, this crate includes these major parts:
//! * The [cell model](cell/index.html): a uniform header giving every
//!   allocated cell a kind tag, tri-color mark state, and forwarding support.
//! * The [heap](heap/index.html): page-aligned regions holding cells of a
//!   single kind, with per-region mark bitmaps and free lists.
//! * [Zones, zone groups and compartments](zone/index.html): the partitions
//!   at which collection decisions are made, and the exclusive-access domains
//!   mutator threads cooperate on.
//! * The [write and read barriers](barrier/index.html) that let the mutator
//!   run between collection slices without losing reachable cells.
//! * The [nursery](nursery/index.html) and [store buffer](store_buffer/index.html)
//!   implementing the two-generation promotion path.
//! * The [marker](mark/index.html), [incremental driver](driver/index.html),
//!   and the [sweeping](sweep/index.html) and [compacting](compact/index.html)
//!   phases they drive.
//!
//! The language interpreter, JIT, and parser are external collaborators: they
//! supply roots and invoke barriers through the API in
//! [`memory_manager`](memory_manager/index.html), and everything else happens
//! behind that surface.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
#[macro_use]
extern crate static_assertions;

pub mod util;

pub mod alloc;
pub mod barrier;
pub mod budget;
pub mod cell;
pub mod compact;
pub mod driver;
mod global_state;
pub mod heap;
pub mod mark;
pub mod memory_manager;
pub mod nursery;
pub mod roots;
mod runtime;
pub mod store_buffer;
pub mod sweep;
pub mod trace;
pub mod zeal;
pub mod zone;

pub use crate::global_state::GlobalState;
pub use crate::runtime::{GcProgress, GcRuntime, Mutator, RuntimeBuilder, ZoneSpec};
