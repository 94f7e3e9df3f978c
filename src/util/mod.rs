//! Utilities used by other modules, including the address type, memory
//! mapping, logging, and runtime options.

/// Address type
pub mod address;
/// Constants used in tephra
pub mod constants;
/// Wrapper functions for the libc memory mapping calls.
pub mod memory;
/// The built-in logger implementation.
pub mod logger;
/// Runtime options, including zeal.
pub mod options;

pub use self::address::Address;
