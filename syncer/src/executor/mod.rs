//! Target side of the syncer.
//!
//! The [`TargetExecutor`] trait is how queue workers apply batches of row changes and how the
//! coordinator runs DDL. [`memory::MemoryExecutor`] keeps the target tables in memory.

mod base;
pub mod memory;

pub use base::TargetExecutor;
