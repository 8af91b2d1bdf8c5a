//! Helpers for testing pipelines without a real source or target.
//!
//! - [`telemetry`] installs a tracing subscriber honoring `RUST_LOG`.
//! - [`events`] builds change streams with increasing locations and replays them through
//!   [`events::VecEventSource`].
//! - [`router`] is a rule based [`crate::builder::TableRouter`].
//! - [`executor`] wraps [`crate::executor::memory::MemoryExecutor`] with fault injection and a
//!   gate to stall the queues.

pub mod events;
pub mod executor;
#[cfg(feature = "failpoints")]
pub mod failpoints;
pub mod router;
pub mod telemetry;
