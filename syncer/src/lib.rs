//! Replication core turning a linear change stream into parallel, ordered writes.
//!
//! Events read from the source are turned into [`job::Job`]s by the [`builder::JobBuilder`],
//! each carrying a snapshot of the stream [`location`]. The [`pipeline::Pipeline`] routes row
//! changes to worker queues by target table, so that changes of one table keep their order while
//! unrelated tables are written in parallel, and broadcasts every other job as a barrier. The
//! checkpoint only advances once every queue acknowledged a barrier, and after a crash reading
//! resumes from the smallest persisted bucket with safe mode enabled until the replayed range is
//! passed.

pub mod builder;
pub mod checkpoint;
pub mod concurrency;
pub mod error;
pub mod executor;
#[cfg(feature = "failpoints")]
pub mod failpoints;
pub mod job;
pub mod location;
mod macros;
pub mod pipeline;
pub mod router;
pub mod sharding;
pub mod source;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod workers;
