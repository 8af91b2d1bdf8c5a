//! Persistence of per-queue checkpoints.
//!
//! Every queue owns one bucket named after its index (see [`crate::router::queue_bucket_name`]).
//! A bucket stores the location up to which the queue has durably applied its jobs, and on restart
//! the minimum over all buckets is where reading resumes.

mod base;
pub mod memory;

pub use base::CheckpointStore;
