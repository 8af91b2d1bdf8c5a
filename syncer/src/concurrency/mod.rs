//! Concurrency utilities coordinating the coordinator and the queue workers.
//!
//! - [`shutdown`] broadcasts a shutdown request to the producer loop.
//! - [`countdown`] is the per-barrier rendezvous: the coordinator waits until every queue has
//!   acknowledged a barrier job before it advances the checkpoint.
//! - [`timer`] arms the batch fill deadline inside the workers' `select!` loops.

pub mod countdown;
pub mod shutdown;
pub mod timer;
