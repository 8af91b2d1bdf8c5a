use std::future::Future;

use crate::error::SyncerResult;
use crate::job::DmlPayload;

/// Trait for targets that replicated changes are applied to.
///
/// Row changes arrive in batches from a single queue. A batch must be applied atomically: either
/// every change is visible afterwards or none is, because a failed batch is retried as a whole.
/// Batches of different queues touch disjoint tables and may be applied concurrently.
///
/// DDL is only ever executed by the coordinator once every queue is drained, so no batch runs
/// concurrently with [`TargetExecutor::execute_ddl`].
pub trait TargetExecutor {
    /// Returns the name of the target.
    fn name() -> &'static str;

    /// Propagates the shutdown signal to the target.
    ///
    /// The default implementation is a no-op.
    fn shutdown(&self) -> impl Future<Output = SyncerResult<()>> + Send {
        async { Ok(()) }
    }

    /// Applies a batch of row changes produced by queue `queue`, in order.
    ///
    /// When a change is in safe mode the target must apply it idempotently: inserts replace an
    /// existing row with the same key and updates are rewritten as a delete followed by a
    /// replace.
    fn execute_dml(
        &self,
        queue: usize,
        batch: Vec<DmlPayload>,
    ) -> impl Future<Output = SyncerResult<()>> + Send;

    /// Executes schema change statements, in order.
    fn execute_ddl(&self, statements: Vec<String>) -> impl Future<Output = SyncerResult<()>> + Send;
}
