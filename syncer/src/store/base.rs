use std::collections::BTreeMap;
use std::future::Future;

use crate::error::SyncerResult;
use crate::location::Location;

/// Trait for storing and retrieving queue checkpoints.
///
/// Implementations must be safe to call concurrently from every queue worker, each worker only
/// ever writes its own bucket while the coordinator may write all of them at once.
pub trait CheckpointStore {
    /// Loads the persisted checkpoint of every bucket.
    ///
    /// Called once when the pipeline starts, an empty map means nothing was ever persisted.
    fn load_checkpoints(&self)
    -> impl Future<Output = SyncerResult<BTreeMap<String, Location>>> + Send;

    /// Persists several buckets atomically.
    fn store_checkpoints(
        &self,
        updates: Vec<(String, Location)>,
    ) -> impl Future<Output = SyncerResult<()>> + Send;

    /// Persists the checkpoint of a single bucket.
    fn store_checkpoint(
        &self,
        bucket: String,
        location: Location,
    ) -> impl Future<Output = SyncerResult<()>> + Send {
        self.store_checkpoints(vec![(bucket, location)])
    }
}
