use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::SyncerResult;
use crate::location::Location;
use crate::store::CheckpointStore;

#[derive(Debug, Default)]
struct Inner {
    checkpoints: BTreeMap<String, Location>,
    /// Every write in order, used to inspect how checkpoints moved.
    history: Vec<(String, Location)>,
}

/// In-memory [`CheckpointStore`], for tests and for running without durable state.
///
/// Checkpoints are lost when the process terminates. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `checkpoints`, as if a previous run persisted them.
    pub fn with_checkpoints(checkpoints: impl IntoIterator<Item = (String, Location)>) -> Self {
        let inner = Inner {
            checkpoints: checkpoints.into_iter().collect(),
            history: Vec::new(),
        };

        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Returns the current checkpoint of `bucket`.
    pub async fn checkpoint(&self, bucket: &str) -> Option<Location> {
        let inner = self.inner.lock().await;
        inner.checkpoints.get(bucket).cloned()
    }

    /// Returns the current checkpoint of every bucket.
    pub async fn checkpoints(&self) -> BTreeMap<String, Location> {
        let inner = self.inner.lock().await;
        inner.checkpoints.clone()
    }

    /// Returns all the writes received so far, in order.
    pub async fn history(&self) -> Vec<(String, Location)> {
        let inner = self.inner.lock().await;
        inner.history.clone()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    async fn load_checkpoints(&self) -> SyncerResult<BTreeMap<String, Location>> {
        let inner = self.inner.lock().await;
        Ok(inner.checkpoints.clone())
    }

    async fn store_checkpoints(&self, updates: Vec<(String, Location)>) -> SyncerResult<()> {
        let mut inner = self.inner.lock().await;

        for (bucket, location) in updates {
            debug!(%bucket, %location, "storing checkpoint");
            inner.history.push((bucket.clone(), location.clone()));
            inner.checkpoints.insert(bucket, location);
        }

        Ok(())
    }
}
