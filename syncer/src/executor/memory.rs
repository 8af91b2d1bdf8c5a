use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::bail;
use crate::error::{ErrorKind, SyncerResult};
use crate::executor::TargetExecutor;
use crate::job::{DmlOp, DmlPayload};
use crate::types::Value;

/// Rows of one table keyed by the rendering of their key columns.
type TableRows = BTreeMap<String, Vec<Value>>;

/// A batch as received by [`MemoryExecutor::execute_dml`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedBatch {
    pub queue: usize,
    pub dmls: Vec<DmlPayload>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, TableRows>,
    batches: Vec<ExecutedBatch>,
    ddls: Vec<String>,
}

/// In-memory target for testing and development purposes.
///
/// Tables are keyed by target table identity and rows by their key columns, which is enough to
/// reproduce duplicate key failures of a real database and to check that safe mode makes
/// replays idempotent. Every executed batch and statement is recorded so that tests can inspect
/// the order in which they were applied.
#[derive(Debug, Clone, Default)]
pub struct MemoryExecutor {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the rows of `target_table_id`, ordered by key.
    pub async fn table_rows(&self, target_table_id: &str) -> Vec<Vec<Value>> {
        let inner = self.inner.lock().await;
        inner
            .tables
            .get(target_table_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns every batch applied so far, in application order.
    pub async fn batches(&self) -> Vec<ExecutedBatch> {
        let inner = self.inner.lock().await;
        inner.batches.clone()
    }

    /// Returns the row changes applied to `target_table_id`, in application order.
    pub async fn applied_dmls(&self, target_table_id: &str) -> Vec<DmlPayload> {
        let inner = self.inner.lock().await;
        inner
            .batches
            .iter()
            .flat_map(|batch| batch.dmls.iter())
            .filter(|dml| dml.target_table_id() == target_table_id)
            .cloned()
            .collect()
    }

    /// Returns every DDL statement executed so far, in order.
    pub async fn ddls(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.ddls.clone()
    }
}

fn render_key(key: &[Value]) -> String {
    format!("{key:?}")
}

fn apply_dml(tables: &mut HashMap<String, TableRows>, dml: &DmlPayload) -> SyncerResult<()> {
    let rows = tables.entry(dml.target_table_id().to_owned()).or_default();
    let key = render_key(&dml.key_values());

    match dml.op() {
        DmlOp::Insert => {
            if !dml.safe_mode() && rows.contains_key(&key) {
                bail!(
                    ErrorKind::TargetApplyFailed,
                    "Duplicate entry for key",
                    format!("table {}, key {key}", dml.target_table_id())
                );
            }
            rows.insert(key, dml.values().to_vec());
        }
        DmlOp::Update => {
            let new_key = render_key(&dml.new_key_values().unwrap_or_default());
            if !dml.safe_mode() && new_key != key && rows.contains_key(&new_key) {
                bail!(
                    ErrorKind::TargetApplyFailed,
                    "Duplicate entry for key",
                    format!("table {}, key {new_key}", dml.target_table_id())
                );
            }
            rows.remove(&key);
            rows.insert(new_key, dml.values().to_vec());
        }
        DmlOp::Delete => {
            rows.remove(&key);
        }
    }

    Ok(())
}

impl TargetExecutor for MemoryExecutor {
    fn name() -> &'static str {
        "memory"
    }

    async fn shutdown(&self) -> SyncerResult<()> {
        info!("shutting down memory executor");
        Ok(())
    }

    async fn execute_dml(&self, queue: usize, batch: Vec<DmlPayload>) -> SyncerResult<()> {
        let mut inner = self.inner.lock().await;

        // Apply on a copy so that a failing change leaves the tables untouched.
        let mut tables = inner.tables.clone();
        for dml in &batch {
            apply_dml(&mut tables, dml)?;
        }

        debug!(queue, rows = batch.len(), "applied batch");
        inner.tables = tables;
        inner.batches.push(ExecutedBatch { queue, dmls: batch });

        Ok(())
    }

    async fn execute_ddl(&self, statements: Vec<String>) -> SyncerResult<()> {
        let mut inner = self.inner.lock().await;

        for statement in statements {
            info!(%statement, "executing ddl");
            inner.ddls.push(statement);
        }

        Ok(())
    }
}
