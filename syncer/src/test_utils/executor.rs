use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::error::{ErrorKind, SyncerResult};
use crate::executor::TargetExecutor;
use crate::executor::memory::MemoryExecutor;
use crate::job::DmlPayload;
use crate::syncer_error;

/// [`TargetExecutor`] wrapping a [`MemoryExecutor`] with controllable failures.
///
/// Injected failures are consumed in order by the next batches. While the gate is closed every
/// batch waits, which stalls the queues at will.
#[derive(Debug, Clone)]
pub struct TestExecutor {
    inner: MemoryExecutor,
    faults: Arc<Mutex<VecDeque<ErrorKind>>>,
    dml_attempts: Arc<AtomicU64>,
    gate: Arc<watch::Sender<bool>>,
}

impl TestExecutor {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);

        Self {
            inner: MemoryExecutor::new(),
            faults: Arc::new(Mutex::new(VecDeque::new())),
            dml_attempts: Arc::new(AtomicU64::new(0)),
            gate: Arc::new(gate),
        }
    }

    pub fn inner(&self) -> &MemoryExecutor {
        &self.inner
    }

    /// Makes the next `times` batches fail with `kind`.
    pub fn fail_next(&self, kind: ErrorKind, times: usize) {
        let mut faults = self.faults.lock().unwrap();
        faults.extend(std::iter::repeat_n(kind, times));
    }

    /// Number of times a batch was submitted, failed attempts included.
    pub fn dml_attempts(&self) -> u64 {
        self.dml_attempts.load(Ordering::SeqCst)
    }

    pub fn close_gate(&self) {
        self.gate.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }
}

impl Default for TestExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetExecutor for TestExecutor {
    fn name() -> &'static str {
        "test"
    }

    async fn shutdown(&self) -> SyncerResult<()> {
        self.inner.shutdown().await
    }

    async fn execute_dml(&self, queue: usize, batch: Vec<DmlPayload>) -> SyncerResult<()> {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        self.dml_attempts.fetch_add(1, Ordering::SeqCst);

        let fault = self.faults.lock().unwrap().pop_front();
        if let Some(kind) = fault {
            return Err(syncer_error!(kind, "Injected target failure"));
        }

        self.inner.execute_dml(queue, batch).await
    }

    async fn execute_ddl(&self, statements: Vec<String>) -> SyncerResult<()> {
        self.inner.execute_ddl(statements).await
    }
}
