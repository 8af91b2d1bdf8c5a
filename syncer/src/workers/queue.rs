//! Worker queues applying row changes to the target.
//!
//! Every queue is a bounded channel consumed by one [`QueueWorker`] task. Row changes are buffered
//! and written in batches, either when the batch is full or when its fill deadline expires.
//! Barrier jobs flush the pending batch, optionally persist the queue's checkpoint bucket, and are
//! then acknowledged to the coordinator.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use config::shared::SyncerConfig;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info};

use crate::bail;
use crate::concurrency::countdown::Ack;
use crate::concurrency::timer::BatchDeadline;
use crate::error::{ErrorKind, SyncerResult};
#[cfg(feature = "failpoints")]
use crate::failpoints::{
    EXECUTE_DML__BEFORE_APPLY, STORE_CHECKPOINT__BEFORE_STORE, syncer_fail_point,
};
use crate::executor::TargetExecutor;
use crate::job::{DmlPayload, Job};
use crate::location::Location;
use crate::store::CheckpointStore;
use crate::syncer_error;
use crate::types::TableName;
use crate::workers::policy::retry_with_backoff;

/// Message sent by the coordinator to a queue.
#[derive(Debug)]
pub enum QueueMessage {
    /// A DML job routed to this queue.
    Dml(Job),
    /// A job broadcast to every queue.
    ///
    /// The worker flushes its pending batch, persists `checkpoint` into its bucket when present,
    /// and completes `ack` with the outcome.
    Barrier {
        job: Job,
        checkpoint: Option<Location>,
        ack: Ack,
    },
}

/// Progress of a queue worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueWorkerState {
    /// Number of row changes written to the target.
    pub applied_rows: u64,
    /// Number of batches written to the target.
    pub applied_batches: u64,
    /// Location of the last job applied or acknowledged.
    pub applied_location: Location,
    /// Last checkpoint persisted into the queue's bucket.
    pub checkpoint: Option<Location>,
}

/// Handle for monitoring a running [`QueueWorker`].
#[derive(Debug)]
pub struct QueueWorkerHandle {
    index: usize,
    state: watch::Receiver<QueueWorkerState>,
    handle: Option<JoinHandle<SyncerResult<()>>>,
}

impl QueueWorkerHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns a snapshot of the worker's progress.
    pub fn state(&self) -> QueueWorkerState {
        self.state.borrow().clone()
    }

    /// Returns whether the worker task already stopped.
    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .is_none_or(|handle| handle.is_finished())
    }

    /// Cancels the worker task at its next await point.
    ///
    /// The batch it was applying, if any, is abandoned. [`QueueWorkerHandle::wait`] must still be
    /// called to make sure the task is gone.
    pub fn abort(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }

    /// Waits for the worker task to complete.
    ///
    /// The task handle is kept until the task completed, so dropping this future leaves the
    /// worker abortable.
    pub async fn wait(&mut self) -> SyncerResult<()> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(());
        };

        let result = handle.await;
        self.handle = None;

        result.map_err(|err| {
            if err.is_cancelled() {
                syncer_error!(ErrorKind::QueueClosed, "Queue worker was cancelled", err)
            } else {
                syncer_error!(ErrorKind::WorkerPanic, "Queue worker panicked", err)
            }
        })??;

        Ok(())
    }
}

#[derive(Debug)]
pub struct QueueWorker<E, C> {
    index: usize,
    bucket: String,
    config: Arc<SyncerConfig>,
    executor: E,
    store: C,
    rx: mpsc::Receiver<QueueMessage>,
}

impl<E, C> QueueWorker<E, C>
where
    E: TargetExecutor + Send + Sync + 'static,
    C: CheckpointStore + Send + Sync + 'static,
{
    pub fn new(
        index: usize,
        bucket: String,
        config: Arc<SyncerConfig>,
        executor: E,
        store: C,
        rx: mpsc::Receiver<QueueMessage>,
    ) -> Self {
        Self {
            index,
            bucket,
            config,
            executor,
            store,
            rx,
        }
    }

    /// Spawns the worker on the runtime and returns a handle for monitoring.
    pub fn spawn(self) -> QueueWorkerHandle {
        let index = self.index;
        let (state_tx, state_rx) = watch::channel(QueueWorkerState::default());

        let span = tracing::info_span!(
            "queue_worker",
            pipeline_id = self.config.id,
            queue = index,
            bucket = %self.bucket
        );
        let handle = tokio::spawn(
            QueueLoop {
                worker: self,
                state: state_tx,
                watermarks: HashMap::new(),
            }
            .run()
            .instrument(span),
        );

        QueueWorkerHandle {
            index,
            state: state_rx,
            handle: Some(handle),
        }
    }
}

struct QueueLoop<E, C> {
    worker: QueueWorker<E, C>,
    state: watch::Sender<QueueWorkerState>,
    /// Location of the last job seen per source table, changes of a table must never go back.
    watermarks: HashMap<TableName, Location>,
}

impl<E, C> QueueLoop<E, C>
where
    E: TargetExecutor + Send + Sync + 'static,
    C: CheckpointStore + Send + Sync + 'static,
{
    async fn run(mut self) -> SyncerResult<()> {
        info!("starting queue worker");

        let max_size = self.worker.config.batch.max_size.max(1);
        let mut batch: Vec<Job> = Vec::with_capacity(max_size);
        let mut deadline =
            BatchDeadline::new(Duration::from_millis(self.worker.config.batch.max_fill_ms));

        loop {
            tokio::select! {
                biased;

                message = self.worker.rx.recv() => {
                    let Some(message) = message else {
                        // The coordinator dropped the queue, write what is left and stop.
                        self.flush(&mut batch).await?;
                        info!("queue closed, stopping queue worker");

                        return Ok(());
                    };

                    match message {
                        QueueMessage::Dml(job) => {
                            self.check_order(&job)?;

                            batch.push(job);
                            deadline.arm();

                            if batch.len() >= max_size {
                                deadline.disarm();
                                self.flush(&mut batch).await?;
                            }
                        }
                        QueueMessage::Barrier { job, checkpoint, ack } => {
                            deadline.disarm();

                            let result = self.handle_barrier(&job, checkpoint, &mut batch).await;
                            if let Err(err) = result {
                                ack.complete(Err(err.clone()));
                                return Err(err);
                            }

                            ack.complete(Ok(()));
                        }
                    }
                }

                _ = &mut deadline => {
                    debug!(rows = batch.len(), "batch fill deadline expired");
                    self.flush(&mut batch).await?;
                }
            }
        }
    }

    fn check_order(&mut self, job: &Job) -> SyncerResult<()> {
        let Some(source_table) = job.source_table() else {
            return Ok(());
        };

        let location = job.current_location();
        if let Some(watermark) = self.watermarks.get(source_table)
            && location.compare(watermark)? == Ordering::Less
        {
            bail!(
                ErrorKind::OrderingViolation,
                "Row change arrived behind an already queued change of the same table",
                format!("table {source_table}: `{location}` is behind `{watermark}`")
            );
        }

        self.watermarks.insert(source_table.clone(), location.clone());

        Ok(())
    }

    async fn handle_barrier(
        &mut self,
        job: &Job,
        checkpoint: Option<Location>,
        batch: &mut Vec<Job>,
    ) -> SyncerResult<()> {
        debug!(tp = %job.op_type(), location = %job.current_location(), "processing barrier");

        self.flush(batch).await?;

        if let Some(checkpoint) = checkpoint {
            let bucket = self.worker.bucket.clone();
            let store = &self.worker.store;
            retry_with_backoff(&self.worker.config.retry, "store_checkpoint", || {
                let bucket = bucket.clone();
                let checkpoint = checkpoint.clone();
                async move {
                    #[cfg(feature = "failpoints")]
                    syncer_fail_point(STORE_CHECKPOINT__BEFORE_STORE)?;

                    store.store_checkpoint(bucket, checkpoint).await
                }
            })
            .await?;

            debug!(%checkpoint, "checkpoint persisted");
            self.state.send_modify(|state| state.checkpoint = Some(checkpoint));
        }

        // The zero location of flush jobs says nothing about the stream position.
        if !job.current_location().is_zero() {
            let location = job.current_location().clone();
            self.state.send_modify(|state| state.applied_location = location);
        }

        Ok(())
    }

    async fn flush(&mut self, batch: &mut Vec<Job>) -> SyncerResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let jobs = std::mem::take(batch);
        let dmls: Vec<DmlPayload> = jobs.iter().filter_map(|job| job.dml().cloned()).collect();
        let rows = dmls.len() as u64;

        let index = self.worker.index;
        let executor = &self.worker.executor;
        retry_with_backoff(&self.worker.config.retry, "execute_dml", || {
            let dmls = dmls.clone();
            async move {
                #[cfg(feature = "failpoints")]
                syncer_fail_point(EXECUTE_DML__BEFORE_APPLY)?;

                executor.execute_dml(index, dmls).await
            }
        })
        .await?;

        debug!(rows, "batch applied");

        let location = jobs.last().map(|job| job.current_location().clone());
        self.state.send_modify(|state| {
            state.applied_rows += rows;
            state.applied_batches += 1;
            if let Some(location) = location {
                state.applied_location = location;
            }
        });

        Ok(())
    }
}
