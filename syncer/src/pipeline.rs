//! Coordinator of the worker queues.
//!
//! The [`Pipeline`] receives jobs from the single producer and routes them: row changes go to the
//! queue of their target table, every other job is a barrier broadcast to all queues. Once every
//! queue acknowledged a barrier the checkpoint advances. DDL drains the queues before it runs,
//! and DDL of sharded tables goes through the [`ShardingDdlBarrier`] first.

use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use config::shared::SyncerConfig;
use futures::future;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, warn};

use crate::bail;
use crate::builder::{JobBuilder, TableRouter};
use crate::checkpoint::ResumePlan;
use crate::concurrency::countdown::Countdown;
use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::error::{ErrorKind, SyncerResult};
use crate::executor::TargetExecutor;
#[cfg(feature = "failpoints")]
use crate::failpoints::{EXECUTE_DDL__BEFORE_APPLY, syncer_fail_point};
use crate::job::{Job, OpType};
use crate::location::Location;
use crate::router::{QueueRouter, Route};
use crate::sharding::{RecordOutcome, ShardingDdlBarrier, ShardingGroupState};
use crate::source::EventSource;
use crate::store::CheckpointStore;
use crate::syncer_error;
use crate::types::{PipelineId, TableName};
use crate::workers::policy::retry_with_backoff;
use crate::workers::queue::{QueueMessage, QueueWorker, QueueWorkerHandle};

#[derive(Debug)]
enum PipelineState {
    NotStarted,
    Started {
        senders: Vec<mpsc::Sender<QueueMessage>>,
        workers: Vec<QueueWorkerHandle>,
    },
}

#[derive(Debug)]
pub struct Pipeline<E, C> {
    id: PipelineId,
    config: Arc<SyncerConfig>,
    executor: E,
    store: C,
    router: QueueRouter,
    sharding: ShardingDdlBarrier,
    /// Jobs of source tables blocked by a collecting sharding group, in arrival order.
    held: Vec<Job>,
    /// Jobs released from `held`, dispatched before the next incoming job.
    pending: VecDeque<Job>,
    /// Checkpoint of every queue bucket, indexed by queue.
    bucket_checkpoints: Vec<Location>,
    /// Smallest bucket checkpoint, where reading would restart from.
    checkpoint: Location,
    state: PipelineState,
    shutdown_tx: ShutdownTx,
}

impl<E, C> Pipeline<E, C>
where
    E: TargetExecutor + Clone + Send + Sync + 'static,
    C: CheckpointStore + Clone + Send + Sync + 'static,
{
    pub fn new(config: SyncerConfig, executor: E, store: C) -> Self {
        let (shutdown_tx, _) = create_shutdown_channel();
        let router = QueueRouter::new(config.worker_count);
        let sharding = ShardingDdlBarrier::new(config.unexpected_shard_policy);

        Self {
            id: config.id,
            config: Arc::new(config),
            executor,
            store,
            router,
            sharding,
            held: Vec::new(),
            pending: VecDeque::new(),
            bucket_checkpoints: Vec::new(),
            checkpoint: Location::zero(),
            state: PipelineState::NotStarted,
            shutdown_tx,
        }
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn router(&self) -> &QueueRouter {
        &self.router
    }

    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Location reading would restart from if the process stopped now.
    pub fn checkpoint(&self) -> &Location {
        &self.checkpoint
    }

    /// Checkpoint of every bucket, keyed by bucket name.
    pub fn bucket_checkpoints(&self) -> BTreeMap<String, Location> {
        self.bucket_checkpoints
            .iter()
            .enumerate()
            .map(|(index, location)| (self.router.bucket_name(index), location.clone()))
            .collect()
    }

    /// State of the sharding group of `target`, if one is pending.
    pub fn sharding_state(&self, target: &TableName) -> Option<ShardingGroupState> {
        self.sharding.state(target)
    }

    /// Number of jobs held back by sharding groups still collecting.
    pub fn held_jobs(&self) -> usize {
        self.held.len()
    }

    /// Loads the checkpoints, spawns the queue workers and returns where reading must resume.
    ///
    /// `initial` is used when no checkpoint was ever persisted.
    pub async fn start(&mut self, initial: Location) -> SyncerResult<ResumePlan> {
        if matches!(self.state, PipelineState::Started { .. }) {
            bail!(ErrorKind::InvalidState, "Pipeline was already started");
        }

        self.config.validate()?;

        info!(
            pipeline_id = self.id,
            worker_count = self.router.worker_count(),
            executor = E::name(),
            "starting pipeline"
        );

        let store = &self.store;
        let checkpoints = retry_with_backoff(&self.config.retry, "load_checkpoints", || {
            store.load_checkpoints()
        })
        .await?;
        let plan = ResumePlan::from_checkpoints(&checkpoints, initial)?;

        let worker_count = self.router.worker_count();
        let mut senders = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        self.bucket_checkpoints = Vec::with_capacity(worker_count);

        for index in 0..worker_count {
            let bucket = self.router.bucket_name(index);
            self.bucket_checkpoints.push(
                checkpoints
                    .get(&bucket)
                    .cloned()
                    .unwrap_or_else(|| plan.start().clone()),
            );

            let (tx, rx) = mpsc::channel(self.config.queue_capacity);
            let worker = QueueWorker::new(
                index,
                bucket,
                self.config.clone(),
                self.executor.clone(),
                self.store.clone(),
                rx,
            )
            .spawn();

            senders.push(tx);
            workers.push(worker);
        }

        self.checkpoint = plan.start().clone();
        self.state = PipelineState::Started { senders, workers };

        Ok(plan)
    }

    /// Reads `source` through `builder` and dispatches every job until the stream ends or
    /// shutdown is requested, then flushes the queues.
    pub async fn run<S, R>(
        &mut self,
        source: &mut S,
        builder: &mut JobBuilder<R>,
    ) -> SyncerResult<()>
    where
        S: EventSource,
        R: TableRouter,
    {
        let span = tracing::info_span!("pipeline", pipeline_id = self.id);
        self.run_loop(source, builder).instrument(span).await
    }

    async fn run_loop<S, R>(
        &mut self,
        source: &mut S,
        builder: &mut JobBuilder<R>,
    ) -> SyncerResult<()>
    where
        S: EventSource,
        R: TableRouter,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            let event = tokio::select! {
                biased;

                _ = shutdown_rx.wait() => {
                    info!("shutdown requested, stopping to read events");
                    break;
                }

                event = source.next_event() => event?,
            };

            let Some(event) = event else {
                info!("source stream ended");
                break;
            };

            for job in builder.build(event)? {
                self.dispatch(job).await?;
            }
        }

        self.flush().await
    }

    /// Dispatches one job, and any job its handling released.
    pub async fn dispatch(&mut self, job: Job) -> SyncerResult<()> {
        self.pending.push_back(job);

        while let Some(job) = self.pending.pop_front() {
            self.dispatch_one(job).await?;
        }

        Ok(())
    }

    /// Forces every queue to write its pending batch, without advancing the checkpoint.
    pub async fn flush(&mut self) -> SyncerResult<()> {
        self.barrier(Job::new_flush(), None).await
    }

    async fn dispatch_one(&mut self, job: Job) -> SyncerResult<()> {
        match job.op_type() {
            OpType::Insert | OpType::Update | OpType::Delete => self.dispatch_dml(job).await,
            OpType::Ddl => self.dispatch_ddl(job).await,
            OpType::Xid | OpType::Rotate => {
                let target = job.current_location().clone();
                self.barrier(job, Some(target)).await
            }
            OpType::Skip => {
                let target = job.last_location().clone();
                self.barrier(job, Some(target)).await
            }
            OpType::Flush => self.barrier(job, None).await,
            OpType::Null => bail!(
                ErrorKind::InvalidState,
                "Jobs without a kind cannot be dispatched"
            ),
        }
    }

    async fn dispatch_dml(&mut self, job: Job) -> SyncerResult<()> {
        if let Some(source) = job.source_table()
            && self.sharding.holds(source)
        {
            debug!(%source, "holding row change until the sharding ddl is resolved");
            self.held.push(job);

            return Ok(());
        }

        let Route::Queue(index) = self.router.route(&job) else {
            bail!(
                ErrorKind::InvalidState,
                "Row change was not routed to a single queue",
                job.to_string()
            );
        };

        let senders = self.senders()?;
        if senders[index].send(QueueMessage::Dml(job)).await.is_err() {
            bail!(
                ErrorKind::QueueClosed,
                "Worker queue is closed",
                format!("queue {index} stopped, its worker most likely failed")
            );
        }

        Ok(())
    }

    async fn dispatch_ddl(&mut self, job: Job) -> SyncerResult<()> {
        let sharded = job
            .ddl()
            .is_some_and(|ddl| ddl.sharding_ddl_info.is_some());

        if !sharded {
            if let Some(source) = job.source_table()
                && self.sharding.holds(source)
            {
                self.held.push(job);
                return Ok(());
            }

            return self.execute_ddl(job).await;
        }

        match self.sharding.record(&job)? {
            RecordOutcome::Waiting { target, remaining } => {
                info!(%target, remaining, "waiting for the remaining shards to report their ddl");
                Ok(())
            }
            RecordOutcome::Ready { target } => self.execute_sharding_ddl(&target).await,
            RecordOutcome::Duplicate | RecordOutcome::Ignored => Ok(()),
            RecordOutcome::Blocked => {
                self.held.push(job);
                Ok(())
            }
        }
    }

    async fn execute_ddl(&mut self, job: Job) -> SyncerResult<()> {
        self.barrier(job.clone(), None).await?;
        self.run_ddl(job.ddls().to_vec()).await?;

        let target = job.current_location().clone();
        self.barrier(job, Some(target)).await
    }

    async fn execute_sharding_ddl(&mut self, target: &TableName) -> SyncerResult<()> {
        let report = self.sharding.begin_execution(target)?;
        info!(%target, location = %report.current_location(), "executing sharding ddl");

        self.barrier(report.clone(), None).await?;
        self.run_ddl(report.ddls().to_vec()).await?;

        self.sharding.resume(target)?;
        self.release_held();
        self.sharding.finish(target)?;

        let location = report.current_location().clone();
        self.barrier(report, Some(location)).await
    }

    /// Moves held jobs whose source table is no longer blocked in front of the pending jobs.
    fn release_held(&mut self) {
        let (released, kept): (Vec<Job>, Vec<Job>) =
            std::mem::take(&mut self.held).into_iter().partition(|job| {
                !job.source_table()
                    .is_some_and(|source| self.sharding.holds(source))
            });

        if !released.is_empty() {
            info!(released = released.len(), held = kept.len(), "releasing held jobs");
        }

        self.held = kept;
        for job in released.into_iter().rev() {
            self.pending.push_front(job);
        }
    }

    async fn run_ddl(&self, statements: Vec<String>) -> SyncerResult<()> {
        if statements.is_empty() {
            return Ok(());
        }

        let executor = &self.executor;
        retry_with_backoff(&self.config.retry, "execute_ddl", || {
            let statements = statements.clone();
            async move {
                #[cfg(feature = "failpoints")]
                syncer_fail_point(EXECUTE_DDL__BEFORE_APPLY)?;

                executor.execute_ddl(statements).await
            }
        })
        .await
    }

    /// Broadcasts `job` and waits until every queue acknowledged it.
    ///
    /// With a `target` location the queues persist their bucket, each capped by the work still
    /// unresolved for it, and the checkpoint advances once all of them succeeded.
    async fn barrier(&mut self, job: Job, target: Option<Location>) -> SyncerResult<()> {
        let worker_count = self.router.worker_count();
        let checkpoints = match &target {
            Some(target) => self.next_checkpoints(target)?,
            None => vec![None; worker_count],
        };

        let (countdown, acks) = Countdown::new(worker_count, job.current_location().clone());
        let senders = self.senders()?;
        for ((index, sender), (ack, checkpoint)) in senders
            .iter()
            .enumerate()
            .zip(acks.into_iter().zip(checkpoints.iter().cloned()))
        {
            let message = QueueMessage::Barrier {
                job: job.clone(),
                checkpoint,
                ack,
            };

            // The undelivered acknowledgement is dropped with the message and counts as failed.
            if sender.send(message).await.is_err() {
                warn!(
                    queue = index,
                    tp = %job.op_type(),
                    "queue closed before the barrier reached it"
                );
            }
        }

        debug!(
            tp = %job.op_type(),
            pending = countdown.remaining(),
            "waiting for the queues to acknowledge the barrier"
        );
        countdown.wait().await?;

        let mut advanced = false;
        for (bucket, checkpoint) in self.bucket_checkpoints.iter_mut().zip(checkpoints) {
            if let Some(checkpoint) = checkpoint {
                *bucket = checkpoint;
                advanced = true;
            }
        }

        if advanced {
            self.checkpoint = min_location(&self.bucket_checkpoints)?;
            debug!(tp = %job.op_type(), checkpoint = %self.checkpoint, "checkpoint advanced");
        }

        Ok(())
    }

    /// Computes the checkpoint every bucket can move to for a barrier at `target`.
    ///
    /// A bucket is capped by the first report of pending sharding groups of its tables and by the
    /// held or pending jobs routed to it. `None` means the bucket does not move.
    fn next_checkpoints(&self, target: &Location) -> SyncerResult<Vec<Option<Location>>> {
        let worker_count = self.router.worker_count();

        let mut floors: Vec<(Option<usize>, &Location)> = self
            .sharding
            .pending_groups()
            .map(|(table, location)| (Some(self.router.queue_index(&table.quoted())), location))
            .collect();
        for job in self.held.iter().chain(self.pending.iter()) {
            floors.push((self.job_queue(job), job.start_location()));
        }

        let mut checkpoints = vec![target.clone(); worker_count];
        for (queue, floor) in floors {
            let queues = match queue {
                Some(index) => index..index + 1,
                None => 0..worker_count,
            };

            for index in queues {
                if floor.compare(&checkpoints[index])? == Ordering::Less {
                    checkpoints[index] = floor.clone();
                }
            }
        }

        checkpoints
            .into_iter()
            .zip(&self.bucket_checkpoints)
            .map(|(checkpoint, current)| {
                Ok((checkpoint.compare(current)? == Ordering::Greater).then_some(checkpoint))
            })
            .collect()
    }

    /// Queue a job belongs to, `None` when it concerns every queue.
    fn job_queue(&self, job: &Job) -> Option<usize> {
        match self.router.route(job) {
            Route::Queue(index) => Some(index),
            Route::Broadcast => job
                .ddl()
                .and_then(|ddl| ddl.target_table.as_ref())
                .map(|target| self.router.queue_index(&target.quoted())),
        }
    }

    fn senders(&self) -> SyncerResult<&[mpsc::Sender<QueueMessage>]> {
        match &self.state {
            PipelineState::Started { senders, .. } => Ok(senders),
            PipelineState::NotStarted => bail!(ErrorKind::InvalidState, "Pipeline was not started"),
        }
    }

    /// Requests the producer loop started by [`Pipeline::run`] to stop.
    pub fn shutdown(&self) {
        info!("trying to shut down the pipeline");
        self.shutdown_tx.shutdown();
    }

    /// Flushes every queue, stops the workers and waits for them, bounded by the configured
    /// shutdown timeout.
    ///
    /// When the timeout expires the workers are aborted and awaited before returning, so no
    /// batch reaches the target once [`ErrorKind::ShutdownTimeout`] is reported.
    pub async fn shutdown_and_wait(mut self) -> SyncerResult<()> {
        self.shutdown();

        let PipelineState::Started { workers, .. } = &mut self.state else {
            info!("pipeline was not started, nothing to wait for");
            return Ok(());
        };
        // The handles live outside of the timed drain, dropping them would detach the tasks.
        let mut workers = std::mem::take(workers);

        let timeout = Duration::from_millis(self.config.shutdown_timeout_ms);
        match tokio::time::timeout(timeout, self.drain_and_stop(&mut workers)).await {
            Ok(result) => result,
            Err(_) => {
                self.state = PipelineState::NotStarted;
                abort_workers(&mut workers).await;

                Err(syncer_error!(
                    ErrorKind::ShutdownTimeout,
                    "Queues were not drained in time",
                    format!("shutdown did not complete within {timeout:?}, queue workers aborted")
                ))
            }
        }
    }

    async fn drain_and_stop(&mut self, workers: &mut [QueueWorkerHandle]) -> SyncerResult<()> {
        let mut errors = Vec::new();

        if let Err(err) = self.flush().await {
            errors.push(err);
        }

        if !self.held.is_empty() || !self.sharding.is_empty() {
            warn!(
                held = self.held.len(),
                checkpoint = %self.checkpoint,
                "stopping with unresolved sharding ddl, held changes are replayed after restart"
            );
        }

        // Dropping the senders closes the queues, the workers exit once they processed everything.
        self.state = PipelineState::NotStarted;

        info!("waiting for queue workers to complete");
        let results = future::join_all(workers.iter_mut().map(|worker| async move {
            let index = worker.index();
            (index, worker.wait().await)
        }))
        .await;

        for (index, result) in results {
            if let Err(err) = result {
                warn!(queue = index, error = %err, "queue worker completed with an error");
                errors.push(err);
            }
        }

        if let Err(err) = self.executor.shutdown().await {
            errors.push(err);
        }

        if !errors.is_empty() {
            return Err(errors.into());
        }

        let applied_rows: u64 = workers.iter().map(|worker| worker.state().applied_rows).sum();
        info!(applied_rows, checkpoint = %self.checkpoint, "pipeline stopped");

        Ok(())
    }
}

/// Aborts the workers still running and waits until every task is gone.
async fn abort_workers(workers: &mut [QueueWorkerHandle]) {
    for worker in workers.iter().filter(|worker| !worker.is_finished()) {
        let state = worker.state();
        warn!(
            queue = worker.index(),
            applied_location = %state.applied_location,
            "aborting queue worker that did not stop in time"
        );
        worker.abort();
    }

    for worker in workers.iter_mut() {
        if let Err(err) = worker.wait().await {
            debug!(queue = worker.index(), error = %err, "aborted queue worker stopped");
        }
    }
}

fn min_location(locations: &[Location]) -> SyncerResult<Location> {
    let mut locations = locations.iter();
    let Some(mut min) = locations.next() else {
        return Ok(Location::zero());
    };

    for location in locations {
        if location.compare(min)? == Ordering::Less {
            min = location;
        }
    }

    Ok(min.clone())
}
