//! Assignment of jobs to worker queues.
//!
//! DML jobs are routed by a CRC32 checksum of their target table identity, so every change of a
//! table lands on the same queue and is applied in order. Barrier jobs go to every queue.

use config::shared::SyncerConfig;

use crate::job::Job;

/// Default number of worker queues.
pub const DEFAULT_WORKER_COUNT: usize = SyncerConfig::DEFAULT_WORKER_COUNT;

/// Destination of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// The job goes to the queue with this index.
    Queue(usize),
    /// The job goes to every queue.
    Broadcast,
}

/// Name of the checkpoint bucket of queue `index` among `worker_count` queues.
///
/// Indexes are reduced modulo `worker_count`, so `index` and `index + worker_count` share a
/// bucket.
pub fn queue_bucket_name(index: usize, worker_count: usize) -> String {
    format!("q_{}", index % worker_count.max(1))
}

/// Routes jobs over a fixed number of queues.
#[derive(Debug, Clone, Copy)]
pub struct QueueRouter {
    worker_count: usize,
}

impl QueueRouter {
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count: worker_count.max(1),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Returns where `job` must be sent.
    pub fn route(&self, job: &Job) -> Route {
        match job.dml() {
            Some(dml) => Route::Queue(self.queue_index(dml.target_table_id())),
            None => Route::Broadcast,
        }
    }

    /// Queue index for a target table identity.
    ///
    /// Depends only on the identity and the number of queues, so it is stable across restarts.
    pub fn queue_index(&self, target_table_id: &str) -> usize {
        crc32fast::hash(target_table_id.as_bytes()) as usize % self.worker_count
    }

    /// Checkpoint bucket name of the queue `index`.
    pub fn bucket_name(&self, index: usize) -> String {
        debug_assert!(
            index < self.worker_count,
            "queue index {index} is out of range for {} queues",
            self.worker_count
        );

        queue_bucket_name(index, self.worker_count)
    }

    /// Checkpoint bucket names of all queues, in queue order.
    pub fn bucket_names(&self) -> Vec<String> {
        (0..self.worker_count)
            .map(|index| self.bucket_name(index))
            .collect()
    }
}

impl Default for QueueRouter {
    fn default() -> Self {
        Self::new(DEFAULT_WORKER_COUNT)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::job::{DmlOp, DmlPayload};
    use crate::location::{EventContext, Location};
    use crate::types::{ColumnSchema, TableName, TableSchema, Value};

    fn dml_job(target: &TableName) -> Job {
        let schema = Arc::new(TableSchema::new(
            target.clone(),
            vec![ColumnSchema::new("id", "int", false).primary()],
        ));
        let dml = DmlPayload::new(
            DmlOp::Insert,
            false,
            target.quoted(),
            target.clone(),
            vec![],
            vec![Value::Int(1)],
            schema,
        )
        .unwrap();

        Job::new_dml(dml, &EventContext::at(Location::new("")))
    }

    #[test]
    fn bucket_names_wrap_around_worker_count() {
        assert_eq!(queue_bucket_name(0, DEFAULT_WORKER_COUNT), "q_0");
        assert_eq!(queue_bucket_name(8, DEFAULT_WORKER_COUNT), "q_0");
        assert_eq!(queue_bucket_name(9, DEFAULT_WORKER_COUNT), "q_1");
    }

    #[test]
    fn lists_bucket_names_in_queue_order() {
        let router = QueueRouter::new(3);

        assert_eq!(router.bucket_names(), vec!["q_0", "q_1", "q_2"]);
    }

    #[test]
    fn routing_is_deterministic() {
        let router = QueueRouter::default();
        let other_router = QueueRouter::default();
        let table = TableName::new("shop", "orders");

        let first = router.route(&dml_job(&table));
        for _ in 0..16 {
            assert_eq!(router.route(&dml_job(&table)), first);
            assert_eq!(other_router.route(&dml_job(&table)), first);
        }
    }

    #[test]
    fn routing_uses_crc32_of_target_identity() {
        let router = QueueRouter::new(8);
        let identity = "`shop`.`orders`";

        let expected = crc32fast::hash(identity.as_bytes()) as usize % 8;
        assert_eq!(router.queue_index(identity), expected);
    }

    #[test]
    fn barrier_jobs_are_broadcast() {
        let router = QueueRouter::default();
        let location = Location::new("mysql-bin.000001");

        assert_eq!(router.route(&Job::new_flush()), Route::Broadcast);
        assert_eq!(
            router.route(&Job::new_xid(
                location.clone(),
                location.clone(),
                location.clone()
            )),
            Route::Broadcast
        );
        assert_eq!(router.route(&Job::new_rotate(location)), Route::Broadcast);
    }

    #[test]
    fn tables_spread_over_queues() {
        let router = QueueRouter::new(4);

        let mut used = std::collections::HashSet::new();
        for index in 0..64 {
            used.insert(router.queue_index(&TableName::new("db", format!("t{index}")).quoted()));
        }

        assert!(used.len() > 1);
        assert!(used.iter().all(|index| *index < 4));
    }
}
