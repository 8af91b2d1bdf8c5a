use serde::{Deserialize, Serialize};

use crate::Config;
use crate::shared::{BatchConfig, RetryConfig, ValidationError};

/// What the sharding DDL barrier does with a report from a source table it does not expect.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnexpectedShardPolicy {
    /// Fail the pipeline.
    #[default]
    Reject,
    /// Log the report and drop the job.
    Ignore,
}

/// Configuration of a syncer pipeline.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SyncerConfig {
    /// Identifier of the pipeline, used in logs.
    pub id: u64,
    /// Number of worker queues applying DML in parallel.
    ///
    /// Changing this value changes the table to queue assignment, so it must only be changed
    /// after a clean shutdown.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Capacity of every worker queue, the producer blocks when a queue is full.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Batching limits of the worker queues.
    #[serde(default)]
    pub batch: BatchConfig,
    /// Backoff for transient failures.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Hard limit, in milliseconds, for draining the queues on shutdown.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Forces idempotent DML rewriting for every change, not only during replay after a restart.
    #[serde(default)]
    pub safe_mode: bool,
    /// Handling of sharding DDL reported by unexpected source tables.
    #[serde(default)]
    pub unexpected_shard_policy: UnexpectedShardPolicy,
}

impl SyncerConfig {
    pub const DEFAULT_WORKER_COUNT: usize = 8;
    pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
    pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 30_000;

    /// Creates a configuration with defaults for everything but the id.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            safe_mode: false,
            unexpected_shard_policy: UnexpectedShardPolicy::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.worker_count == 0 {
            return Err(ValidationError::WorkerCountZero);
        }

        if self.queue_capacity == 0 {
            return Err(ValidationError::QueueCapacityZero);
        }

        self.batch.validate()?;
        self.retry.validate()?;

        Ok(())
    }
}

impl Config for SyncerConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}

fn default_worker_count() -> usize {
    SyncerConfig::DEFAULT_WORKER_COUNT
}

fn default_queue_capacity() -> usize {
    SyncerConfig::DEFAULT_QUEUE_CAPACITY
}

fn default_shutdown_timeout_ms() -> u64 {
    SyncerConfig::DEFAULT_SHUTDOWN_TIMEOUT_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: SyncerConfig = serde_json::from_str(r#"{"id": 7}"#).unwrap();

        assert_eq!(config, SyncerConfig::new(7));
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.unexpected_shard_policy, UnexpectedShardPolicy::Reject);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_unexpected_shard_policy() {
        let config: SyncerConfig =
            serde_json::from_str(r#"{"id": 1, "unexpected_shard_policy": "ignore"}"#).unwrap();

        assert_eq!(config.unexpected_shard_policy, UnexpectedShardPolicy::Ignore);
    }

    #[test]
    fn rejects_zero_workers() {
        let config = SyncerConfig {
            worker_count: 0,
            ..SyncerConfig::new(1)
        };

        assert_eq!(config.validate(), Err(ValidationError::WorkerCountZero));
    }
}
