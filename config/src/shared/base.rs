use thiserror::Error;

/// Errors returned by `validate` methods of configuration types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The number of worker queues cannot be zero.
    #[error("`worker_count` cannot be zero")]
    WorkerCountZero,
    /// Worker queues need room for at least one job.
    #[error("`queue_capacity` cannot be zero")]
    QueueCapacityZero,
    /// Retries need at least one attempt.
    #[error("`retry.max_attempts` cannot be zero")]
    RetryMaxAttemptsZero,
    /// A field has a value outside of its allowed range.
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
}
