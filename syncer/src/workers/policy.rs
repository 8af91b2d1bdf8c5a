use std::future::Future;

use config::shared::RetryConfig;
use tracing::{error, warn};

use crate::error::{ErrorKind, SyncerError, SyncerResult};

/// Retry behavior for a classified error.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RetryDirective {
    /// The operation is retried with bounded exponential backoff.
    Timed,
    /// The failure is fatal for the owning queue or the pipeline.
    NoRetry,
}

/// Policy describing how a [`SyncerError`] should be handled.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ErrorHandlingPolicy {
    retry_directive: RetryDirective,
    solution: Option<&'static str>,
}

impl ErrorHandlingPolicy {
    const fn new(retry_directive: RetryDirective, solution: Option<&'static str>) -> Self {
        Self {
            retry_directive,
            solution,
        }
    }

    pub fn retry_directive(&self) -> RetryDirective {
        self.retry_directive
    }

    /// Returns an optional operator-facing solution message.
    pub fn solution(&self) -> Option<&'static str> {
        self.solution
    }
}

/// Builds an [`ErrorHandlingPolicy`] from a [`SyncerError`] to decide in a unified way whether
/// it is retried.
pub fn build_error_handling_policy(error: &SyncerError) -> ErrorHandlingPolicy {
    match error.kind() {
        // Keep this list narrow: only failures expected to recover without operator action.
        ErrorKind::TargetConnectionFailed
        | ErrorKind::TargetLockTimeout
        | ErrorKind::CheckpointStoreUnavailable => {
            ErrorHandlingPolicy::new(RetryDirective::Timed, None)
        }

        ErrorKind::ShardingDdlConflict => ErrorHandlingPolicy::new(
            RetryDirective::NoRetry,
            Some("Make the DDL of every shard identical, or resolve the conflict on the target."),
        ),
        ErrorKind::UnexpectedShardingSource => ErrorHandlingPolicy::new(
            RetryDirective::NoRetry,
            Some("Check the table routing rules, or use the `ignore` unexpected shard policy."),
        ),
        ErrorKind::OrderingViolation | ErrorKind::IncompatibleLocations => {
            ErrorHandlingPolicy::new(
                RetryDirective::NoRetry,
                Some("Verify the source stream and the persisted checkpoints belong together."),
            )
        }

        #[cfg(feature = "failpoints")]
        ErrorKind::WithNoRetry => {
            ErrorHandlingPolicy::new(RetryDirective::NoRetry, Some("Cannot retry this error."))
        }
        #[cfg(feature = "failpoints")]
        ErrorKind::WithTimedRetry => ErrorHandlingPolicy::new(
            RetryDirective::Timed,
            Some("Will automatically retry after the configured delay."),
        ),

        _ => ErrorHandlingPolicy::new(RetryDirective::NoRetry, None),
    }
}

/// Runs `operation` until it succeeds, retrying failures classified as
/// [`RetryDirective::Timed`] up to `retry.max_attempts` attempts in total.
///
/// The last error is returned when retries are exhausted or the failure is not retriable.
pub async fn retry_with_backoff<T, F, Fut>(
    retry: &RetryConfig,
    operation: &'static str,
    mut f: F,
) -> SyncerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncerResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;

        let err = match f().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let policy = build_error_handling_policy(&err);
        if policy.retry_directive() == RetryDirective::NoRetry {
            error!(
                operation,
                attempt,
                error = %err,
                solution = policy.solution(),
                "operation failed"
            );
            return Err(err);
        }

        if attempt >= retry.max_attempts {
            error!(operation, attempt, error = %err, "operation failed, retries exhausted");
            return Err(err);
        }

        let delay = retry.delay_for_attempt(attempt);
        warn!(operation, attempt, ?delay, error = %err, "operation failed, retrying");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::syncer_error;

    fn err(kind: ErrorKind) -> SyncerError {
        SyncerError::from((kind, "test error"))
    }

    #[test]
    fn classifies_target_connectivity_as_timed_retry() {
        for kind in [
            ErrorKind::TargetConnectionFailed,
            ErrorKind::TargetLockTimeout,
            ErrorKind::CheckpointStoreUnavailable,
        ] {
            let policy = build_error_handling_policy(&err(kind));
            assert_eq!(policy.retry_directive(), RetryDirective::Timed);
            assert_eq!(policy.solution(), None);
        }
    }

    #[test]
    fn classifies_sharding_conflict_as_fatal() {
        let policy = build_error_handling_policy(&err(ErrorKind::ShardingDdlConflict));
        assert_eq!(policy.retry_directive(), RetryDirective::NoRetry);
        assert!(policy.solution().is_some());
    }

    #[test]
    fn classifies_apply_failures_as_fatal() {
        let policy = build_error_handling_policy(&err(ErrorKind::TargetApplyFailed));
        assert_eq!(policy.retry_directive(), RetryDirective::NoRetry);
    }

    fn retry_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay_ms: 10,
            max_delay_ms: 40,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_until_success() {
        let calls = Arc::new(AtomicU32::new(0));

        let result = retry_with_backoff(&retry_config(5), "test", || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(syncer_error!(ErrorKind::TargetLockTimeout, "locked"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: SyncerResult<()> = retry_with_backoff(&retry_config(3), "test", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(syncer_error!(ErrorKind::TargetConnectionFailed, "refused"))
            }
        })
        .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::TargetConnectionFailed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_fatal_failures() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: SyncerResult<()> = retry_with_backoff(&retry_config(3), "test", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(syncer_error!(ErrorKind::TargetApplyFailed, "duplicate"))
            }
        })
        .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::TargetApplyFailed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
