use fail::fail_point;

use crate::bail;
use crate::error::{ErrorKind, SyncerResult};

pub const EXECUTE_DML__BEFORE_APPLY: &str = "execute_dml.before_apply";
pub const STORE_CHECKPOINT__BEFORE_STORE: &str = "store_checkpoint.before_store";
pub const EXECUTE_DDL__BEFORE_APPLY: &str = "execute_ddl.before_apply";

pub fn syncer_fail_point(name: &str) -> SyncerResult<()> {
    fail_point!(name, |parameter| {
        let mut error_kind = ErrorKind::WithNoRetry;
        if let Some(parameter) = parameter {
            error_kind = match parameter.as_str() {
                "no_retry" => ErrorKind::WithNoRetry,
                "timed_retry" => ErrorKind::WithTimedRetry,
                _ => ErrorKind::WithNoRetry,
            }
        }

        bail!(
            error_kind,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}
