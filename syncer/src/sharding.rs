//! Coordination of DDL statements replicated from sharded source tables.
//!
//! When several source tables are merged into one target table, each of them eventually reports
//! the same schema change. The statement must run once on the target, and only after every shard
//! reached it: rows written by a shard after its DDL must not be applied before the DDL, while
//! shards that did not report yet still produce rows of the old schema.
//!
//! [`ShardingDdlBarrier`] tracks one group per target table. A group collects reports until every
//! expected source table reported, then the coordinator drives it through execution:
//!
//! `Collecting -> Ready -> Executing -> Resuming -> (removed)`

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use config::shared::UnexpectedShardPolicy;
use tracing::{debug, info, warn};

use crate::bail;
use crate::error::{ErrorKind, SyncerResult};
use crate::job::Job;
use crate::location::Location;
use crate::types::TableName;

/// State of a sharding group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardingGroupState {
    /// Waiting for the remaining source tables to report.
    Collecting,
    /// Every source table reported, the DDL can run.
    Ready,
    /// The DDL is running on the target.
    Executing,
    /// The DDL ran, held jobs are being released.
    Resuming,
}

impl fmt::Display for ShardingGroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::Collecting => "collecting",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Resuming => "resuming",
        };

        f.write_str(state)
    }
}

/// Result of recording a DDL report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Other source tables still have to report.
    Waiting {
        target: TableName,
        remaining: usize,
    },
    /// The report completed the group, which is now [`ShardingGroupState::Ready`].
    Ready { target: TableName },
    /// The source table already reported this DDL.
    Duplicate,
    /// The source table already reported a different DDL for a group still collecting, so this
    /// one comes after it and must wait until the group is resolved.
    Blocked,
    /// The report came from an unexpected source table and was dropped.
    Ignored,
}

#[derive(Debug)]
struct ShardingGroup {
    state: ShardingGroupState,
    normalized_ddls: Vec<String>,
    expected: BTreeSet<TableName>,
    recorded: BTreeSet<TableName>,
    /// Where the first report starts, nothing after it may be checkpointed while unresolved.
    first_location: Location,
    /// Report that completed the group, its statements and location are used for execution.
    last_report: Job,
}

#[derive(Debug)]
pub struct ShardingDdlBarrier {
    policy: UnexpectedShardPolicy,
    groups: BTreeMap<TableName, ShardingGroup>,
}

impl ShardingDdlBarrier {
    pub fn new(policy: UnexpectedShardPolicy) -> Self {
        Self {
            policy,
            groups: BTreeMap::new(),
        }
    }

    /// Records the DDL report carried by `job`.
    ///
    /// The job must be a DDL job with sharding information and both a source and a target table.
    pub fn record(&mut self, job: &Job) -> SyncerResult<RecordOutcome> {
        let Some(ddl) = job.ddl() else {
            bail!(
                ErrorKind::InvalidState,
                "Only DDL jobs can be recorded by the sharding barrier",
                format!("got {} job", job.op_type())
            );
        };
        let (Some(info), Some(source), Some(target)) = (
            ddl.sharding_ddl_info.as_ref(),
            ddl.source_table.as_ref(),
            ddl.target_table.as_ref(),
        ) else {
            bail!(
                ErrorKind::InvalidState,
                "DDL job lacks the tables needed for sharding coordination",
                format!("origin sql `{}`", ddl.origin_sql)
            );
        };

        let normalized_ddls = normalize_ddls(&ddl.ddls);

        let Some(group) = self.groups.get_mut(target) else {
            if !info.source_tables.contains(source) {
                return unexpected_source(self.policy, source, target);
            }

            let mut group = ShardingGroup {
                state: ShardingGroupState::Collecting,
                normalized_ddls,
                expected: info.source_tables.clone(),
                recorded: BTreeSet::from([source.clone()]),
                first_location: job.start_location().clone(),
                last_report: job.clone(),
            };
            let outcome = group.outcome(target);
            if matches!(outcome, RecordOutcome::Ready { .. }) {
                group.state = ShardingGroupState::Ready;
            }

            info!(%source, %target, expected = group.expected.len(), "sharding ddl group opened");
            self.groups.insert(target.clone(), group);

            return Ok(outcome);
        };

        if group.state != ShardingGroupState::Collecting {
            bail!(
                ErrorKind::InvalidState,
                "Sharding group is not collecting reports",
                format!("group of {target} is {}", group.state)
            );
        }

        if !group.expected.contains(source) {
            return unexpected_source(self.policy, source, target);
        }

        if group.recorded.contains(source) {
            if group.normalized_ddls == normalized_ddls {
                debug!(%source, %target, "ignoring repeated sharding ddl report");
                return Ok(RecordOutcome::Duplicate);
            }

            return Ok(RecordOutcome::Blocked);
        }

        if group.normalized_ddls != normalized_ddls {
            bail!(
                ErrorKind::ShardingDdlConflict,
                "Source tables sharded into the same target reported different DDL",
                format!(
                    "target {target}: expected [{}], {source} reported [{}]",
                    group.normalized_ddls.join("; "),
                    normalized_ddls.join("; ")
                )
            );
        }

        group.recorded.insert(source.clone());
        group.last_report = job.clone();

        let outcome = group.outcome(target);
        if matches!(outcome, RecordOutcome::Ready { .. }) {
            group.state = ShardingGroupState::Ready;
        }
        debug!(%source, %target, ?outcome, "sharding ddl report recorded");

        Ok(outcome)
    }

    /// Returns the state of the group of `target`, if any.
    pub fn state(&self, target: &TableName) -> Option<ShardingGroupState> {
        self.groups.get(target).map(|group| group.state)
    }

    /// Returns whether jobs of `source` must be held back.
    ///
    /// This is the case once the source table reported its DDL to a group that is still
    /// collecting: anything it produces afterwards belongs after the DDL.
    pub fn holds(&self, source: &TableName) -> bool {
        self.groups.values().any(|group| {
            group.state == ShardingGroupState::Collecting && group.recorded.contains(source)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Unresolved groups with the location their first report starts at.
    ///
    /// Nothing of a target table past that location may be checkpointed before the group is
    /// resolved.
    pub fn pending_groups(&self) -> impl Iterator<Item = (&TableName, &Location)> {
        self.groups
            .iter()
            .map(|(target, group)| (target, &group.first_location))
    }

    /// Moves the group of `target` from ready to executing, returning the report whose
    /// statements must run.
    pub fn begin_execution(&mut self, target: &TableName) -> SyncerResult<Job> {
        let group = self.transition(
            target,
            ShardingGroupState::Ready,
            ShardingGroupState::Executing,
        )?;

        Ok(group.last_report.clone())
    }

    /// Moves the group of `target` from executing to resuming, once its DDL ran.
    pub fn resume(&mut self, target: &TableName) -> SyncerResult<()> {
        self.transition(
            target,
            ShardingGroupState::Executing,
            ShardingGroupState::Resuming,
        )?;

        Ok(())
    }

    /// Removes the resumed group of `target`.
    pub fn finish(&mut self, target: &TableName) -> SyncerResult<()> {
        match self.groups.get(target).map(|group| group.state) {
            Some(ShardingGroupState::Resuming) => {
                self.groups.remove(target);
                info!(%target, "sharding ddl group resolved");

                Ok(())
            }
            state => bail!(
                ErrorKind::InvalidState,
                "Sharding group cannot be finished",
                format!("group of {target} is in state {state:?}")
            ),
        }
    }

    fn transition(
        &mut self,
        target: &TableName,
        from: ShardingGroupState,
        to: ShardingGroupState,
    ) -> SyncerResult<&ShardingGroup> {
        let Some(group) = self.groups.get_mut(target) else {
            bail!(
                ErrorKind::InvalidState,
                "No sharding group for the target table",
                format!("target {target}")
            );
        };

        if group.state != from {
            bail!(
                ErrorKind::InvalidState,
                "Invalid sharding group transition",
                format!("group of {target} is {}, expected {from} to move to {to}", group.state)
            );
        }

        group.state = to;
        Ok(group)
    }
}

impl ShardingGroup {
    fn outcome(&self, target: &TableName) -> RecordOutcome {
        let remaining = self.expected.difference(&self.recorded).count();
        if remaining == 0 {
            RecordOutcome::Ready {
                target: target.clone(),
            }
        } else {
            RecordOutcome::Waiting {
                target: target.clone(),
                remaining,
            }
        }
    }
}

fn unexpected_source(
    policy: UnexpectedShardPolicy,
    source: &TableName,
    target: &TableName,
) -> SyncerResult<RecordOutcome> {
    match policy {
        UnexpectedShardPolicy::Reject => bail!(
            ErrorKind::UnexpectedShardingSource,
            "Sharding DDL reported by an unexpected source table",
            format!("{source} is not a known shard of {target}")
        ),
        UnexpectedShardPolicy::Ignore => {
            warn!(%source, %target, "dropping sharding ddl of an unexpected source table");
            Ok(RecordOutcome::Ignored)
        }
    }
}

/// Normalizes statements so that formatting differences between shards are not conflicts.
fn normalize_ddls(ddls: &[String]) -> Vec<String> {
    ddls.iter()
        .map(|ddl| {
            let collapsed = ddl.split_whitespace().collect::<Vec<_>>().join(" ");
            collapsed.trim_end_matches(';').trim_end().to_owned()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{QueryEventContext, ShardingDdlInfo};
    use crate::location::{EventContext, Position};

    fn location(pos: u32) -> Location {
        Location::with_position(Position::new("mysql-bin.000001", pos), None)
    }

    fn shard(index: u8) -> TableName {
        TableName::new(format!("shard_{index}"), "orders")
    }

    fn target() -> TableName {
        TableName::new("merged", "orders")
    }

    fn ddl_job(source: TableName, sql: &str, pos: u32) -> Job {
        Job::new_ddl(&QueryEventContext {
            event_context: EventContext {
                start_location: location(pos - 10),
                current_location: location(pos),
                last_location: location(pos - 10),
            },
            origin_sql: sql.to_owned(),
            need_handle_ddls: vec![sql.to_owned()],
            source_table: Some(source),
            target_table: Some(target()),
            sharding_ddl_info: Some(ShardingDdlInfo {
                source_tables: (1..=3).map(shard).collect(),
                target_tables: BTreeSet::from([target()]),
            }),
        })
    }

    const ADD_COLUMN: &str = "ALTER TABLE `merged`.`orders` ADD COLUMN note TEXT";

    #[test]
    fn group_becomes_ready_once_every_shard_reported() {
        let mut barrier = ShardingDdlBarrier::new(UnexpectedShardPolicy::Reject);

        let outcome = barrier.record(&ddl_job(shard(1), ADD_COLUMN, 100)).unwrap();
        assert_eq!(
            outcome,
            RecordOutcome::Waiting {
                target: target(),
                remaining: 2
            }
        );
        assert!(barrier.holds(&shard(1)));
        assert!(!barrier.holds(&shard(2)));

        barrier.record(&ddl_job(shard(2), ADD_COLUMN, 200)).unwrap();
        let err = barrier
            .record(&ddl_job(shard(3), "alter table `merged`.`orders` add column note text", 300))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShardingDdlConflict);

        let outcome = barrier
            .record(&ddl_job(
                shard(3),
                "ALTER TABLE `merged`.`orders`\n  ADD COLUMN note TEXT;",
                300,
            ))
            .unwrap();
        assert_eq!(outcome, RecordOutcome::Ready { target: target() });
        assert_eq!(barrier.state(&target()), Some(ShardingGroupState::Ready));
        assert!(!barrier.holds(&shard(1)));
    }

    #[test]
    fn drives_the_group_through_execution() {
        let mut barrier = ShardingDdlBarrier::new(UnexpectedShardPolicy::Reject);
        for (index, pos) in [(1, 100), (2, 200), (3, 300)] {
            barrier.record(&ddl_job(shard(index), ADD_COLUMN, pos)).unwrap();
        }

        let err = barrier.resume(&target()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        let report = barrier.begin_execution(&target()).unwrap();
        assert_eq!(report.ddls(), [ADD_COLUMN.to_owned()]);
        assert_eq!(report.current_location(), &location(300));
        assert_eq!(barrier.state(&target()), Some(ShardingGroupState::Executing));

        barrier.resume(&target()).unwrap();
        barrier.finish(&target()).unwrap();
        assert!(barrier.is_empty());
        assert_eq!(barrier.state(&target()), None);
    }

    #[test]
    fn repeated_reports_are_idempotent_and_later_ddl_is_blocked() {
        let mut barrier = ShardingDdlBarrier::new(UnexpectedShardPolicy::Reject);
        barrier.record(&ddl_job(shard(1), ADD_COLUMN, 100)).unwrap();

        let outcome = barrier.record(&ddl_job(shard(1), ADD_COLUMN, 100)).unwrap();
        assert_eq!(outcome, RecordOutcome::Duplicate);

        let outcome = barrier
            .record(&ddl_job(shard(1), "ALTER TABLE `merged`.`orders` DROP COLUMN note", 150))
            .unwrap();
        assert_eq!(outcome, RecordOutcome::Blocked);
    }

    #[test]
    fn unexpected_sources_follow_the_policy() {
        let mut barrier = ShardingDdlBarrier::new(UnexpectedShardPolicy::Reject);
        let err = barrier.record(&ddl_job(shard(9), ADD_COLUMN, 100)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedShardingSource);

        let mut barrier = ShardingDdlBarrier::new(UnexpectedShardPolicy::Ignore);
        barrier.record(&ddl_job(shard(1), ADD_COLUMN, 100)).unwrap();
        let outcome = barrier.record(&ddl_job(shard(9), ADD_COLUMN, 200)).unwrap();
        assert_eq!(outcome, RecordOutcome::Ignored);
        assert_eq!(barrier.state(&target()), Some(ShardingGroupState::Collecting));
    }

    #[test]
    fn pending_groups_start_at_the_first_report() {
        let mut barrier = ShardingDdlBarrier::new(UnexpectedShardPolicy::Reject);
        assert_eq!(barrier.pending_groups().count(), 0);

        barrier.record(&ddl_job(shard(1), ADD_COLUMN, 100)).unwrap();
        barrier.record(&ddl_job(shard(2), ADD_COLUMN, 200)).unwrap();

        let pending: Vec<_> = barrier.pending_groups().collect();
        assert_eq!(pending, vec![(&target(), &location(90))]);
    }

    #[test]
    fn rejects_jobs_without_sharding_information() {
        let mut barrier = ShardingDdlBarrier::new(UnexpectedShardPolicy::Reject);

        let err = barrier.record(&Job::new_flush()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }
}
