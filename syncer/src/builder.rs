//! Translation of change-stream events into jobs.
//!
//! [`JobBuilder`] is the single producer of the pipeline. It tracks the stream location, asks the
//! [`TableRouter`] where each source table goes and attaches the location snapshot to every job.

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::checkpoint::ResumePlan;
use crate::error::SyncerResult;
use crate::job::{DmlPayload, Job, QueryEventContext, ShardingDdlInfo};
use crate::location::{EventContext, LocationTracker};
use crate::types::{ChangeEvent, SourceEvent, TableName};

/// Filtering and routing rules of source tables.
pub trait TableRouter {
    /// Returns the target table of `source`, or `None` when the table is filtered out.
    fn target_table(&self, source: &TableName) -> Option<TableName>;

    /// Returns every source table merged into `target`.
    ///
    /// A target with more than one source is sharded and its DDL is coordinated.
    fn shard_sources(&self, target: &TableName) -> BTreeSet<TableName>;

    /// Rewrites a statement of `source` into the statements to run on `target`.
    ///
    /// An empty list means the statement has no effect on the target.
    fn rewrite_ddl(
        &self,
        sql: &str,
        source: &TableName,
        target: &TableName,
    ) -> SyncerResult<Vec<String>>;
}

#[derive(Debug)]
pub struct JobBuilder<R> {
    table_router: R,
    tracker: LocationTracker,
    resume_plan: ResumePlan,
    safe_mode: bool,
    /// Set while replaying changes that may already be on the target.
    replaying: bool,
}

impl<R> JobBuilder<R>
where
    R: TableRouter,
{
    /// Creates a builder reading from the start of `resume_plan`.
    ///
    /// `safe_mode` forces idempotent DML for every change.
    pub fn new(table_router: R, resume_plan: ResumePlan, safe_mode: bool) -> Self {
        let tracker = LocationTracker::new(resume_plan.start().clone());
        let replaying = resume_plan.is_resumed();

        Self {
            table_router,
            tracker,
            resume_plan,
            safe_mode,
            replaying,
        }
    }

    pub fn location_tracker(&self) -> &LocationTracker {
        &self.tracker
    }

    /// Returns whether the next row change would be built in safe mode.
    pub fn is_safe_mode(&self) -> bool {
        self.safe_mode || self.replaying
    }

    /// Builds the jobs of one event.
    pub fn build(&mut self, event: SourceEvent) -> SyncerResult<Vec<Job>> {
        let SourceEvent { location, event } = event;

        match event {
            ChangeEvent::Rows {
                op,
                table,
                table_schema,
                rows,
            } => {
                let context = self.tracker.advance(location)?;
                let Some(target) = self.table_router.target_table(&table) else {
                    debug!(%table, "skipping rows of a filtered table");
                    return Ok(vec![Job::new_skip(&context)]);
                };

                if rows.is_empty() {
                    return Ok(vec![Job::new_skip(&context)]);
                }

                let safe_mode = self.safe_mode
                    || self.replaying
                    || self.resume_plan.requires_safe_mode(&context.current_location)?;
                let target_table_id = target.quoted();

                rows.into_iter()
                    .map(|row| {
                        let dml = DmlPayload::new(
                            op,
                            safe_mode,
                            target_table_id.clone(),
                            table.clone(),
                            row.old_values,
                            row.values,
                            table_schema.clone(),
                        )?;

                        Ok(Job::new_dml(dml, &context))
                    })
                    .collect()
            }
            ChangeEvent::Query { table, sql } => {
                let context = self.tracker.advance(location)?;
                let job = self.build_query(context, table, sql)?;
                // Statements commit implicitly.
                self.tracker.mark_processed();

                Ok(vec![job])
            }
            ChangeEvent::Xid { xid } => {
                let context = self.tracker.advance(location)?;
                self.tracker.mark_processed();

                if self.replaying
                    && !self
                        .resume_plan
                        .requires_safe_mode(&context.current_location)?
                {
                    info!(
                        xid,
                        location = %context.current_location,
                        "replay completed, leaving safe mode"
                    );
                    self.replaying = false;
                }

                Ok(vec![Job::new_xid(
                    context.start_location,
                    context.current_location,
                    self.tracker.last().clone(),
                )])
            }
            ChangeEvent::Rotate { next_name, pos } => {
                let context = self.tracker.rotate(next_name, pos)?;
                self.tracker.mark_processed();

                Ok(vec![Job::new_rotate(context.current_location)])
            }
            ChangeEvent::Other { description } => {
                let context = self.tracker.advance(location)?;
                debug!(%description, "skipping event");

                Ok(vec![Job::new_skip(&context)])
            }
        }
    }

    fn build_query(
        &self,
        context: EventContext,
        table: Option<TableName>,
        sql: String,
    ) -> SyncerResult<Job> {
        let Some(source) = table else {
            debug!(%sql, "skipping statement not bound to a table");
            return Ok(Job::new_skip(&context));
        };

        let Some(target) = self.table_router.target_table(&source) else {
            debug!(%source, "skipping statement of a filtered table");
            return Ok(Job::new_skip(&context));
        };

        let ddls = self.table_router.rewrite_ddl(&sql, &source, &target)?;
        if ddls.is_empty() {
            debug!(%source, %sql, "statement has no effect on the target");
            return Ok(Job::new_skip(&context));
        }

        let shard_sources = self.table_router.shard_sources(&target);
        let sharding_ddl_info = (shard_sources.len() > 1).then(|| ShardingDdlInfo {
            source_tables: shard_sources,
            target_tables: BTreeSet::from([target.clone()]),
        });

        Ok(Job::new_ddl(&QueryEventContext {
            event_context: context,
            origin_sql: sql,
            need_handle_ddls: ddls,
            source_table: Some(source),
            target_table: Some(target),
            sharding_ddl_info,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use crate::error::ErrorKind;
    use crate::job::{DmlOp, OpType};
    use crate::location::{Location, Position};
    use crate::test_utils::router::StaticTableRouter;
    use crate::types::{ColumnSchema, RowChange, TableSchema, Value};

    fn location(pos: u32) -> Location {
        Location::with_position(Position::new("mysql-bin.000001", pos), None)
    }

    fn orders(schema: &str) -> TableName {
        TableName::new(schema, "orders")
    }

    fn router() -> StaticTableRouter {
        StaticTableRouter::new()
            .route(orders("shard_1"), orders("merged"))
            .route(orders("shard_2"), orders("merged"))
            .route(orders("single"), orders("single"))
    }

    fn rows_event(table: TableName, pos: u32, ids: &[i64]) -> SourceEvent {
        let schema = Arc::new(TableSchema::new(
            table.clone(),
            vec![ColumnSchema::new("id", "int", false).primary()],
        ));

        SourceEvent::new(
            location(pos),
            ChangeEvent::Rows {
                op: DmlOp::Insert,
                table,
                table_schema: schema,
                rows: ids
                    .iter()
                    .map(|id| RowChange::insert(vec![Value::Int(*id)]))
                    .collect(),
            },
        )
    }

    fn fresh_builder() -> JobBuilder<StaticTableRouter> {
        let plan = ResumePlan::from_checkpoints(&BTreeMap::new(), location(4)).unwrap();
        JobBuilder::new(router(), plan, false)
    }

    #[test]
    fn builds_one_dml_job_per_row() {
        let mut builder = fresh_builder();

        let jobs = builder.build(rows_event(orders("shard_1"), 100, &[1, 2])).unwrap();

        assert_eq!(jobs.len(), 2);
        for job in &jobs {
            let dml = job.dml().unwrap();
            assert_eq!(dml.target_table_id(), "`merged`.`orders`");
            assert_eq!(dml.source_table(), &orders("shard_1"));
            assert!(!dml.safe_mode());
            assert_eq!(job.start_location(), &location(4));
            assert_eq!(job.current_location(), &location(100));
            assert_eq!(job.last_location(), &location(4));
        }
    }

    #[test]
    fn filtered_tables_and_unknown_events_become_skip_jobs() {
        let mut builder = fresh_builder();

        let jobs = builder.build(rows_event(orders("ignored"), 50, &[1])).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].op_type(), OpType::Skip);
        assert_eq!(jobs[0].last_location(), &location(4));

        let jobs = builder
            .build(SourceEvent::new(
                location(60),
                ChangeEvent::Other {
                    description: "heartbeat".to_owned(),
                },
            ))
            .unwrap();
        assert_eq!(jobs[0].op_type(), OpType::Skip);
        assert_eq!(jobs[0].current_location(), &location(60));
    }

    #[test]
    fn xid_marks_the_location_as_processed() {
        let mut builder = fresh_builder();
        builder.build(rows_event(orders("single"), 100, &[1])).unwrap();

        let jobs = builder
            .build(SourceEvent::new(location(120), ChangeEvent::Xid { xid: 7 }))
            .unwrap();

        assert_eq!(jobs[0].op_type(), OpType::Xid);
        assert_eq!(jobs[0].start_location(), &location(100));
        assert_eq!(jobs[0].current_location(), &location(120));
        assert_eq!(jobs[0].last_location(), &location(120));
        assert_eq!(builder.location_tracker().last(), &location(120));
    }

    #[test]
    fn ddl_of_sharded_tables_carries_sharding_info() {
        let mut builder = fresh_builder();

        let jobs = builder
            .build(SourceEvent::new(
                location(200),
                ChangeEvent::Query {
                    table: Some(orders("shard_2")),
                    sql: "ALTER TABLE `shard_2`.`orders` ADD COLUMN note TEXT".to_owned(),
                },
            ))
            .unwrap();

        let ddl = jobs[0].ddl().unwrap();
        assert_eq!(
            jobs[0].ddls(),
            ["ALTER TABLE `merged`.`orders` ADD COLUMN note TEXT".to_owned()]
        );
        let info = ddl.sharding_ddl_info.as_ref().unwrap();
        assert_eq!(info.source_tables, BTreeSet::from([orders("shard_1"), orders("shard_2")]));
        assert_eq!(info.target_tables, BTreeSet::from([orders("merged")]));

        let jobs = builder
            .build(SourceEvent::new(
                location(300),
                ChangeEvent::Query {
                    table: Some(orders("single")),
                    sql: "TRUNCATE TABLE `single`.`orders`".to_owned(),
                },
            ))
            .unwrap();
        assert!(jobs[0].ddl().unwrap().sharding_ddl_info.is_none());
    }

    #[test]
    fn rotate_switches_the_log_file() {
        let mut builder = fresh_builder();

        let jobs = builder
            .build(SourceEvent::new(
                location(500),
                ChangeEvent::Rotate {
                    next_name: "mysql-bin.000002".to_owned(),
                    pos: 4,
                },
            ))
            .unwrap();

        let expected = Location::new("mysql-bin.000002");
        assert_eq!(jobs[0].op_type(), OpType::Rotate);
        assert_eq!(jobs[0].current_location(), &expected);
        assert_eq!(builder.location_tracker().current(), &expected);
    }

    #[test]
    fn replays_in_safe_mode_until_past_the_largest_bucket() {
        let checkpoints = BTreeMap::from([
            ("q_0".to_owned(), location(100)),
            ("q_1".to_owned(), location(300)),
        ]);
        let plan = ResumePlan::from_checkpoints(&checkpoints, Location::zero()).unwrap();
        let mut builder = JobBuilder::new(router(), plan, false);

        let jobs = builder.build(rows_event(orders("single"), 200, &[1])).unwrap();
        assert!(jobs[0].dml().unwrap().safe_mode());

        builder
            .build(SourceEvent::new(location(250), ChangeEvent::Xid { xid: 1 }))
            .unwrap();
        assert!(builder.is_safe_mode());

        // Rows of the first transaction past the largest bucket may have been flushed too.
        let jobs = builder.build(rows_event(orders("single"), 350, &[2])).unwrap();
        assert!(jobs[0].dml().unwrap().safe_mode());

        builder
            .build(SourceEvent::new(location(400), ChangeEvent::Xid { xid: 2 }))
            .unwrap();
        assert!(!builder.is_safe_mode());

        let jobs = builder.build(rows_event(orders("single"), 450, &[3])).unwrap();
        assert!(!jobs[0].dml().unwrap().safe_mode());
    }

    #[test]
    fn locations_going_backwards_are_rejected() {
        let mut builder = fresh_builder();
        builder.build(rows_event(orders("single"), 100, &[1])).unwrap();

        let err = builder
            .build(rows_event(orders("single"), 90, &[2]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OrderingViolation);
    }
}
