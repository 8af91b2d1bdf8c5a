//! Jobs, the unit of work flowing from the change stream to the worker queues.
//!
//! A [`Job`] is built from one change-stream event and carries a snapshot of the stream
//! locations. Row changes become DML jobs routed to a single queue, every other kind is a barrier
//! broadcast to all queues.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::bail;
use crate::error::{ErrorKind, SyncerResult};
use crate::location::{EventContext, Location};
use crate::types::{TableName, TableSchema, Value};

/// Kind of a row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DmlOp {
    Insert,
    Update,
    Delete,
}

impl DmlOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            DmlOp::Insert => "insert",
            DmlOp::Update => "update",
            DmlOp::Delete => "delete",
        }
    }
}

impl fmt::Display for DmlOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind tag of a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OpType {
    #[default]
    Null,
    Insert,
    Update,
    Delete,
    Ddl,
    Xid,
    Flush,
    Skip,
    Rotate,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Null => "",
            OpType::Insert => "insert",
            OpType::Update => "update",
            OpType::Delete => "delete",
            OpType::Ddl => "ddl",
            OpType::Xid => "xid",
            OpType::Flush => "flush",
            OpType::Skip => "skip",
            OpType::Rotate => "rotate",
        }
    }

    /// Returns `true` for kinds that must reach every queue.
    pub fn is_barrier(&self) -> bool {
        matches!(
            self,
            OpType::Ddl | OpType::Xid | OpType::Flush | OpType::Skip | OpType::Rotate
        )
    }
}

impl From<DmlOp> for OpType {
    fn from(op: DmlOp) -> Self {
        match op {
            DmlOp::Insert => OpType::Insert,
            DmlOp::Update => OpType::Update,
            DmlOp::Delete => OpType::Delete,
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single row change bound to one target table.
#[derive(Debug, Clone, PartialEq)]
pub struct DmlPayload {
    op: DmlOp,
    safe_mode: bool,
    target_table_id: String,
    source_table: TableName,
    columns: Vec<String>,
    old_values: Vec<Value>,
    values: Vec<Value>,
    table_schema: Arc<TableSchema>,
}

impl DmlPayload {
    /// Builds a payload, checking that the value lists match the columns of `table_schema`.
    ///
    /// Inserts carry only new values, deletes only old values and updates both.
    pub fn new(
        op: DmlOp,
        safe_mode: bool,
        target_table_id: impl Into<String>,
        source_table: TableName,
        old_values: Vec<Value>,
        values: Vec<Value>,
        table_schema: Arc<TableSchema>,
    ) -> SyncerResult<Self> {
        let columns = table_schema.column_names();
        let expected = columns.len();

        let (expected_old, expected_new) = match op {
            DmlOp::Insert => (0, expected),
            DmlOp::Update => (expected, expected),
            DmlOp::Delete => (expected, 0),
        };

        if old_values.len() != expected_old || values.len() != expected_new {
            bail!(
                ErrorKind::MalformedPayload,
                "Row values do not match the table columns",
                format!(
                    "{op} on {source_table} with {expected} columns got {} old and {} new values",
                    old_values.len(),
                    values.len()
                )
            );
        }

        Ok(Self {
            op,
            safe_mode,
            target_table_id: target_table_id.into(),
            source_table,
            columns,
            old_values,
            values,
            table_schema,
        })
    }

    pub fn op(&self) -> DmlOp {
        self.op
    }

    pub fn safe_mode(&self) -> bool {
        self.safe_mode
    }

    pub fn target_table_id(&self) -> &str {
        &self.target_table_id
    }

    pub fn source_table(&self) -> &TableName {
        &self.source_table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn old_values(&self) -> &[Value] {
        &self.old_values
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn table_schema(&self) -> &Arc<TableSchema> {
        &self.table_schema
    }

    /// Values of the key columns of the row image this change applies to.
    ///
    /// Inserts identify the new row, updates and deletes the old one.
    pub fn key_values(&self) -> Vec<Value> {
        let image = match self.op {
            DmlOp::Insert => &self.values,
            DmlOp::Update | DmlOp::Delete => &self.old_values,
        };

        self.table_schema
            .key_column_indexes()
            .into_iter()
            .filter_map(|index| image.get(index).cloned())
            .collect()
    }

    /// Values of the key columns of the new row image, `None` for deletes.
    pub fn new_key_values(&self) -> Option<Vec<Value>> {
        if self.op == DmlOp::Delete {
            return None;
        }

        Some(
            self.table_schema
                .key_column_indexes()
                .into_iter()
                .filter_map(|index| self.values.get(index).cloned())
                .collect(),
        )
    }
}

impl fmt::Display for DmlPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[safemode: {}, targetTableID: {}, op: {}, columns: [{}], oldValues: [{}], values: [{}]]",
            self.safe_mode,
            self.target_table_id,
            self.op,
            self.columns.join(" "),
            join_values(&self.old_values),
            join_values(&self.values)
        )
    }
}

fn join_values(values: &[Value]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Source and target tables involved in a sharding DDL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardingDdlInfo {
    /// Every source table that shards into the target, not only the reporting one.
    pub source_tables: BTreeSet<TableName>,
    pub target_tables: BTreeSet<TableName>,
}

/// Context of a query event, from which DDL jobs are built.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryEventContext {
    pub event_context: EventContext,
    /// Statement as read from the source.
    pub origin_sql: String,
    /// Statements rewritten for the target, executed in order.
    pub need_handle_ddls: Vec<String>,
    /// Source table the statement applies to, if any.
    pub source_table: Option<TableName>,
    /// Target table the statement applies to, if any.
    pub target_table: Option<TableName>,
    pub sharding_ddl_info: Option<ShardingDdlInfo>,
}

/// Payload of a DDL job.
#[derive(Debug, Clone, PartialEq)]
pub struct DdlPayload {
    pub origin_sql: String,
    pub ddls: Vec<String>,
    pub source_table: Option<TableName>,
    pub target_table: Option<TableName>,
    pub sharding_ddl_info: Option<ShardingDdlInfo>,
}

#[derive(Debug, Clone, PartialEq)]
enum JobPayload {
    Dml(DmlPayload),
    Ddl(DdlPayload),
    Xid,
    Flush,
    Skip,
    Rotate,
}

/// Unit of work produced from the change stream.
///
/// The payload slots are only reachable for the kinds owning them, [`Job::dml`] returns `None`
/// for a DDL job and [`Job::ddls`] is empty for anything but DDL.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    payload: JobPayload,
    start_location: Location,
    current_location: Location,
    last_location: Location,
}

impl Job {
    /// Builds a DML job, copying all three locations of `event_context`.
    pub fn new_dml(dml: DmlPayload, event_context: &EventContext) -> Self {
        Self {
            payload: JobPayload::Dml(dml),
            start_location: event_context.start_location.clone(),
            current_location: event_context.current_location.clone(),
            last_location: event_context.last_location.clone(),
        }
    }

    /// Builds a DDL job executing the rewritten statements of `query_context`.
    pub fn new_ddl(query_context: &QueryEventContext) -> Self {
        let event_context = &query_context.event_context;

        Self {
            payload: JobPayload::Ddl(DdlPayload {
                origin_sql: query_context.origin_sql.clone(),
                ddls: query_context.need_handle_ddls.clone(),
                source_table: query_context.source_table.clone(),
                target_table: query_context.target_table.clone(),
                sharding_ddl_info: query_context.sharding_ddl_info.clone(),
            }),
            start_location: event_context.start_location.clone(),
            current_location: event_context.current_location.clone(),
            last_location: event_context.last_location.clone(),
        }
    }

    /// Builds a transaction boundary job.
    pub fn new_xid(start: Location, current: Location, last: Location) -> Self {
        Self {
            payload: JobPayload::Xid,
            start_location: start,
            current_location: current,
            last_location: last,
        }
    }

    /// Builds a job forcing every queue to flush, not tied to any event.
    pub fn new_flush() -> Self {
        Self {
            payload: JobPayload::Flush,
            start_location: Location::zero(),
            current_location: Location::zero(),
            last_location: Location::zero(),
        }
    }

    /// Builds a job for an event that is observed but not applied.
    ///
    /// The last location is the last known good one of the context and not the skipped event's
    /// own position, so the checkpoint never moves past data that was filtered out.
    pub fn new_skip(event_context: &EventContext) -> Self {
        Self {
            payload: JobPayload::Skip,
            start_location: event_context.start_location.clone(),
            current_location: event_context.current_location.clone(),
            last_location: event_context.last_location.clone(),
        }
    }

    /// Builds a job marking the switch to a new log file starting at `location`.
    pub fn new_rotate(location: Location) -> Self {
        Self {
            payload: JobPayload::Rotate,
            start_location: location.clone(),
            current_location: location.clone(),
            last_location: location,
        }
    }

    pub fn op_type(&self) -> OpType {
        match &self.payload {
            JobPayload::Dml(dml) => dml.op.into(),
            JobPayload::Ddl(_) => OpType::Ddl,
            JobPayload::Xid => OpType::Xid,
            JobPayload::Flush => OpType::Flush,
            JobPayload::Skip => OpType::Skip,
            JobPayload::Rotate => OpType::Rotate,
        }
    }

    pub fn is_barrier(&self) -> bool {
        self.op_type().is_barrier()
    }

    pub fn dml(&self) -> Option<&DmlPayload> {
        match &self.payload {
            JobPayload::Dml(dml) => Some(dml),
            _ => None,
        }
    }

    pub fn ddl(&self) -> Option<&DdlPayload> {
        match &self.payload {
            JobPayload::Ddl(ddl) => Some(ddl),
            _ => None,
        }
    }

    /// Statements of a DDL job, empty for any other kind.
    pub fn ddls(&self) -> &[String] {
        match &self.payload {
            JobPayload::Ddl(ddl) => &ddl.ddls,
            _ => &[],
        }
    }

    /// Source table of a DML or table-bound DDL job.
    pub fn source_table(&self) -> Option<&TableName> {
        match &self.payload {
            JobPayload::Dml(dml) => Some(&dml.source_table),
            JobPayload::Ddl(ddl) => ddl.source_table.as_ref(),
            _ => None,
        }
    }

    pub fn start_location(&self) -> &Location {
        &self.start_location
    }

    pub fn current_location(&self) -> &Location {
        &self.current_location
    }

    pub fn last_location(&self) -> &Location {
        &self.last_location
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dml = self.dml().map(ToString::to_string).unwrap_or_default();

        write!(
            f,
            "tp: {}, dml: {}, ddls: [{}], last_location: {}, start_location: {}, current_location: {}",
            self.op_type(),
            dml,
            self.ddls().join(", "),
            self.last_location,
            self.start_location,
            self.current_location
        )
    }
}
