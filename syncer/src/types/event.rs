use std::sync::Arc;

use crate::job::DmlOp;
use crate::location::Location;
use crate::types::{TableName, TableSchema, Value};

/// Before and after images of one changed row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    /// Values before the change, empty for inserts.
    pub old_values: Vec<Value>,
    /// Values after the change, empty for deletes.
    pub values: Vec<Value>,
}

impl RowChange {
    pub fn insert(values: Vec<Value>) -> Self {
        Self {
            old_values: vec![],
            values,
        }
    }

    pub fn update(old_values: Vec<Value>, values: Vec<Value>) -> Self {
        Self { old_values, values }
    }

    pub fn delete(old_values: Vec<Value>) -> Self {
        Self {
            old_values,
            values: vec![],
        }
    }
}

/// Decoded change-stream event, as yielded by the source reader.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    /// One or more row changes of a single source table.
    Rows {
        op: DmlOp,
        table: TableName,
        table_schema: Arc<TableSchema>,
        rows: Vec<RowChange>,
    },
    /// A statement such as a DDL, `table` is `None` for statements not bound to a table.
    Query {
        table: Option<TableName>,
        sql: String,
    },
    /// Transaction commit.
    Xid { xid: u64 },
    /// Switch to the next log file.
    Rotate { next_name: String, pos: u32 },
    /// Anything the syncer does not apply, for example heartbeats or unsupported events.
    Other { description: String },
}

/// A [`ChangeEvent`] together with the stream location right after it.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceEvent {
    pub location: Location,
    pub event: ChangeEvent,
}

impl SourceEvent {
    pub fn new(location: Location, event: ChangeEvent) -> Self {
        Self { location, event }
    }
}
