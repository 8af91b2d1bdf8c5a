use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::SyncerResult;
use crate::job::DmlOp;
use crate::location::{Location, Position};
use crate::source::EventSource;
use crate::types::{
    ChangeEvent, ColumnSchema, RowChange, SourceEvent, TableName, TableSchema, Value,
};

/// Distance between the locations of two consecutive events.
const EVENT_SIZE: u32 = 100;

/// Schema with an integer primary key `id` followed by a nullable text column `name`.
pub fn test_table_schema(table: &TableName) -> Arc<TableSchema> {
    Arc::new(TableSchema::new(
        table.clone(),
        vec![
            ColumnSchema::new("id", "int", false).primary(),
            ColumnSchema::new("name", "varchar(255)", true),
        ],
    ))
}

/// A row matching [`test_table_schema`].
pub fn test_row(id: i64, name: &str) -> Vec<Value> {
    vec![Value::Int(id), Value::String(name.to_owned())]
}

/// Builder of a change stream whose locations grow by a fixed step within one log file.
#[derive(Debug, Clone)]
pub struct EventStream {
    file: String,
    pos: u32,
    events: Vec<SourceEvent>,
    next_xid: u64,
}

impl EventStream {
    /// Starts a stream in `file`, right after its header.
    pub fn new(file: &str) -> Self {
        Self {
            file: file.to_owned(),
            pos: Location::new(file).position.pos,
            events: Vec::new(),
            next_xid: 1,
        }
    }

    /// Location the next event ends at.
    pub fn next_location(&self) -> Location {
        Location::with_position(Position::new(&self.file, self.pos + EVENT_SIZE), None)
    }

    fn push(mut self, event: ChangeEvent) -> Self {
        let location = self.next_location();
        self.pos = location.position.pos;
        self.events.push(SourceEvent::new(location, event));
        self
    }

    fn rows(self, op: DmlOp, table: &TableName, rows: Vec<RowChange>) -> Self {
        self.push(ChangeEvent::Rows {
            op,
            table: table.clone(),
            table_schema: test_table_schema(table),
            rows,
        })
    }

    pub fn insert(self, table: &TableName, rows: Vec<Vec<Value>>) -> Self {
        let rows = rows.into_iter().map(RowChange::insert).collect();
        self.rows(DmlOp::Insert, table, rows)
    }

    pub fn update(self, table: &TableName, rows: Vec<(Vec<Value>, Vec<Value>)>) -> Self {
        let rows = rows
            .into_iter()
            .map(|(old, new)| RowChange::update(old, new))
            .collect();
        self.rows(DmlOp::Update, table, rows)
    }

    pub fn delete(self, table: &TableName, rows: Vec<Vec<Value>>) -> Self {
        let rows = rows.into_iter().map(RowChange::delete).collect();
        self.rows(DmlOp::Delete, table, rows)
    }

    pub fn query(self, table: Option<&TableName>, sql: &str) -> Self {
        self.push(ChangeEvent::Query {
            table: table.cloned(),
            sql: sql.to_owned(),
        })
    }

    pub fn commit(mut self) -> Self {
        let xid = self.next_xid;
        self.next_xid += 1;
        self.push(ChangeEvent::Xid { xid })
    }

    pub fn other(self, description: &str) -> Self {
        self.push(ChangeEvent::Other {
            description: description.to_owned(),
        })
    }

    /// Switches to `next_file`, subsequent events are located in it.
    pub fn rotate(mut self, next_file: &str) -> Self {
        let pos = Location::new(next_file).position.pos;
        self = self.push(ChangeEvent::Rotate {
            next_name: next_file.to_owned(),
            pos,
        });
        self.file = next_file.to_owned();
        self.pos = pos;
        self
    }

    pub fn build(self) -> Vec<SourceEvent> {
        self.events
    }
}

/// [`EventSource`] replaying a fixed list of events.
#[derive(Debug, Clone)]
pub struct VecEventSource {
    events: VecDeque<SourceEvent>,
    /// When set, the source never ends and waits forever once drained.
    endless: bool,
}

impl VecEventSource {
    pub fn new(events: Vec<SourceEvent>) -> Self {
        Self {
            events: events.into(),
            endless: false,
        }
    }

    /// Like [`VecEventSource::new`], but the stream stays open after the last event.
    pub fn endless(events: Vec<SourceEvent>) -> Self {
        Self {
            events: events.into(),
            endless: true,
        }
    }

    pub fn remaining(&self) -> usize {
        self.events.len()
    }
}

impl EventSource for VecEventSource {
    async fn next_event(&mut self) -> SyncerResult<Option<SourceEvent>> {
        match self.events.pop_front() {
            Some(event) => Ok(Some(event)),
            None if self.endless => std::future::pending().await,
            None => Ok(None),
        }
    }
}
