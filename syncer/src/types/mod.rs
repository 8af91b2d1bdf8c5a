mod event;
mod table;
mod value;

pub use event::{ChangeEvent, RowChange, SourceEvent};
pub use table::{ColumnSchema, TableName, TableSchema};
pub use value::Value;

/// Identifier of a pipeline, used to tell pipelines apart in logs.
pub type PipelineId = u64;
