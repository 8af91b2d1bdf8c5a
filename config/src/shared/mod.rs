//! Shared configuration types for syncer pipelines.

mod base;
mod batch;
mod retry;
mod syncer;

pub use base::ValidationError;
pub use batch::BatchConfig;
pub use retry::RetryConfig;
pub use syncer::{SyncerConfig, UnexpectedShardPolicy};
