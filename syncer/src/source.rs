use std::future::Future;

use crate::error::SyncerResult;
use crate::types::SourceEvent;

/// Reader of the source change stream.
///
/// Events must be yielded in stream order. The reader is responsible for reconnecting to the
/// source, the syncer only sees a linear sequence of events.
pub trait EventSource {
    /// Returns the next event, or `None` once the stream ended.
    fn next_event(&mut self) -> impl Future<Output = SyncerResult<Option<SourceEvent>>> + Send;
}
