//! Record processing callback
//!
//! The application hands each fetched batch to a [`RecordProcessor`].
//! Processing runs on the blocking thread pool, so implementations may
//! block on I/O.
//!
//! A processor error (or panic) is transient. The shard cursor does not
//! move, so the same batch is fetched again on the next dispatch and
//! delivery is at-least-once.

use crate::record::{RecordBatch, ShardId};

/// Error type processors may return
pub type ProcessError = Box<dyn std::error::Error + Send + Sync>;

/// Application callback invoked once per fetched batch
pub trait RecordProcessor: Send + Sync + 'static {
    /// Handle a non-empty batch from `shard`
    fn process(&self, shard: ShardId, batch: &RecordBatch) -> Result<(), ProcessError>;
}

impl<F> RecordProcessor for F
where
    F: Fn(ShardId, &RecordBatch) -> Result<(), ProcessError> + Send + Sync + 'static,
{
    fn process(&self, shard: ShardId, batch: &RecordBatch) -> Result<(), ProcessError> {
        self(shard, batch)
    }
}
