//! Coordination service client boundary
//!
//! Everything the worker pool needs from the shared coordination and
//! storage service: group membership, shard ownership via heartbeats,
//! record fetches, and checkpoints. Wire protocol and authentication
//! live behind implementations of [`CoordinationClient`].

use std::time::Duration;

use async_trait::async_trait;

use crate::config::CursorPosition;
use crate::error::Result;
use crate::record::{Cursor, RecordBatch, ShardId};

/// Client for one consumer of one consumer group on one stream
///
/// Implementations must be safe to call concurrently from the
/// heartbeat loop and from every shard task.
#[async_trait]
pub trait CoordinationClient: Send + Sync + 'static {
    /// Create the consumer group, succeeding if it already exists
    async fn create_consumer_group(&self, timeout: Duration, in_order: bool) -> Result<()>;

    /// Report liveness plus the shards still held; returns the shards
    /// the service currently assigns to this consumer
    async fn heartbeat(&self, held: &[ShardId]) -> Result<Vec<ShardId>>;

    /// Read the stored checkpoint for a shard
    async fn fetch_checkpoint(&self, shard: ShardId) -> Result<Option<Cursor>>;

    /// Translate a start position into a concrete cursor
    async fn resolve_cursor(&self, shard: ShardId, position: CursorPosition) -> Result<Cursor>;

    /// Fetch up to `max_batches` records starting at `cursor`
    async fn fetch(&self, shard: ShardId, cursor: &Cursor, max_batches: usize)
        -> Result<RecordBatch>;

    /// Persist the position consumption should resume from
    async fn commit_checkpoint(&self, shard: ShardId, cursor: &Cursor) -> Result<()>;
}
