//! Worker pool
//!
//! Per-shard workers, the table that owns them, and the orchestrator
//! loop that keeps the table in line with shard ownership.

pub mod consumer;
pub mod pool;
pub mod shard;

pub use consumer::ConsumerWorker;
pub use pool::ShardPool;
pub use shard::{Dispatch, ShardWorker, WorkerPhase};
