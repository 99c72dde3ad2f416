//! Tributary Core - consumer-group worker pool for sharded log streams
//!
//! This crate turns the set of shards a coordination service assigns to
//! this process into independently scheduled per-shard workers:
//! - Heartbeat-driven shard ownership
//! - Single-flight fetch/process/checkpoint tasks per shard
//! - Retirement of shards that move to other consumers
//! - Graceful, fully drained shutdown

pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod processor;
pub mod record;
pub mod runtime;
pub mod worker;

pub use config::{ConsumerConfig, CursorPosition};
pub use coordinator::{CoordinationClient, HeartbeatMonitor, InMemoryCoordinator};
pub use error::{Result, TributaryError};
pub use processor::{ProcessError, RecordProcessor};
pub use record::{Cursor, Record, RecordBatch, ShardId};
pub use worker::ConsumerWorker;

/// Default interval between worker pool ticks in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Default heartbeat interval in seconds
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 5;

/// Default time the service keeps a silent consumer's shards, in seconds
pub const DEFAULT_GROUP_TIMEOUT_SECS: u64 = 15;

/// Largest number of records a single fetch may request
pub const MAX_FETCH_BATCHES: usize = 1000;
