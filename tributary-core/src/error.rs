//! Error types for Tributary
//!
//! Error taxonomy covering the coordination service boundary,
//! configuration, record processing, and the worker pool runtime.

use thiserror::Error;

use crate::record::ShardId;

/// Primary error type for all Tributary operations
#[derive(Debug, Error)]
pub enum TributaryError {
    // ========== Coordination Errors ==========

    /// Heartbeat to the coordination service failed
    #[error("Heartbeat for consumer {consumer} failed: {reason}")]
    HeartbeatFailed { consumer: String, reason: String },

    /// Fetching records for a shard failed
    #[error("Fetch from shard {shard} failed: {reason}")]
    FetchFailed { shard: ShardId, reason: String },

    /// Reading or writing a shard checkpoint failed
    #[error("Checkpoint for shard {shard} failed: {reason}")]
    CheckpointFailed { shard: ShardId, reason: String },

    /// Consumer group could not be created or looked up
    #[error("Consumer group {group} unavailable: {reason}")]
    ConsumerGroupFailed { group: String, reason: String },

    /// Connection failed
    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    // ========== Configuration Errors ==========

    /// A configuration field holds an unusable value
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    /// Configuration document could not be parsed
    #[error("Failed to parse configuration: {reason}")]
    ConfigParse { reason: String },

    // ========== Processing Errors ==========

    /// The record processor rejected or panicked on a batch
    #[error("Processor failed on shard {shard}: {message}")]
    ProcessorFailed { shard: ShardId, message: String },

    // ========== Runtime Errors ==========

    /// The worker pool loop is already running
    #[error("Consumer worker {consumer} is already running")]
    AlreadyRunning { consumer: String },

    /// Shutdown in progress
    #[error("Shutdown in progress")]
    ShutdownInProgress,

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TributaryError {
    /// Returns true if the failed work should simply be retried on the next cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TributaryError::HeartbeatFailed { .. }
                | TributaryError::FetchFailed { .. }
                | TributaryError::CheckpointFailed { .. }
                | TributaryError::ConnectionFailed { .. }
                | TributaryError::ProcessorFailed { .. }
        )
    }

    /// Returns true if this error must be surfaced to the caller immediately
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TributaryError::InvalidConfig { .. }
                | TributaryError::ConfigParse { .. }
                | TributaryError::ConsumerGroupFailed { .. }
        )
    }

    pub(crate) fn invalid_config(field: &'static str, reason: impl Into<String>) -> Self {
        TributaryError::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}

/// Result type alias for Tributary operations
pub type Result<T> = std::result::Result<T, TributaryError>;
