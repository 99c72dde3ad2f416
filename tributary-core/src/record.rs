//! Records and cursors
//!
//! Zero-copy record payloads fetched from a shard, plus the opaque
//! cursor that marks a position within it.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a shard (partition) within a stream
pub type ShardId = u32;

/// Opaque position within a shard, issued by the coordination service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor(String);

impl Cursor {
    /// Wrap a service-issued cursor
    pub fn new(cursor: impl Into<String>) -> Self {
        Self(cursor.into())
    }

    /// Raw cursor value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Cursor {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// A single log record
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Time the record was appended to the shard
    pub timestamp: DateTime<Utc>,
    /// Record payload (zero-copy)
    pub data: Bytes,
}

impl Record {
    /// Create a record stamped with the current time
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            timestamp: Utc::now(),
            data: data.into(),
        }
    }
}

/// A batch of records fetched from one shard
#[derive(Debug, Clone)]
pub struct RecordBatch {
    /// Source shard
    pub shard: ShardId,
    /// Cursor the fetch started from
    pub cursor: Cursor,
    /// Cursor to resume from once this batch is processed
    pub next_cursor: Cursor,
    /// Fetched records, in shard order
    pub records: Vec<Record>,
}

impl RecordBatch {
    /// Number of records in the batch
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when the fetch returned nothing new
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total payload size in bytes
    pub fn size(&self) -> usize {
        self.records.iter().map(|r| r.data.len()).sum()
    }
}
