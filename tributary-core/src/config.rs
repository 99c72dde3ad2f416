//! Consumer configuration
//!
//! Stream identity, consumer-group membership, and the cadences that
//! drive the worker pool. Durations serialize as integer milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TributaryError};
use crate::{
    DEFAULT_GROUP_TIMEOUT_SECS, DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_POLL_INTERVAL_MS,
    MAX_FETCH_BATCHES,
};

/// Where a shard without a stored checkpoint starts consuming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorPosition {
    /// Oldest record still retained by the shard
    Begin,
    /// Only records appended after the consumer starts
    End,
    /// First record at or after the given unix time (seconds)
    Timestamp(i64),
}

impl CursorPosition {
    /// Parse `begin`, `end`, or a unix timestamp in seconds
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "begin" => Ok(CursorPosition::Begin),
            "end" => Ok(CursorPosition::End),
            other => other.parse::<i64>().map(CursorPosition::Timestamp).map_err(|_| {
                TributaryError::invalid_config(
                    "cursor_position",
                    format!("expected begin, end or unix seconds, got {:?}", value),
                )
            }),
        }
    }
}

/// Configuration for a consumer worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Project owning the stream
    pub project: String,
    /// Stream (logstore) to consume
    pub logstore: String,
    /// Consumer group name
    pub consumer_group: String,
    /// Member name of this process within the group
    pub consumer_name: String,
    /// Interval between worker pool ticks (data fetch interval)
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Interval between heartbeats to the coordination service
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Time after which the service reclaims shards of a silent consumer
    #[serde(with = "duration_ms")]
    pub group_timeout: Duration,
    /// Start position for shards without a checkpoint
    pub cursor_position: CursorPosition,
    /// Upper bound on records returned by a single fetch
    pub max_fetch_batches: usize,
    /// Upper bound on shard tasks fetching or processing at once
    pub max_concurrent_tasks: usize,
    /// Minimum spacing of checkpoint commits (zero = every batch)
    #[serde(with = "duration_ms")]
    pub checkpoint_interval: Duration,
    /// Ask the service to hand over shards in order
    pub in_order: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            project: "default-project".into(),
            logstore: "default-logstore".into(),
            consumer_group: "default-group".into(),
            consumer_name: uuid::Uuid::new_v4().to_string(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            group_timeout: Duration::from_secs(DEFAULT_GROUP_TIMEOUT_SECS),
            cursor_position: CursorPosition::Begin,
            max_fetch_batches: MAX_FETCH_BATCHES,
            max_concurrent_tasks: 64,
            checkpoint_interval: Duration::ZERO,
            in_order: false,
        }
    }
}

impl ConsumerConfig {
    /// Create a config for the given stream and group, defaults elsewhere
    pub fn new(
        project: impl Into<String>,
        logstore: impl Into<String>,
        consumer_group: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            logstore: logstore.into(),
            consumer_group: consumer_group.into(),
            ..Default::default()
        }
    }

    /// Check every field, returning the first problem found
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("project", &self.project),
            ("logstore", &self.logstore),
            ("consumer_group", &self.consumer_group),
            ("consumer_name", &self.consumer_name),
        ] {
            if value.trim().is_empty() {
                return Err(TributaryError::invalid_config(field, "must not be empty"));
            }
        }

        if self.poll_interval.is_zero() {
            return Err(TributaryError::invalid_config("poll_interval", "must be positive"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(TributaryError::invalid_config(
                "heartbeat_interval",
                "must be positive",
            ));
        }
        if self.group_timeout <= self.heartbeat_interval {
            return Err(TributaryError::invalid_config(
                "group_timeout",
                format!(
                    "must exceed heartbeat_interval ({:?})",
                    self.heartbeat_interval
                ),
            ));
        }
        if self.max_fetch_batches == 0 || self.max_fetch_batches > MAX_FETCH_BATCHES {
            return Err(TributaryError::invalid_config(
                "max_fetch_batches",
                format!("must be within 1..={}", MAX_FETCH_BATCHES),
            ));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(TributaryError::invalid_config(
                "max_concurrent_tasks",
                "must be positive",
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON document; missing fields take defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| TributaryError::ConfigParse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Build from `TRIBUTARY_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("TRIBUTARY_PROJECT") {
            config.project = v;
        }
        if let Some(v) = lookup("TRIBUTARY_LOGSTORE") {
            config.logstore = v;
        }
        if let Some(v) = lookup("TRIBUTARY_CONSUMER_GROUP") {
            config.consumer_group = v;
        }
        if let Some(v) = lookup("TRIBUTARY_CONSUMER_NAME") {
            config.consumer_name = v;
        }
        if let Some(v) = lookup("TRIBUTARY_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(parse_number("poll_interval", &v)?);
        }
        if let Some(v) = lookup("TRIBUTARY_HEARTBEAT_INTERVAL_MS") {
            config.heartbeat_interval =
                Duration::from_millis(parse_number("heartbeat_interval", &v)?);
        }
        if let Some(v) = lookup("TRIBUTARY_GROUP_TIMEOUT_MS") {
            config.group_timeout = Duration::from_millis(parse_number("group_timeout", &v)?);
        }
        if let Some(v) = lookup("TRIBUTARY_CURSOR_POSITION") {
            config.cursor_position = CursorPosition::parse(&v)?;
        }
        if let Some(v) = lookup("TRIBUTARY_MAX_FETCH_BATCHES") {
            config.max_fetch_batches = parse_number("max_fetch_batches", &v)?;
        }
        if let Some(v) = lookup("TRIBUTARY_MAX_CONCURRENT_TASKS") {
            config.max_concurrent_tasks = parse_number("max_concurrent_tasks", &v)?;
        }
        if let Some(v) = lookup("TRIBUTARY_CHECKPOINT_INTERVAL_MS") {
            config.checkpoint_interval =
                Duration::from_millis(parse_number("checkpoint_interval", &v)?);
        }
        if let Some(v) = lookup("TRIBUTARY_IN_ORDER") {
            config.in_order = matches!(v.trim(), "1" | "true" | "yes");
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| TributaryError::invalid_config(field, format!("not a number: {:?}", value)))
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
