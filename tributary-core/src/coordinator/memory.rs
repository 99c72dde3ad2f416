//! In-process coordination service
//!
//! A complete, single-process implementation of the coordination
//! boundary: append-only shard logs, consumer-group membership driven
//! by heartbeats, deterministic shard assignment, and checkpoints.
//! Cursors are record offsets rendered as decimal strings.
//!
//! Ownership only changes hands once the previous owner stops reporting
//! a shard (or expires), so a shard is never assigned to two consumers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::client::CoordinationClient;
use crate::config::CursorPosition;
use crate::error::{Result, TributaryError};
use crate::record::{Cursor, Record, RecordBatch, ShardId};

/// Membership record for one consumer
#[derive(Debug, Clone)]
struct Member {
    last_heartbeat: Instant,
    held: BTreeSet<ShardId>,
}

/// State of one consumer group
#[derive(Debug)]
struct GroupState {
    timeout: Duration,
    in_order: bool,
    members: BTreeMap<String, Member>,
    pinned: BTreeMap<String, BTreeSet<ShardId>>,
    owners: HashMap<ShardId, String>,
    checkpoints: HashMap<ShardId, Cursor>,
}

impl GroupState {
    fn new(timeout: Duration, in_order: bool) -> Self {
        Self {
            timeout,
            in_order,
            members: BTreeMap::new(),
            pinned: BTreeMap::new(),
            owners: HashMap::new(),
            checkpoints: HashMap::new(),
        }
    }

    /// Drop members whose last heartbeat is older than the group timeout
    fn expire(&mut self, now: Instant) {
        let timeout = self.timeout;
        let expired: Vec<String> = self
            .members
            .iter()
            .filter(|(_, m)| now.duration_since(m.last_heartbeat) > timeout)
            .map(|(name, _)| name.clone())
            .collect();

        for name in expired {
            warn!(consumer = %name, "Consumer expired, releasing its shards");
            self.members.remove(&name);
            self.owners.retain(|_, owner| *owner != name);
        }
    }

    /// Target owner per shard: pinned shards first, the rest round-robin
    /// over unpinned live members sorted by name
    fn target_assignment(&self, shards: &[ShardId]) -> HashMap<ShardId, String> {
        let mut targets = HashMap::new();

        for (name, pinned) in &self.pinned {
            if !self.members.contains_key(name) {
                continue;
            }
            for shard in pinned {
                if shards.contains(shard) {
                    targets.insert(*shard, name.clone());
                }
            }
        }

        let dealers: Vec<&String> = self
            .members
            .keys()
            .filter(|name| !self.pinned.contains_key(*name))
            .collect();
        if dealers.is_empty() {
            return targets;
        }

        let free = shards.iter().filter(|s| !self.pinned_anywhere(**s));
        for (idx, shard) in free.enumerate() {
            targets.insert(*shard, dealers[idx % dealers.len()].clone());
        }
        targets
    }

    fn pinned_anywhere(&self, shard: ShardId) -> bool {
        self.pinned.iter().any(|(name, pinned)| {
            self.members.contains_key(name) && pinned.contains(&shard)
        })
    }
}

#[derive(Debug, Default)]
struct ServiceState {
    shards: BTreeMap<ShardId, Vec<Record>>,
    groups: HashMap<String, GroupState>,
}

impl ServiceState {
    fn shard(&self, shard: ShardId) -> Result<&Vec<Record>> {
        self.shards.get(&shard).ok_or_else(|| TributaryError::FetchFailed {
            shard,
            reason: "no such shard".into(),
        })
    }

    fn heartbeat(&mut self, group: &str, consumer: &str, held: &[ShardId]) -> Result<Vec<ShardId>> {
        let shard_ids: Vec<ShardId> = self.shards.keys().copied().collect();
        let state = self.groups.get_mut(group).ok_or_else(|| TributaryError::HeartbeatFailed {
            consumer: consumer.to_owned(),
            reason: format!("consumer group {} does not exist", group),
        })?;

        let now = Instant::now();
        let held: BTreeSet<ShardId> = held.iter().copied().collect();
        if !state.members.contains_key(consumer) {
            info!(group, consumer, "Consumer joined group");
        }
        state.members.insert(
            consumer.to_owned(),
            Member {
                last_heartbeat: now,
                held: held.clone(),
            },
        );
        state.expire(now);

        let targets = state.target_assignment(&shard_ids);

        // Release shards this consumer owns but no longer reports and is
        // no longer meant to hold.
        state.owners.retain(|shard, owner| {
            owner.as_str() != consumer
                || held.contains(shard)
                || targets.get(shard).map(String::as_str) == Some(consumer)
        });

        let mut assigned = Vec::new();
        for shard in &shard_ids {
            if targets.get(shard).map(String::as_str) != Some(consumer) {
                continue;
            }
            match state.owners.get(shard) {
                Some(owner) if owner != consumer => {
                    debug!(shard, owner = %owner, waiting = consumer, "Shard awaiting release");
                }
                _ => {
                    state.owners.insert(*shard, consumer.to_owned());
                    assigned.push(*shard);
                }
            }
        }
        Ok(assigned)
    }
}

/// Shared in-process coordination service
///
/// Cheap to clone; every clone and every [`InMemoryClient`] it hands
/// out see the same state.
#[derive(Clone, Default)]
pub struct InMemoryCoordinator {
    state: Arc<Mutex<ServiceState>>,
}

impl InMemoryCoordinator {
    /// Create a stream with shards `0..shard_count`
    pub fn new(shard_count: u32) -> Self {
        let shards = (0..shard_count).map(|id| (id, Vec::new())).collect();
        Self {
            state: Arc::new(Mutex::new(ServiceState {
                shards,
                groups: HashMap::new(),
            })),
        }
    }

    /// Client bound to one consumer of one group
    pub fn client(&self, group: impl Into<String>, consumer: impl Into<String>) -> InMemoryClient {
        InMemoryClient {
            state: self.state.clone(),
            group: group.into(),
            consumer: consumer.into(),
        }
    }

    /// Add a shard to the stream, returning false if it already exists
    pub fn add_shard(&self, shard: ShardId) -> bool {
        let mut state = self.state.lock();
        if state.shards.contains_key(&shard) {
            return false;
        }
        state.shards.insert(shard, Vec::new());
        true
    }

    /// All shard ids of the stream
    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.state.lock().shards.keys().copied().collect()
    }

    /// Append a record, returning its offset
    pub fn append(&self, shard: ShardId, data: impl Into<Bytes>) -> Result<u64> {
        self.append_record(shard, Record::new(data))
    }

    /// Append a pre-built record, returning its offset
    pub fn append_record(&self, shard: ShardId, record: Record) -> Result<u64> {
        let mut state = self.state.lock();
        let log = state.shards.get_mut(&shard).ok_or_else(|| TributaryError::Internal {
            message: format!("append to unknown shard {}", shard),
        })?;
        log.push(record);
        Ok(log.len() as u64 - 1)
    }

    /// Number of records in a shard
    pub fn shard_len(&self, shard: ShardId) -> usize {
        self.state.lock().shards.get(&shard).map_or(0, Vec::len)
    }

    /// Stored checkpoint of a group for a shard
    pub fn checkpoint(&self, group: &str, shard: ShardId) -> Option<Cursor> {
        let state = self.state.lock();
        state.groups.get(group)?.checkpoints.get(&shard).cloned()
    }

    /// Current owner of a shard within a group
    pub fn owner(&self, group: &str, shard: ShardId) -> Option<String> {
        let state = self.state.lock();
        state.groups.get(group)?.owners.get(&shard).cloned()
    }

    /// Whether the group was created with in-order consumption
    pub fn in_order(&self, group: &str) -> Option<bool> {
        self.state.lock().groups.get(group).map(|g| g.in_order)
    }

    /// Shards the consumer reported holding on its last heartbeat
    pub fn reported_by(&self, group: &str, consumer: &str) -> Option<BTreeSet<ShardId>> {
        let state = self.state.lock();
        state.groups.get(group)?.members.get(consumer).map(|m| m.held.clone())
    }

    /// Restrict a consumer to exactly `shards`, overriding balancing
    pub fn pin(&self, group: &str, consumer: &str, shards: impl IntoIterator<Item = ShardId>) {
        let mut state = self.state.lock();
        if let Some(g) = state.groups.get_mut(group) {
            g.pinned.insert(consumer.to_owned(), shards.into_iter().collect());
        }
    }

    /// Return a pinned consumer to balanced assignment
    pub fn unpin(&self, group: &str, consumer: &str) {
        let mut state = self.state.lock();
        if let Some(g) = state.groups.get_mut(group) {
            g.pinned.remove(consumer);
        }
    }
}

/// [`CoordinationClient`] backed by an [`InMemoryCoordinator`]
#[derive(Clone)]
pub struct InMemoryClient {
    state: Arc<Mutex<ServiceState>>,
    group: String,
    consumer: String,
}

impl InMemoryClient {
    /// Consumer name this client heartbeats as
    pub fn consumer(&self) -> &str {
        &self.consumer
    }
}

fn parse_offset(shard: ShardId, cursor: &Cursor) -> Result<usize> {
    cursor.as_str().parse().map_err(|_| TributaryError::FetchFailed {
        shard,
        reason: format!("malformed cursor {:?}", cursor.as_str()),
    })
}

#[async_trait]
impl CoordinationClient for InMemoryClient {
    async fn create_consumer_group(&self, timeout: Duration, in_order: bool) -> Result<()> {
        let mut state = self.state.lock();
        if !state.groups.contains_key(&self.group) {
            info!(group = %self.group, ?timeout, in_order, "Consumer group created");
            state
                .groups
                .insert(self.group.clone(), GroupState::new(timeout, in_order));
        }
        Ok(())
    }

    async fn heartbeat(&self, held: &[ShardId]) -> Result<Vec<ShardId>> {
        self.state.lock().heartbeat(&self.group, &self.consumer, held)
    }

    async fn fetch_checkpoint(&self, shard: ShardId) -> Result<Option<Cursor>> {
        let state = self.state.lock();
        let group = state.groups.get(&self.group).ok_or_else(|| TributaryError::CheckpointFailed {
            shard,
            reason: format!("consumer group {} does not exist", self.group),
        })?;
        Ok(group.checkpoints.get(&shard).cloned())
    }

    async fn resolve_cursor(&self, shard: ShardId, position: CursorPosition) -> Result<Cursor> {
        let state = self.state.lock();
        let log = state.shard(shard)?;
        let offset = match position {
            CursorPosition::Begin => 0,
            CursorPosition::End => log.len(),
            CursorPosition::Timestamp(secs) => {
                let at = DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| {
                    TributaryError::FetchFailed {
                        shard,
                        reason: format!("timestamp {} out of range", secs),
                    }
                })?;
                log.iter()
                    .position(|r| r.timestamp >= at)
                    .unwrap_or(log.len())
            }
        };
        Ok(Cursor::new(offset.to_string()))
    }

    async fn fetch(&self, shard: ShardId, cursor: &Cursor, max_batches: usize) -> Result<RecordBatch> {
        let offset = parse_offset(shard, cursor)?;
        let state = self.state.lock();
        let log = state.shard(shard)?;
        if offset > log.len() {
            return Err(TributaryError::FetchFailed {
                shard,
                reason: format!("cursor {} beyond end {}", offset, log.len()),
            });
        }

        let end = (offset + max_batches).min(log.len());
        Ok(RecordBatch {
            shard,
            cursor: cursor.clone(),
            next_cursor: Cursor::new(end.to_string()),
            records: log[offset..end].to_vec(),
        })
    }

    async fn commit_checkpoint(&self, shard: ShardId, cursor: &Cursor) -> Result<()> {
        parse_offset(shard, cursor).map_err(|e| TributaryError::CheckpointFailed {
            shard,
            reason: e.to_string(),
        })?;
        let mut state = self.state.lock();
        let group = state.groups.get_mut(&self.group).ok_or_else(|| TributaryError::CheckpointFailed {
            shard,
            reason: format!("consumer group {} does not exist", self.group),
        })?;
        group.checkpoints.insert(shard, cursor.clone());
        Ok(())
    }
}
