//! Shared test doubles: a scriptable coordination client and a
//! recording processor.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tributary_core::{
    CoordinationClient, ConsumerConfig, Cursor, CursorPosition, ProcessError, Record, RecordBatch,
    RecordProcessor, Result, ShardId, TributaryError,
};

#[derive(Default)]
struct ScriptState {
    assigned: Vec<ShardId>,
    uploads: Vec<Vec<ShardId>>,
    fail_create: bool,
    group_created: u32,
    fail_heartbeat: bool,
    fetch_delay: HashMap<ShardId, Duration>,
    fail_fetch: HashSet<ShardId>,
    fetch_cursors: HashMap<ShardId, Vec<String>>,
    active: HashMap<ShardId, u32>,
    max_active: HashMap<ShardId, u32>,
    active_total: u32,
    max_active_total: u32,
    records_per_fetch: usize,
    stored: HashMap<ShardId, Cursor>,
    commits: Vec<(ShardId, Cursor)>,
}

/// Coordination client whose answers are set by the test
pub struct ScriptedClient {
    state: Mutex<ScriptState>,
}

impl ScriptedClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ScriptState {
                records_per_fetch: 2,
                ..Default::default()
            }),
        })
    }

    pub fn set_assigned(&self, shards: &[ShardId]) {
        self.state.lock().assigned = shards.to_vec();
    }

    pub fn set_records_per_fetch(&self, n: usize) {
        self.state.lock().records_per_fetch = n;
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.state.lock().fail_create = fail;
    }

    pub fn set_fail_heartbeat(&self, fail: bool) {
        self.state.lock().fail_heartbeat = fail;
    }

    pub fn set_fetch_delay(&self, shard: ShardId, delay: Duration) {
        self.state.lock().fetch_delay.insert(shard, delay);
    }

    pub fn set_fail_fetch(&self, shard: ShardId, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.fail_fetch.insert(shard);
        } else {
            state.fail_fetch.remove(&shard);
        }
    }

    pub fn store_checkpoint(&self, shard: ShardId, cursor: &str) {
        self.state.lock().stored.insert(shard, Cursor::from(cursor));
    }

    pub fn group_created(&self) -> u32 {
        self.state.lock().group_created
    }

    pub fn heartbeat_count(&self) -> usize {
        self.state.lock().uploads.len()
    }

    /// Shards reported on the most recent heartbeat
    pub fn last_upload(&self) -> Option<BTreeSet<ShardId>> {
        self.state
            .lock()
            .uploads
            .last()
            .map(|u| u.iter().copied().collect())
    }

    pub fn fetch_count(&self, shard: ShardId) -> usize {
        self.state
            .lock()
            .fetch_cursors
            .get(&shard)
            .map_or(0, Vec::len)
    }

    /// Cursors each fetch of `shard` started from, in order
    pub fn fetch_cursors(&self, shard: ShardId) -> Vec<String> {
        self.state
            .lock()
            .fetch_cursors
            .get(&shard)
            .cloned()
            .unwrap_or_default()
    }

    /// Highest number of simultaneous fetches seen for one shard
    pub fn max_concurrent(&self, shard: ShardId) -> u32 {
        self.state.lock().max_active.get(&shard).copied().unwrap_or(0)
    }

    /// Highest number of simultaneous fetches seen across all shards
    pub fn max_concurrent_total(&self) -> u32 {
        self.state.lock().max_active_total
    }

    pub fn committed(&self, shard: ShardId) -> Option<String> {
        self.state
            .lock()
            .stored
            .get(&shard)
            .map(|c| c.as_str().to_owned())
    }

    pub fn commit_count(&self, shard: ShardId) -> usize {
        self.state
            .lock()
            .commits
            .iter()
            .filter(|(s, _)| *s == shard)
            .count()
    }
}

#[async_trait]
impl CoordinationClient for ScriptedClient {
    async fn create_consumer_group(&self, _timeout: Duration, _in_order: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_create {
            return Err(TributaryError::ConnectionFailed {
                endpoint: "scripted".into(),
                reason: "refused".into(),
            });
        }
        state.group_created += 1;
        Ok(())
    }

    async fn heartbeat(&self, held: &[ShardId]) -> Result<Vec<ShardId>> {
        let mut state = self.state.lock();
        state.uploads.push(held.to_vec());
        if state.fail_heartbeat {
            return Err(TributaryError::HeartbeatFailed {
                consumer: "scripted".into(),
                reason: "service unavailable".into(),
            });
        }
        Ok(state.assigned.clone())
    }

    async fn fetch_checkpoint(&self, shard: ShardId) -> Result<Option<Cursor>> {
        Ok(self.state.lock().stored.get(&shard).cloned())
    }

    async fn resolve_cursor(&self, _shard: ShardId, position: CursorPosition) -> Result<Cursor> {
        let offset = match position {
            CursorPosition::Begin => 0,
            CursorPosition::End => 1000,
            CursorPosition::Timestamp(secs) => secs,
        };
        Ok(Cursor::new(offset.to_string()))
    }

    async fn fetch(&self, shard: ShardId, cursor: &Cursor, max_batches: usize) -> Result<RecordBatch> {
        let delay = {
            let mut state = self.state.lock();
            state
                .fetch_cursors
                .entry(shard)
                .or_default()
                .push(cursor.as_str().to_owned());
            if state.fail_fetch.contains(&shard) {
                return Err(TributaryError::FetchFailed {
                    shard,
                    reason: "injected failure".into(),
                });
            }

            let active = {
                let active = state.active.entry(shard).or_default();
                *active += 1;
                *active
            };
            let max = state.max_active.entry(shard).or_default();
            *max = (*max).max(active);
            state.active_total += 1;
            state.max_active_total = state.max_active_total.max(state.active_total);

            state.fetch_delay.get(&shard).copied()
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if let Some(active) = state.active.get_mut(&shard) {
            *active -= 1;
        }
        state.active_total -= 1;

        let offset: i64 = cursor.as_str().parse().unwrap_or(0);
        let n = state.records_per_fetch.min(max_batches) as i64;
        let records = (offset..offset + n)
            .map(|i| Record::new(format!("{}-{}", shard, i)))
            .collect();
        Ok(RecordBatch {
            shard,
            cursor: cursor.clone(),
            next_cursor: Cursor::new((offset + n).to_string()),
            records,
        })
    }

    async fn commit_checkpoint(&self, shard: ShardId, cursor: &Cursor) -> Result<()> {
        let mut state = self.state.lock();
        state.stored.insert(shard, cursor.clone());
        state.commits.push((shard, cursor.clone()));
        Ok(())
    }
}

/// Processor that records what it saw and fails or panics on demand
#[derive(Default)]
pub struct RecordingProcessor {
    seen: Mutex<HashMap<ShardId, Vec<String>>>,
    failures_left: Mutex<HashMap<ShardId, u32>>,
    panics_left: Mutex<HashMap<ShardId, u32>>,
}

impl RecordingProcessor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `times` batches of `shard`
    pub fn fail_next(&self, shard: ShardId, times: u32) {
        self.failures_left.lock().insert(shard, times);
    }

    /// Panic on the next `times` batches of `shard`
    pub fn panic_next(&self, shard: ShardId, times: u32) {
        self.panics_left.lock().insert(shard, times);
    }

    /// Payloads processed successfully for `shard`
    pub fn seen(&self, shard: ShardId) -> Vec<String> {
        self.seen.lock().get(&shard).cloned().unwrap_or_default()
    }

    fn take(counter: &Mutex<HashMap<ShardId, u32>>, shard: ShardId) -> bool {
        let mut counter = counter.lock();
        match counter.get_mut(&shard) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

impl RecordProcessor for RecordingProcessor {
    fn process(&self, shard: ShardId, batch: &RecordBatch) -> std::result::Result<(), ProcessError> {
        if Self::take(&self.panics_left, shard) {
            panic!("processor panic on shard {}", shard);
        }
        if Self::take(&self.failures_left, shard) {
            return Err(format!("rejected batch at {}", batch.cursor).into());
        }

        let payloads = batch
            .records
            .iter()
            .map(|r| String::from_utf8_lossy(&r.data).into_owned());
        self.seen.lock().entry(shard).or_default().extend(payloads);
        Ok(())
    }
}

/// Config with short cadences for tests
pub fn fast_config(name: &str) -> ConsumerConfig {
    ConsumerConfig {
        consumer_name: name.into(),
        poll_interval: Duration::from_millis(50),
        heartbeat_interval: Duration::from_millis(20),
        group_timeout: Duration::from_millis(500),
        ..ConsumerConfig::new("test-project", "test-logstore", "test-group")
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
