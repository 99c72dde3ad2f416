//! Heartbeat monitor
//!
//! Periodically reports liveness to the coordination service and keeps
//! the locally cached set of shards this consumer owns.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::client::CoordinationClient;
use crate::error::Result;
use crate::metrics::ConsumerMetrics;
use crate::record::ShardId;
use crate::runtime::ShutdownSignal;

/// Shortest interval the heartbeat loop will tick at
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

/// Heartbeat loop plus owned-shard bookkeeping
///
/// Two sets are tracked: `held` is the assignment returned by the last
/// successful heartbeat, `reported` is what gets sent on the next one.
/// A shard that drops out of the assignment stays reported until the
/// worker pool confirms it retired via [`HeartbeatMonitor::remove_shard`].
pub struct HeartbeatMonitor {
    client: Arc<dyn CoordinationClient>,
    consumer: String,
    interval: Duration,
    held: RwLock<BTreeSet<ShardId>>,
    reported: RwLock<BTreeSet<ShardId>>,
    stop: ShutdownSignal,
    metrics: Arc<ConsumerMetrics>,
}

impl HeartbeatMonitor {
    /// Create a monitor; nothing is sent until [`run`](Self::run)
    ///
    /// `interval` is clamped to at least one millisecond.
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        consumer: impl Into<String>,
        interval: Duration,
        metrics: Arc<ConsumerMetrics>,
    ) -> Self {
        Self {
            client,
            consumer: consumer.into(),
            interval: interval.max(MIN_HEARTBEAT_INTERVAL),
            held: RwLock::new(BTreeSet::new()),
            reported: RwLock::new(BTreeSet::new()),
            stop: ShutdownSignal::new(),
            metrics,
        }
    }

    /// Heartbeat every interval until stopped; the first beat is immediate
    pub async fn run(self: Arc<Self>) {
        info!(consumer = %self.consumer, interval = ?self.interval, "Heartbeat started");

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.stop.wait() => break,
                _ = ticker.tick() => {
                    // Failures are logged inside; the cached set stays as it was.
                    let _ = self.beat().await;
                }
            }
        }

        info!(consumer = %self.consumer, "Heartbeat stopped");
    }

    /// Run a single heartbeat round trip and refresh the owned set
    pub async fn beat(&self) -> Result<BTreeSet<ShardId>> {
        let upload: Vec<ShardId> = {
            let held = self.held.read();
            let mut reported = self.reported.write();
            reported.extend(held.iter().copied());
            reported.iter().copied().collect()
        };

        let assigned: BTreeSet<ShardId> = match self.client.heartbeat(&upload).await {
            Ok(shards) => shards.into_iter().collect(),
            Err(e) => {
                self.metrics.heartbeat_errors.inc();
                warn!(consumer = %self.consumer, error = %e, "Heartbeat failed, keeping previous assignment");
                return Err(e);
            }
        };

        {
            let mut held = self.held.write();
            if *held != assigned {
                let added: Vec<ShardId> = assigned.difference(&held).copied().collect();
                let removed: Vec<ShardId> = held.difference(&assigned).copied().collect();
                info!(
                    consumer = %self.consumer,
                    ?added,
                    ?removed,
                    "Shard reassignment"
                );
                *held = assigned.clone();
            }
        }
        {
            // Checked under the lock so a retirement racing with stop is not undone.
            let mut reported = self.reported.write();
            if !self.stop.is_triggered() {
                reported.extend(assigned.iter().copied());
            }
        }
        self.metrics.owned_shards.set(assigned.len() as i64);

        debug!(consumer = %self.consumer, shards = ?assigned, "Heartbeat acknowledged");
        Ok(assigned)
    }

    /// Snapshot of the shards this consumer currently owns
    ///
    /// Empty once the monitor has been stopped.
    pub fn owned_shards(&self) -> BTreeSet<ShardId> {
        if self.stop.is_triggered() {
            return BTreeSet::new();
        }
        self.held.read().clone()
    }

    /// Shards sent with the next heartbeat (owned plus still retiring)
    pub fn reported_shards(&self) -> BTreeSet<ShardId> {
        self.reported.read().clone()
    }

    /// Stop reporting a shard whose worker has fully retired
    ///
    /// Returns false if the shard was not being reported.
    pub fn remove_shard(&self, shard: ShardId) -> bool {
        let removed = self.reported.write().remove(&shard);
        if removed {
            debug!(consumer = %self.consumer, shard, "Shard dropped from heartbeat");
        }
        removed
    }

    /// Stop reporting shards that are neither assigned nor in `claimed`
    ///
    /// `claimed` is the set of shards that still have a worker. A shard
    /// assigned and revoked again before any worker picked it up is
    /// released here; returns the released shards.
    pub fn release_unclaimed(&self, claimed: &BTreeSet<ShardId>) -> Vec<ShardId> {
        let held = self.held.read();
        let mut reported = self.reported.write();
        let released: Vec<ShardId> = reported
            .iter()
            .filter(|shard| !held.contains(*shard) && !claimed.contains(*shard))
            .copied()
            .collect();

        for shard in &released {
            reported.remove(shard);
        }
        if !released.is_empty() {
            debug!(consumer = %self.consumer, shards = ?released, "Released shards that never had a worker");
        }
        released
    }

    /// Halt the heartbeat loop; the monitor cannot be restarted
    pub fn stop(&self) {
        self.stop.trigger();
    }

    /// Whether [`stop`](Self::stop) has been called
    pub fn is_stopped(&self) -> bool {
        self.stop.is_triggered()
    }
}
