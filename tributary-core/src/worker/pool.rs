//! Shard worker table
//!
//! Owns the mapping from shard to [`ShardWorker`]. The table has a
//! single owner (the orchestrator loop); shard tasks never touch it and
//! report back through a completion channel instead.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::shard::{Dispatch, ShardContext, ShardWorker, TaskCompletion};
use crate::config::ConsumerConfig;
use crate::coordinator::CoordinationClient;
use crate::metrics::ConsumerMetrics;
use crate::processor::RecordProcessor;
use crate::record::ShardId;
use crate::runtime::ShutdownSignal;

/// Table of shard workers plus the channel their tasks report on
pub struct ShardPool {
    workers: HashMap<ShardId, ShardWorker>,
    ctx: Arc<ShardContext>,
    completions: mpsc::UnboundedReceiver<TaskCompletion>,
}

impl ShardPool {
    /// Create an empty pool
    pub fn new(
        config: Arc<ConsumerConfig>,
        client: Arc<dyn CoordinationClient>,
        processor: Arc<dyn RecordProcessor>,
        metrics: Arc<ConsumerMetrics>,
    ) -> Self {
        let (sender, completions) = mpsc::unbounded_channel();
        Self {
            workers: HashMap::new(),
            ctx: Arc::new(ShardContext::new(config, client, processor, metrics, sender)),
            completions,
        }
    }

    /// Number of workers in the table
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Shards that currently have a worker
    pub fn shard_ids(&self) -> BTreeSet<ShardId> {
        self.workers.keys().copied().collect()
    }

    /// Look up a worker
    pub fn worker(&self, shard: ShardId) -> Option<&ShardWorker> {
        self.workers.get(&shard)
    }

    /// Dispatch a task for `shard`, creating its worker on first sight
    pub fn dispatch(&mut self, shard: ShardId) -> Dispatch {
        let ctx = &self.ctx;
        let worker = self.workers.entry(shard).or_insert_with(|| {
            debug!(shard, "Creating shard worker");
            ShardWorker::new(shard, ctx.clone())
        });

        let outcome = worker.consume();
        if outcome == Dispatch::Busy {
            debug!(shard, "Previous task still running, skipping this tick");
        }
        self.update_gauge();
        outcome
    }

    /// Apply every completion already waiting in the channel
    pub fn apply_completions(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(completion) = self.completions.try_recv() {
            self.apply(completion);
            applied += 1;
        }
        applied
    }

    /// Apply completions as they arrive until `deadline` or shutdown
    pub async fn wait_until(&mut self, deadline: Instant, shutdown: &ShutdownSignal) {
        loop {
            tokio::select! {
                _ = shutdown.wait() => return,
                _ = sleep_until(deadline) => return,
                Some(completion) = self.completions.recv() => self.apply(completion),
            }
        }
    }

    /// Wait until no worker has a task running
    pub async fn settle(&mut self) {
        while self.workers.values().any(ShardWorker::is_in_flight) {
            match self.completions.recv().await {
                Some(completion) => self.apply(completion),
                None => return,
            }
        }
    }

    /// Retire workers whose shard is no longer owned
    ///
    /// Requests shutdown on every worker outside `owned` and removes the
    /// ones whose shutdown has completed, calling `on_retired` for each.
    /// Workers still finishing a task are revisited on the next call.
    pub fn retire_unowned<F>(&mut self, owned: &BTreeSet<ShardId>, mut on_retired: F) -> Vec<ShardId>
    where
        F: FnMut(ShardId),
    {
        let mut retired = Vec::new();
        for (shard, worker) in self.workers.iter_mut() {
            if !owned.contains(shard) && worker.request_shutdown() {
                info!(shard = *shard, "Shard no longer owned, shutting down its worker");
            }
            if worker.is_shutdown_complete() {
                retired.push(*shard);
            }
        }

        for shard in &retired {
            self.remove(*shard);
            on_retired(*shard);
        }
        self.update_gauge();
        retired
    }

    /// Shut down every worker, wait for all of them, and clear the table
    pub async fn retire_all<F>(&mut self, mut on_retired: F)
    where
        F: FnMut(ShardId),
    {
        for worker in self.workers.values_mut() {
            worker.request_shutdown();
        }

        while self.workers.values().any(|w| !w.is_shutdown_complete()) {
            match self.completions.recv().await {
                Some(completion) => self.apply(completion),
                None => break,
            }
        }

        let shards: Vec<ShardId> = self.workers.keys().copied().collect();
        for shard in shards {
            self.remove(shard);
            on_retired(shard);
        }
        self.update_gauge();
    }

    fn apply(&mut self, completion: TaskCompletion) {
        match self.workers.get_mut(&completion.shard) {
            Some(worker) => worker.complete(completion),
            None => warn!(shard = completion.shard, "Completion for unknown shard worker"),
        }
    }

    fn remove(&mut self, shard: ShardId) {
        if self.workers.remove(&shard).is_some() {
            self.ctx.metrics.retired_shards.inc();
            info!(shard, "Shard worker retired");
        }
    }

    fn update_gauge(&self) {
        self.ctx
            .metrics
            .active_shard_workers
            .set(self.workers.len() as i64);
    }
}
