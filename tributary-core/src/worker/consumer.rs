//! Consumer worker pool
//!
//! The orchestrator loop. Every tick it reads the owned shards from the
//! heartbeat monitor, dispatches a task for each owned shard whose
//! previous task has finished, retires workers of shards it no longer
//! owns, and then waits out the rest of the poll interval.
//!
//! A shard whose task runs longer than one interval is simply skipped
//! until it finishes; nothing is queued for it.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::pool::ShardPool;
use crate::config::ConsumerConfig;
use crate::coordinator::{CoordinationClient, HeartbeatMonitor};
use crate::error::{Result, TributaryError};
use crate::metrics::ConsumerMetrics;
use crate::processor::RecordProcessor;
use crate::record::ShardId;
use crate::runtime::ShutdownSignal;

/// Worker pool consuming the shards assigned to this process
pub struct ConsumerWorker {
    config: Arc<ConsumerConfig>,
    client: Arc<dyn CoordinationClient>,
    processor: Arc<dyn RecordProcessor>,
    heartbeat: Arc<HeartbeatMonitor>,
    metrics: Arc<ConsumerMetrics>,
    shutdown: ShutdownSignal,
    started: AtomicBool,
    /// Set once the loop has retired every worker
    drained: watch::Sender<bool>,
    /// Shards with a worker, published after every tick
    table: watch::Sender<BTreeSet<ShardId>>,
}

impl ConsumerWorker {
    /// Validate the config and create the consumer group
    pub async fn new<C, P>(config: ConsumerConfig, client: C, processor: P) -> Result<Self>
    where
        C: CoordinationClient,
        P: RecordProcessor,
    {
        Self::with_shared(config, Arc::new(client), Arc::new(processor)).await
    }

    /// Same as [`new`](Self::new) for already shared client and processor
    pub async fn with_shared(
        config: ConsumerConfig,
        client: Arc<dyn CoordinationClient>,
        processor: Arc<dyn RecordProcessor>,
    ) -> Result<Self> {
        config.validate()?;

        client
            .create_consumer_group(config.group_timeout, config.in_order)
            .await
            .map_err(|e| TributaryError::ConsumerGroupFailed {
                group: config.consumer_group.clone(),
                reason: e.to_string(),
            })?;

        let metrics = Arc::new(ConsumerMetrics::new());
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            client.clone(),
            config.consumer_name.clone(),
            config.heartbeat_interval,
            metrics.clone(),
        ));
        let (drained, _) = watch::channel(false);
        let (table, _) = watch::channel(BTreeSet::new());

        Ok(Self {
            config: Arc::new(config),
            client,
            processor,
            heartbeat,
            metrics,
            shutdown: ShutdownSignal::new(),
            started: AtomicBool::new(false),
            drained,
            table,
        })
    }

    /// Member name of this consumer
    pub fn consumer_name(&self) -> &str {
        &self.config.consumer_name
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Metrics of this pool
    pub fn metrics(&self) -> Arc<ConsumerMetrics> {
        self.metrics.clone()
    }

    /// Heartbeat monitor feeding this pool
    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.heartbeat
    }

    /// Shards that had a worker at the end of the last tick
    pub fn active_shards(&self) -> BTreeSet<ShardId> {
        self.table.borrow().clone()
    }

    /// Whether shutdown has been requested
    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Run the pool until Ctrl-C, SIGTERM or [`stop`](Self::stop), then drain
    pub async fn start(&self) -> Result<()> {
        let run = self.run();
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => return result,
            () = stop_signal() => {}
        }

        info!(consumer = %self.config.consumer_name, "Received stop signal, stopping consumer worker");
        let (result, ()) = tokio::join!(run, self.stop());
        result
    }

    /// The orchestrator loop; returns once every worker has retired
    ///
    /// Fails with [`TributaryError::AlreadyRunning`] if called twice and
    /// with [`TributaryError::ShutdownInProgress`] once stop was requested.
    pub async fn run(&self) -> Result<()> {
        if self.shutdown.is_triggered() {
            return Err(TributaryError::ShutdownInProgress);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TributaryError::AlreadyRunning {
                consumer: self.config.consumer_name.clone(),
            });
        }

        info!(
            consumer = %self.config.consumer_name,
            group = %self.config.consumer_group,
            project = %self.config.project,
            logstore = %self.config.logstore,
            "Consumer worker started"
        );

        let heartbeat_task = tokio::spawn(self.heartbeat.clone().run());
        let mut pool = ShardPool::new(
            self.config.clone(),
            self.client.clone(),
            self.processor.clone(),
            self.metrics.clone(),
        );

        while !self.shutdown.is_triggered() {
            let tick = Instant::now();
            pool.apply_completions();

            let owned = self.heartbeat.owned_shards();
            for shard in &owned {
                if self.shutdown.is_triggered() {
                    break;
                }
                pool.dispatch(*shard);
            }

            pool.retire_unowned(&owned, |shard| {
                self.heartbeat.remove_shard(shard);
            });
            let claimed = pool.shard_ids();
            self.heartbeat.release_unclaimed(&claimed);
            self.table.send_replace(claimed);

            pool.wait_until(tick + self.config.poll_interval, &self.shutdown)
                .await;
        }

        info!(
            consumer = %self.config.consumer_name,
            workers = pool.len(),
            "Consumer worker retiring all shard workers"
        );
        pool.retire_all(|shard| {
            self.heartbeat.remove_shard(shard);
        })
        .await;
        self.table.send_replace(BTreeSet::new());

        self.heartbeat.stop();
        if let Err(e) = heartbeat_task.await {
            warn!(error = %e, "Heartbeat task ended abnormally");
        }

        self.drained.send_replace(true);
        info!(consumer = %self.config.consumer_name, "Consumer worker stopped");
        Ok(())
    }

    /// Stop the pool and wait until every shard worker has retired
    ///
    /// Returns immediately if the loop was never started.
    pub async fn stop(&self) {
        info!(consumer = %self.config.consumer_name, "Stopping consumer worker");
        self.heartbeat.stop();
        self.shutdown.trigger();

        if !self.started.load(Ordering::SeqCst) {
            return;
        }

        let mut drained = self.drained.subscribe();
        loop {
            let done = *drained.borrow_and_update();
            if done || drained.changed().await.is_err() {
                break;
            }
        }
    }
}

/// Resolve on Ctrl-C or, on unix, SIGTERM
async fn stop_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
