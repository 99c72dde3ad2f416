//! Shard worker
//!
//! One worker per owned shard. Each worker runs at most one task at a
//! time: the shard's progress (cursor and commit state) is moved into
//! the task and handed back in its completion, so a second dispatch
//! while a task is running has nothing to work with and is refused.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ConsumerConfig;
use crate::coordinator::CoordinationClient;
use crate::error::{Result, TributaryError};
use crate::metrics::ConsumerMetrics;
use crate::processor::RecordProcessor;
use crate::record::{Cursor, RecordBatch, ShardId};

/// Lifecycle phase of a shard worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    /// Waiting for the next dispatch
    Idle,
    /// Fetch/process/checkpoint task running
    Consuming,
    /// Final checkpoint flush running after a shutdown request
    Flushing,
    /// Shut down; no further tasks will run
    Retired,
}

/// Outcome of asking a worker to consume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A new task was spawned
    Started,
    /// The previous task has not completed yet
    Busy,
    /// Shutdown was requested; the worker takes no new work
    ShuttingDown,
}

/// What a finished task was doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskKind {
    Consume,
    Flush,
}

/// Consumption position of one shard, owned by whichever side holds it
#[derive(Debug, Default)]
pub(crate) struct ShardProgress {
    /// Next position to fetch from; `None` until first initialised
    cursor: Option<Cursor>,
    /// Cursor advanced past the last committed checkpoint
    dirty: bool,
    last_commit: Option<Instant>,
}

impl ShardProgress {
    fn checkpoint_due(&self, interval: Duration) -> bool {
        self.dirty
            && (interval.is_zero() || self.last_commit.map_or(true, |t| t.elapsed() >= interval))
    }
}

/// Message a task sends back to the worker table when it finishes
#[derive(Debug)]
pub(crate) struct TaskCompletion {
    pub shard: ShardId,
    pub kind: TaskKind,
    progress: ShardProgress,
}

/// Everything a shard task needs, shared by all workers of one pool
pub(crate) struct ShardContext {
    pub config: Arc<ConsumerConfig>,
    pub client: Arc<dyn CoordinationClient>,
    pub processor: Arc<dyn RecordProcessor>,
    pub metrics: Arc<ConsumerMetrics>,
    permits: Semaphore,
    completions: mpsc::UnboundedSender<TaskCompletion>,
}

impl ShardContext {
    pub fn new(
        config: Arc<ConsumerConfig>,
        client: Arc<dyn CoordinationClient>,
        processor: Arc<dyn RecordProcessor>,
        metrics: Arc<ConsumerMetrics>,
        completions: mpsc::UnboundedSender<TaskCompletion>,
    ) -> Self {
        Self {
            permits: Semaphore::new(config.max_concurrent_tasks),
            config,
            client,
            processor,
            metrics,
            completions,
        }
    }

    /// Run one task to completion and report back
    ///
    /// The work runs on its own task so that a panic inside the client
    /// still produces a completion; the shard then restarts from its
    /// stored checkpoint.
    async fn run_task(self: Arc<Self>, shard: ShardId, kind: TaskKind, progress: ShardProgress) {
        let started = Instant::now();
        let ctx = self.clone();
        let work = tokio::spawn(async move {
            match kind {
                TaskKind::Consume => ctx.consume(shard, progress).await,
                TaskKind::Flush => ctx.flush(shard, progress).await,
            }
        });

        let progress = match work.await {
            Ok(progress) => progress,
            Err(e) => {
                error!(shard, error = %e, "Shard task aborted, resuming from stored checkpoint");
                ShardProgress::default()
            }
        };
        self.metrics
            .task_duration
            .observe(started.elapsed().as_secs_f64());

        // A closed channel means the worker table is gone; nothing to report to.
        let _ = self.completions.send(TaskCompletion {
            shard,
            kind,
            progress,
        });
    }

    async fn consume(&self, shard: ShardId, mut progress: ShardProgress) -> ShardProgress {
        // The semaphore is never closed, so acquisition only fails if it were.
        let _permit = self.permits.acquire().await.ok();

        match self.consume_once(shard, &mut progress).await {
            Ok(0) => debug!(shard, "No new records"),
            Ok(records) => debug!(shard, records, cursor = ?progress.cursor, "Batch processed"),
            Err(e) => {
                match &e {
                    TributaryError::ProcessorFailed { .. } => self.metrics.processor_errors.inc(),
                    TributaryError::CheckpointFailed { .. } => {
                        self.metrics.checkpoint_errors.inc()
                    }
                    _ => self.metrics.fetch_errors.inc(),
                }
                warn!(shard, error = %e, "Shard task failed, retrying on next dispatch");
            }
        }
        progress
    }

    async fn consume_once(&self, shard: ShardId, progress: &mut ShardProgress) -> Result<usize> {
        let cursor = match &progress.cursor {
            Some(cursor) => cursor.clone(),
            None => {
                let cursor = self.initial_cursor(shard).await?;
                progress.cursor = Some(cursor.clone());
                cursor
            }
        };

        let batch = self
            .client
            .fetch(shard, &cursor, self.config.max_fetch_batches)
            .await?;
        let records = batch.len();
        let next_cursor = batch.next_cursor.clone();

        if records > 0 {
            self.metrics.fetched_batches.inc();
            // On failure the cursor stays put and the batch is fetched again.
            self.process(shard, batch).await?;
            self.metrics.processed_records.inc_by(records as u64);
        }

        if next_cursor != cursor {
            progress.cursor = Some(next_cursor);
            progress.dirty = true;
        }

        if progress.checkpoint_due(self.config.checkpoint_interval) {
            self.commit(shard, progress).await?;
        }
        Ok(records)
    }

    async fn initial_cursor(&self, shard: ShardId) -> Result<Cursor> {
        if let Some(cursor) = self.client.fetch_checkpoint(shard).await? {
            info!(shard, %cursor, "Resuming from checkpoint");
            return Ok(cursor);
        }

        let position = self.config.cursor_position;
        let cursor = self.client.resolve_cursor(shard, position).await?;
        info!(shard, %cursor, ?position, "No checkpoint, starting from configured position");
        Ok(cursor)
    }

    async fn process(&self, shard: ShardId, batch: RecordBatch) -> Result<()> {
        let processor = self.processor.clone();
        match tokio::task::spawn_blocking(move || processor.process(shard, &batch)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TributaryError::ProcessorFailed {
                shard,
                message: e.to_string(),
            }),
            Err(e) => Err(TributaryError::ProcessorFailed {
                shard,
                message: format!("processor panicked: {}", e),
            }),
        }
    }

    async fn commit(&self, shard: ShardId, progress: &mut ShardProgress) -> Result<()> {
        let Some(cursor) = progress.cursor.as_ref() else {
            return Ok(());
        };
        self.client.commit_checkpoint(shard, cursor).await?;
        progress.dirty = false;
        progress.last_commit = Some(Instant::now());
        self.metrics.checkpoints_committed.inc();
        debug!(shard, %cursor, "Checkpoint committed");
        Ok(())
    }

    async fn flush(&self, shard: ShardId, mut progress: ShardProgress) -> ShardProgress {
        match self.commit(shard, &mut progress).await {
            Ok(()) => info!(shard, cursor = ?progress.cursor, "Final checkpoint committed"),
            Err(e) => {
                self.metrics.checkpoint_errors.inc();
                warn!(shard, error = %e, "Final checkpoint failed");
            }
        }
        progress
    }
}

/// Consumer of a single shard
pub struct ShardWorker {
    shard: ShardId,
    phase: WorkerPhase,
    /// Present only while idle; moved into the running task otherwise
    progress: Option<ShardProgress>,
    shutdown_requested: bool,
    dispatched: u64,
    ctx: Arc<ShardContext>,
}

impl ShardWorker {
    pub(crate) fn new(shard: ShardId, ctx: Arc<ShardContext>) -> Self {
        Self {
            shard,
            phase: WorkerPhase::Idle,
            progress: Some(ShardProgress::default()),
            shutdown_requested: false,
            dispatched: 0,
            ctx,
        }
    }

    /// Shard this worker consumes
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> WorkerPhase {
        self.phase
    }

    /// Number of consumption tasks started so far
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Whether a task (consume or final flush) is running
    pub fn is_in_flight(&self) -> bool {
        matches!(self.phase, WorkerPhase::Consuming | WorkerPhase::Flushing)
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// True once no further tasks will run and state has been flushed
    pub fn is_shutdown_complete(&self) -> bool {
        self.phase == WorkerPhase::Retired
    }

    /// Start a fetch/process/checkpoint task unless one is already running
    pub fn consume(&mut self) -> Dispatch {
        if self.shutdown_requested {
            return Dispatch::ShuttingDown;
        }
        if self.phase != WorkerPhase::Idle {
            return Dispatch::Busy;
        }
        let Some(progress) = self.progress.take() else {
            return Dispatch::Busy;
        };

        self.phase = WorkerPhase::Consuming;
        self.dispatched += 1;
        self.ctx.metrics.dispatched_tasks.inc();
        self.spawn(TaskKind::Consume, progress);
        Dispatch::Started
    }

    /// Ask the worker to shut down
    ///
    /// Returns true on the first call only. An idle worker flushes its
    /// checkpoint (or retires at once when there is nothing to flush);
    /// a busy worker finishes its running task first.
    pub fn request_shutdown(&mut self) -> bool {
        if self.shutdown_requested {
            return false;
        }
        self.shutdown_requested = true;

        if self.phase == WorkerPhase::Idle {
            let progress = self.progress.take().unwrap_or_default();
            self.begin_flush(progress);
        }
        true
    }

    /// Take back the progress of a finished task
    pub(crate) fn complete(&mut self, completion: TaskCompletion) {
        self.ctx.metrics.in_flight_tasks.dec();

        match (completion.kind, self.phase) {
            (TaskKind::Consume, WorkerPhase::Consuming) => {
                if self.shutdown_requested {
                    self.begin_flush(completion.progress);
                } else {
                    self.progress = Some(completion.progress);
                    self.phase = WorkerPhase::Idle;
                }
            }
            (TaskKind::Flush, WorkerPhase::Flushing) => {
                self.phase = WorkerPhase::Retired;
            }
            (kind, phase) => {
                warn!(shard = self.shard, ?kind, ?phase, "Unexpected task completion");
            }
        }
    }

    fn begin_flush(&mut self, progress: ShardProgress) {
        if progress.dirty {
            self.phase = WorkerPhase::Flushing;
            self.spawn(TaskKind::Flush, progress);
        } else {
            self.phase = WorkerPhase::Retired;
        }
    }

    fn spawn(&self, kind: TaskKind, progress: ShardProgress) {
        self.ctx.metrics.in_flight_tasks.inc();
        tokio::spawn(self.ctx.clone().run_task(self.shard, kind, progress));
    }
}

impl std::fmt::Debug for ShardWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardWorker")
            .field("shard", &self.shard)
            .field("phase", &self.phase)
            .field("shutdown_requested", &self.shutdown_requested)
            .field("dispatched", &self.dispatched)
            .finish()
    }
}
