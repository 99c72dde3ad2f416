//! Prometheus-style metrics for monitoring
//!
//! Counters, gauges, and a latency histogram. Metrics live on a
//! per-pool [`ConsumerMetrics`] instance rather than in globals so
//! several worker pools in one process report independently.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counter metric (monotonically increasing)
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Counter {
    /// Create a new counter
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
            help,
        }
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by delta
    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Gauge metric (can go up or down)
pub struct Gauge {
    value: AtomicI64,
    name: &'static str,
    help: &'static str,
}

impl Gauge {
    /// Create a new gauge
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name,
            help,
        }
    }

    /// Set value
    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement by 1
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} gauge\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

const TASK_BUCKETS: [f64; 10] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 10.0];

/// Histogram for task latency, in seconds
pub struct Histogram {
    buckets: Vec<(f64, AtomicU64)>,
    sum_micros: AtomicU64,
    count: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Histogram {
    /// Create with the default task-latency buckets
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            buckets: TASK_BUCKETS
                .iter()
                .map(|&b| (b, AtomicU64::new(0)))
                .collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
            name,
            help,
        }
    }

    /// Observe a value
    pub fn observe(&self, seconds: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((seconds * 1_000_000.0) as u64, Ordering::Relaxed);

        for (bound, count) in &self.buckets {
            if seconds <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Number of observations
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        let mut output = format!(
            "# HELP {} {}\n# TYPE {} histogram\n",
            self.name, self.help, self.name
        );

        for (bound, count) in &self.buckets {
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                self.name,
                bound,
                count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", self.name, self.count()));

        let sum_secs = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        output.push_str(&format!("{}_sum {}\n", self.name, sum_secs));
        output.push_str(&format!("{}_count {}\n", self.name, self.count()));

        output
    }
}

/// Metrics for one consumer worker pool
pub struct ConsumerMetrics {
    pub dispatched_tasks: Counter,
    pub fetched_batches: Counter,
    pub processed_records: Counter,
    pub fetch_errors: Counter,
    pub processor_errors: Counter,
    pub checkpoint_errors: Counter,
    pub checkpoints_committed: Counter,
    pub heartbeat_errors: Counter,
    pub retired_shards: Counter,
    pub active_shard_workers: Gauge,
    pub in_flight_tasks: Gauge,
    pub owned_shards: Gauge,
    pub task_duration: Histogram,
}

impl ConsumerMetrics {
    /// Create a zeroed metric set
    pub fn new() -> Self {
        Self {
            dispatched_tasks: Counter::new(
                "tributary_dispatched_tasks_total",
                "Consumption tasks dispatched to shard workers",
            ),
            fetched_batches: Counter::new(
                "tributary_fetched_batches_total",
                "Non-empty record batches fetched",
            ),
            processed_records: Counter::new(
                "tributary_processed_records_total",
                "Records handed to the processor successfully",
            ),
            fetch_errors: Counter::new(
                "tributary_fetch_errors_total",
                "Failed fetches or cursor lookups",
            ),
            processor_errors: Counter::new(
                "tributary_processor_errors_total",
                "Batches rejected by the processor",
            ),
            checkpoint_errors: Counter::new(
                "tributary_checkpoint_errors_total",
                "Failed checkpoint commits",
            ),
            checkpoints_committed: Counter::new(
                "tributary_checkpoints_committed_total",
                "Checkpoints committed to the coordination service",
            ),
            heartbeat_errors: Counter::new(
                "tributary_heartbeat_errors_total",
                "Failed heartbeats",
            ),
            retired_shards: Counter::new(
                "tributary_retired_shards_total",
                "Shard workers retired",
            ),
            active_shard_workers: Gauge::new(
                "tributary_active_shard_workers",
                "Shard workers currently in the worker table",
            ),
            in_flight_tasks: Gauge::new(
                "tributary_in_flight_tasks",
                "Shard tasks currently running",
            ),
            owned_shards: Gauge::new(
                "tributary_owned_shards",
                "Shards assigned to this consumer by the last heartbeat",
            ),
            task_duration: Histogram::new(
                "tributary_task_duration_seconds",
                "Wall time of one fetch/process/checkpoint task",
            ),
        }
    }

    /// Export all metrics in Prometheus text format
    pub fn render(&self) -> String {
        let mut output = String::new();

        for counter in [
            &self.dispatched_tasks,
            &self.fetched_batches,
            &self.processed_records,
            &self.fetch_errors,
            &self.processor_errors,
            &self.checkpoint_errors,
            &self.checkpoints_committed,
            &self.heartbeat_errors,
            &self.retired_shards,
        ] {
            output.push_str(&counter.to_prometheus());
        }

        for gauge in [
            &self.active_shard_workers,
            &self.in_flight_tasks,
            &self.owned_shards,
        ] {
            output.push_str(&gauge.to_prometheus());
        }

        output.push_str(&self.task_duration.to_prometheus());
        output
    }
}

impl Default for ConsumerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
