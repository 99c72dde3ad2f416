//! Consumer worker binary
//!
//! Runs a worker pool against the in-process coordination service, fed
//! by a synthetic producer. Stop with Ctrl-C.

use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tributary_core::{
    ConsumerConfig, ConsumerWorker, InMemoryCoordinator, ProcessError, RecordBatch, ShardId,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Tributary consumer");

    // Load configuration from environment
    let config = ConsumerConfig::from_env()?;
    let shard_count: u32 = std::env::var("TRIBUTARY_SHARDS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(4);
    let produce_every = Duration::from_millis(
        std::env::var("TRIBUTARY_PRODUCE_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(200),
    );

    let service = InMemoryCoordinator::new(shard_count);

    // Synthetic producer appending one record per shard per interval
    let producer = service.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(produce_every);
        let mut seq: u64 = 0;
        loop {
            interval.tick().await;
            for shard in producer.shard_ids() {
                if let Err(e) = producer.append(shard, format!("event-{}-{}", shard, seq)) {
                    warn!(shard, error = %e, "Producer append failed");
                }
            }
            seq += 1;
        }
    });

    let client = service.client(config.consumer_group.clone(), config.consumer_name.clone());
    let processor = |shard: ShardId, batch: &RecordBatch| -> Result<(), ProcessError> {
        info!(
            shard,
            records = batch.len(),
            bytes = batch.size(),
            next_cursor = %batch.next_cursor,
            "Processed batch"
        );
        Ok(())
    };

    info!(
        consumer = %config.consumer_name,
        group = %config.consumer_group,
        shards = shard_count,
        "Joining consumer group"
    );
    let worker = ConsumerWorker::new(config, client, processor).await?;

    // Blocks until Ctrl-C, then drains every shard worker
    worker.start().await?;

    print!("{}", worker.metrics().render());
    Ok(())
}
