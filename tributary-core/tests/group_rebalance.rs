//! Consumer-group rebalancing against the in-process coordination service

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::{eventually, RecordingProcessor};
use tokio::task::JoinHandle;
use tributary_core::{ConsumerConfig, ConsumerWorker, Cursor, InMemoryCoordinator, Result};

const GROUP: &str = "rebalance-group";

struct Member {
    worker: Arc<ConsumerWorker>,
    processor: Arc<RecordingProcessor>,
    handle: JoinHandle<Result<()>>,
}

fn config(name: &str) -> ConsumerConfig {
    ConsumerConfig {
        consumer_name: name.into(),
        poll_interval: Duration::from_millis(50),
        heartbeat_interval: Duration::from_millis(20),
        group_timeout: Duration::from_millis(300),
        ..ConsumerConfig::new("test-project", "test-logstore", GROUP)
    }
}

async fn join(service: &InMemoryCoordinator, name: &str) -> Member {
    let processor = RecordingProcessor::new();
    let client = Arc::new(service.client(GROUP, name));
    let worker = ConsumerWorker::with_shared(config(name), client, processor.clone())
        .await
        .unwrap();
    let worker = Arc::new(worker);

    let runner = worker.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    Member {
        worker,
        processor,
        handle,
    }
}

async fn leave(member: Member) -> Arc<RecordingProcessor> {
    tokio::time::timeout(Duration::from_secs(5), member.worker.stop())
        .await
        .expect("stop must complete");
    member.handle.await.unwrap().unwrap();
    member.processor
}

fn produce(service: &InMemoryCoordinator, per_shard: usize) {
    for shard in service.shard_ids() {
        let start = service.shard_len(shard);
        for i in start..start + per_shard {
            service.append(shard, format!("{}-{}", shard, i)).unwrap();
        }
    }
}

fn fully_checkpointed(service: &InMemoryCoordinator) -> bool {
    service.shard_ids().into_iter().all(|shard| {
        service.checkpoint(GROUP, shard) == Some(Cursor::new(service.shard_len(shard).to_string()))
    })
}

fn set(shards: &[u32]) -> BTreeSet<u32> {
    shards.iter().copied().collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shards_split_and_rejoin() {
    let service = InMemoryCoordinator::new(4);
    produce(&service, 10);

    let a = join(&service, "consumer-a").await;
    assert!(eventually(Duration::from_secs(3), || a.worker.active_shards() == set(&[0, 1, 2, 3])).await);
    assert!(eventually(Duration::from_secs(3), || fully_checkpointed(&service)).await);
    assert_eq!(service.in_order(GROUP), Some(false));

    let b = join(&service, "consumer-b").await;
    assert!(
        eventually(Duration::from_secs(3), || {
            a.worker.active_shards() == set(&[0, 2]) && b.worker.active_shards() == set(&[1, 3])
        })
        .await
    );
    assert_eq!(service.owner(GROUP, 1).as_deref(), Some("consumer-b"));
    assert_eq!(service.reported_by(GROUP, "consumer-a"), Some(set(&[0, 2])));

    produce(&service, 5);
    assert!(eventually(Duration::from_secs(3), || fully_checkpointed(&service)).await);

    // Shards of a departed consumer come back once it expires
    let b_seen = leave(b).await;
    assert!(eventually(Duration::from_secs(3), || a.worker.active_shards() == set(&[0, 1, 2, 3])).await);

    produce(&service, 5);
    assert!(eventually(Duration::from_secs(3), || fully_checkpointed(&service)).await);
    let a_seen = leave(a).await;

    for shard in service.shard_ids() {
        let seen: BTreeSet<String> = a_seen
            .seen(shard)
            .into_iter()
            .chain(b_seen.seen(shard))
            .collect();
        for i in 0..service.shard_len(shard) {
            assert!(seen.contains(&format!("{}-{}", shard, i)), "record {} of shard {} never processed", i, shard);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resumes_from_group_checkpoint() {
    let service = InMemoryCoordinator::new(2);
    produce(&service, 6);

    let first = join(&service, "consumer-a").await;
    assert!(eventually(Duration::from_secs(3), || fully_checkpointed(&service)).await);
    let first_seen = leave(first).await;
    assert_eq!(first_seen.seen(0).len(), 6);

    produce(&service, 4);
    let second = join(&service, "consumer-a").await;
    assert!(eventually(Duration::from_secs(3), || fully_checkpointed(&service)).await);
    let second_seen = leave(second).await;

    // Only records appended after the checkpoint are delivered again
    assert_eq!(second_seen.seen(0), vec!["0-6", "0-7", "0-8", "0-9"]);
    assert_eq!(second_seen.seen(1), vec!["1-6", "1-7", "1-8", "1-9"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pinned_consumer_keeps_its_shards() {
    let service = InMemoryCoordinator::new(4);
    let a = join(&service, "consumer-a").await;
    assert!(eventually(Duration::from_secs(3), || a.worker.active_shards().len() == 4).await);

    service.pin(GROUP, "consumer-a", [3]);
    let b = join(&service, "consumer-b").await;
    assert!(
        eventually(Duration::from_secs(3), || {
            a.worker.active_shards() == set(&[3]) && b.worker.active_shards() == set(&[0, 1, 2])
        })
        .await
    );

    service.unpin(GROUP, "consumer-a");
    assert!(
        eventually(Duration::from_secs(3), || {
            a.worker.active_shards() == set(&[0, 2]) && b.worker.active_shards() == set(&[1, 3])
        })
        .await
    );

    leave(a).await;
    leave(b).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_new_shard_is_picked_up() {
    let service = InMemoryCoordinator::new(2);
    produce(&service, 3);

    let a = join(&service, "consumer-a").await;
    assert!(eventually(Duration::from_secs(3), || a.worker.active_shards() == set(&[0, 1])).await);

    assert!(service.add_shard(2));
    assert!(!service.add_shard(2));
    for i in 0..4 {
        service.append(2, format!("2-{}", i)).unwrap();
    }

    assert!(eventually(Duration::from_secs(3), || a.worker.active_shards() == set(&[0, 1, 2])).await);
    assert!(eventually(Duration::from_secs(3), || fully_checkpointed(&service)).await);

    let seen = leave(a).await;
    assert_eq!(seen.seen(2), vec!["2-0", "2-1", "2-2", "2-3"]);
}
