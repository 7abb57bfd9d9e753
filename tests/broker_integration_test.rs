//! Queue semantics against a real Redis.
//!
//! Requires REDIS_URL (default redis://127.0.0.1:6379). Every test declares
//! its own uniquely named topology and removes it afterwards.
//!
//! Run with: cargo test --test broker_integration_test -- --ignored

use std::time::Duration;

use chrono::Utc;
use redis::AsyncCommands;
use uuid::Uuid;

use photogrammetry_pipeline::{
    models::status::{StatusUpdate, VerboseState, VerboseStatus},
    services::{
        progress::ProgressChannel,
        queue::JobQueue,
        status::{StatusChannel, StatusPublisher},
        topology::Topology,
    },
};

fn redis_client() -> redis::Client {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    redis::Client::open(url).expect("Invalid REDIS_URL")
}

fn isolated_topology() -> Topology {
    let suffix = Uuid::new_v4().simple().to_string();
    let mut topology = Topology::default();
    for queue in [
        &mut topology.work,
        &mut topology.failed,
        &mut topology.status,
        &mut topology.verbose,
    ] {
        queue.key = format!("{}:{}", queue.key, suffix);
    }
    topology.dead_letter_exchange = format!("{}-{}", topology.dead_letter_exchange, suffix);
    topology
}

async fn teardown(client: &redis::Client, topology: &Topology) {
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let mut keys = vec![topology.exchange_key(), topology.bindings_key()];
    for queue in topology.queues() {
        keys.push(queue.key.clone());
        keys.push(Topology::properties_key(queue));
    }
    let _: () = conn.del(keys).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_declare_is_idempotent() {
    let client = redis_client();
    let topology = isolated_topology();

    topology.declare(&client).await.expect("first declare");
    topology.declare(&client).await.expect("second declare");

    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let bound: String = conn
        .hget(topology.bindings_key(), &topology.dead_letter_routing_key)
        .await
        .unwrap();
    assert_eq!(bound, topology.failed.key);

    teardown(&client, &topology).await;
}

#[tokio::test]
#[ignore]
async fn test_requeue_then_dead_letter() {
    let client = redis_client();
    let topology = isolated_topology();
    topology.declare(&client).await.unwrap();
    let queue = JobQueue::with_client(client.clone(), topology.clone());

    queue.enqueue(42).await.unwrap();
    let first = queue.consume("worker-a", 1_000).await.unwrap().expect("delivery");
    assert_eq!(first.job().unwrap().project_id, 42);
    assert_eq!(first.attempt, 1);

    queue.requeue(&first).await.unwrap();
    let second = queue.consume("worker-a", 1_000).await.unwrap().expect("redelivery");
    assert_eq!(second.attempt, 2);
    assert_eq!(second.payload, first.payload);

    queue.dead_letter(&second, "stage_failed: mapper").await.unwrap();
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.dead_lettered, 1);

    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let reply: redis::streams::StreamRangeReply = conn.xrange_all(&topology.failed.key).await.unwrap();
    let entry = &reply.ids[0];
    assert_eq!(entry.get::<String>("reason").as_deref(), Some("stage_failed: mapper"));
    assert_eq!(entry.get::<String>("original_id"), Some(second.message_id.clone()));

    teardown(&client, &topology).await;
}

#[tokio::test]
#[ignore]
async fn test_stale_delivery_is_reclaimed_with_next_attempt() {
    let client = redis_client();
    let topology = isolated_topology();
    topology.declare(&client).await.unwrap();
    let queue = JobQueue::with_client(client.clone(), topology.clone());

    queue.enqueue(7).await.unwrap();
    let crashed = queue.consume("worker-crashed", 1_000).await.unwrap().expect("delivery");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let reclaimed = queue
        .claim_stale("worker-b", Duration::from_millis(10))
        .await
        .unwrap()
        .expect("reclaimed delivery");
    assert_eq!(reclaimed.message_id, crashed.message_id);
    assert_eq!(reclaimed.attempt, 2);

    queue.ack(&reclaimed).await.unwrap();
    assert_eq!(queue.queue_depth().await.unwrap(), 0);

    teardown(&client, &topology).await;
}

#[tokio::test]
#[ignore]
async fn test_status_messages_stay_pending_until_acked() {
    let client = redis_client();
    let topology = isolated_topology();
    topology.declare(&client).await.unwrap();
    let channel = StatusChannel::new(client.clone(), topology.clone());

    channel.publish(&StatusUpdate::processing(3, Utc::now())).await.unwrap();

    let delivery = channel.read_next("api", 1_000).await.unwrap().expect("status message");
    assert_eq!(delivery.update().unwrap().project_id, 3);

    // Not acked: the same entry comes back first
    let again = channel.read_next("api", 1_000).await.unwrap().expect("pending message");
    assert_eq!(again.message_id, delivery.message_id);

    channel.ack(&again).await.unwrap();
    assert!(channel.read_next("api", 100).await.unwrap().is_none());

    teardown(&client, &topology).await;
}

#[tokio::test]
#[ignore]
async fn test_progress_events_are_readable_in_order() {
    let client = redis_client();
    let topology = isolated_topology();
    topology.declare(&client).await.unwrap();
    let channel = ProgressChannel::new(client.clone(), topology.clone());

    let now = Utc::now();
    channel.publish(&VerboseStatus::queued(9, now)).await.unwrap();
    channel
        .publish(&VerboseStatus::new(9, VerboseState::Processing, "worker-a", now).with_step("Step 1/7: Feature extraction"))
        .await
        .unwrap();

    let batch = channel.read_after("0", 100, 10).await.unwrap();
    assert_eq!(batch.events.len(), 2);
    assert_eq!(batch.events[0].status, VerboseState::InQueue);
    assert_eq!(batch.events[1].worker_id, "worker-a");

    let rest = channel
        .read_after(batch.last_id.as_deref().unwrap(), 100, 10)
        .await
        .unwrap();
    assert!(rest.events.is_empty());

    teardown(&client, &topology).await;
}
