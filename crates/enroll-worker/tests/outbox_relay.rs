use std::sync::Arc;
use std::time::Duration;

use enroll_core::models::{DeliveryOptions, SendVerifyEmailPayload, TaskEnvelope, TaskKind};
use enroll_worker::test_helpers::{MemoryOutboxStore, MemoryTaskQueue};
use enroll_worker::{OutboxRelay, OutboxRelayConfig, QueueTaskDistributor};

fn envelope(user_name: &str, max_retry: i32) -> TaskEnvelope {
    TaskEnvelope::new(
        &SendVerifyEmailPayload {
            user_name: user_name.to_string(),
        },
        DeliveryOptions::new(max_retry, Duration::from_secs(10)),
    )
    .unwrap()
}

fn relay(outbox: &MemoryOutboxStore, queue: &MemoryTaskQueue) -> OutboxRelay {
    OutboxRelay::new(
        Arc::new(outbox.clone()),
        Arc::new(QueueTaskDistributor::new(Arc::new(queue.clone()))),
        OutboxRelayConfig {
            interval_ms: 10,
            batch_size: 10,
        },
    )
}

#[tokio::test]
async fn relays_and_removes_messages() {
    let outbox = MemoryOutboxStore::new();
    let queue = MemoryTaskQueue::new();
    outbox.push(&envelope("alice", 10));
    outbox.push(&envelope("bob", 10));

    let relayed = relay(&outbox, &queue).relay_once().await.unwrap();

    assert_eq!(relayed, 2);
    assert!(outbox.messages().is_empty());
    let tasks = queue.tasks();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.kind().unwrap() == TaskKind::SendVerifyEmail));
    assert_eq!(tasks[0].payload["user_name"], "alice");
    assert_eq!(tasks[0].max_retry, 10);
}

#[tokio::test]
async fn keeps_messages_while_queue_is_down() {
    let outbox = MemoryOutboxStore::new();
    let queue = MemoryTaskQueue::new();
    outbox.push(&envelope("alice", 10));
    queue.set_unavailable(true);
    let relay = relay(&outbox, &queue);

    assert_eq!(relay.relay_once().await.unwrap(), 0);
    let pending = outbox.messages();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 1);
    assert!(pending[0].last_error.as_deref().unwrap().contains("unavailable"));

    queue.set_unavailable(false);
    assert_eq!(relay.relay_once().await.unwrap(), 1);
    assert!(outbox.messages().is_empty());
    assert_eq!(queue.tasks().len(), 1);
}

#[tokio::test]
async fn discards_messages_the_queue_can_never_accept() {
    let outbox = MemoryOutboxStore::new();
    let queue = MemoryTaskQueue::new();
    outbox.push(&envelope("alice", -1));
    outbox.push(&envelope("bob", 3));

    assert_eq!(relay(&outbox, &queue).relay_once().await.unwrap(), 1);
    assert!(outbox.messages().is_empty());
    assert_eq!(queue.tasks().len(), 1);
    assert_eq!(queue.tasks()[0].payload["user_name"], "bob");
}

#[tokio::test]
async fn background_relay_drains_outbox() {
    let outbox = MemoryOutboxStore::new();
    let queue = MemoryTaskQueue::new();
    let relay = relay(&outbox, &queue);
    let handle = relay.start();

    outbox.push(&envelope("alice", 10));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !outbox.messages().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "outbox was not drained");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    relay.shutdown();
    handle.await.unwrap();
    assert_eq!(queue.tasks().len(), 1);
}
