//! Retry, deadline and dispatch behaviour of the task processor.

use std::sync::Arc;
use std::time::Duration;

use enroll_core::models::{
    DeliveryOptions, Priority, SendVerifyEmailPayload, Task, TaskEnvelope, TaskOutcome,
    TaskStatus,
};
use enroll_db::TaskQueueStore;
use enroll_worker::test_helpers::{task_from_envelope, MemoryTaskQueue, Scripted, ScriptedDispatcher};
use enroll_worker::{TaskProcessor, TaskProcessorConfig};

fn processor(queue: &MemoryTaskQueue, dispatcher: &ScriptedDispatcher) -> TaskProcessor {
    TaskProcessor::new(
        Arc::new(queue.clone()),
        Arc::new(dispatcher.clone()),
        TaskProcessorConfig {
            max_workers: 4,
            poll_interval_ms: 10,
            stale_task_reap_interval_secs: 0,
            stale_task_grace_period_secs: 300,
        },
    )
}

fn verify_task(max_retry: i32, timeout: Duration) -> Task {
    let envelope = TaskEnvelope::new(
        &SendVerifyEmailPayload {
            user_name: "alice".to_string(),
        },
        DeliveryOptions::new(max_retry, timeout),
    )
    .unwrap();
    task_from_envelope(&envelope)
}

#[tokio::test]
async fn retries_up_to_max_retry_then_fails() {
    let queue = MemoryTaskQueue::new();
    let dispatcher = ScriptedDispatcher::new(Scripted::FailRetryable);
    let processor = processor(&queue, &dispatcher);
    let task = verify_task(2, Duration::from_secs(10));
    let id = task.id;
    queue.push(task);

    let mut outcomes = Vec::new();
    while let Some(outcome) = processor.run_once().await.unwrap() {
        outcomes.push(outcome);
        queue.make_due();
    }

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| matches!(o, TaskOutcome::Retry(_))));
    assert_eq!(dispatcher.calls(), 3);

    let task = queue.task(id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 2);
    assert!(task
        .last_error
        .unwrap()
        .starts_with("retries exhausted after 3 attempts"));
}

#[tokio::test]
async fn zero_max_retry_means_single_attempt() {
    let queue = MemoryTaskQueue::new();
    let dispatcher = ScriptedDispatcher::new(Scripted::FailRetryable);
    let processor = processor(&queue, &dispatcher);
    let task = verify_task(0, Duration::from_secs(10));
    let id = task.id;
    queue.push(task);

    processor.run_once().await.unwrap();
    queue.make_due();
    assert_eq!(processor.run_once().await.unwrap(), None);

    assert_eq!(dispatcher.calls(), 1);
    assert_eq!(queue.task(id).unwrap().status, TaskStatus::Failed);
}

#[tokio::test]
async fn attempt_past_budget_is_permanent_without_running_handler() {
    let queue = MemoryTaskQueue::new();
    let dispatcher = ScriptedDispatcher::new(Scripted::Succeed);
    let processor = processor(&queue, &dispatcher);

    let mut task = verify_task(2, Duration::from_secs(10));
    task.retry_count = 3;

    let outcome = processor.process(&task).await;
    assert!(matches!(outcome, TaskOutcome::Permanent(ref r) if r.contains("retry budget exhausted")));
    assert_eq!(dispatcher.calls(), 0);
}

#[tokio::test]
async fn reaped_attempt_counts_against_budget() {
    let queue = MemoryTaskQueue::new();
    let dispatcher = ScriptedDispatcher::new(Scripted::Succeed);
    let processor = processor(&queue, &dispatcher);
    let task = verify_task(0, Duration::from_secs(10));
    let id = task.id;
    queue.push(task);

    // A worker claims the task and disappears.
    queue.claim_next().await.unwrap().unwrap();
    queue.age_running(Duration::from_secs(3600));
    assert_eq!(queue.reap_stale_running(300).await.unwrap(), 1);
    assert_eq!(queue.task(id).unwrap().retry_count, 1);

    let outcome = processor.run_once().await.unwrap();
    assert!(matches!(outcome, Some(TaskOutcome::Permanent(_))));
    assert_eq!(dispatcher.calls(), 0);
    assert_eq!(queue.task(id).unwrap().status, TaskStatus::Failed);
}

#[tokio::test]
async fn permanent_failure_ignores_remaining_budget() {
    let queue = MemoryTaskQueue::new();
    let dispatcher = ScriptedDispatcher::new(Scripted::FailPermanent);
    let processor = processor(&queue, &dispatcher);
    let task = verify_task(10, Duration::from_secs(10));
    let id = task.id;
    queue.push(task);

    let outcome = processor.run_once().await.unwrap();
    assert!(matches!(outcome, Some(TaskOutcome::Permanent(_))));

    let task = queue.task(id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 0);
    assert_eq!(dispatcher.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn exceeding_deadline_is_retryable() {
    let queue = MemoryTaskQueue::new();
    let dispatcher = ScriptedDispatcher::new(Scripted::Hang);
    let processor = processor(&queue, &dispatcher);
    let task = verify_task(3, Duration::from_secs(10));
    let id = task.id;
    queue.push(task);

    let outcome = processor.run_once().await.unwrap();
    assert_eq!(outcome, Some(TaskOutcome::Retry("deadline exceeded".to_string())));

    let task = queue.task(id).unwrap();
    assert_eq!(task.status, TaskStatus::Retrying);
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.last_error.as_deref(), Some("deadline exceeded"));
}

#[tokio::test]
async fn unknown_task_type_is_permanent() {
    let queue = MemoryTaskQueue::new();
    let dispatcher = ScriptedDispatcher::new(Scripted::Succeed);
    let processor = processor(&queue, &dispatcher);
    let envelope = TaskEnvelope::from_parts(
        "task:send_sms",
        serde_json::json!({"user_name": "alice"}),
        DeliveryOptions::new(5, Duration::from_secs(10)),
    );
    let task = task_from_envelope(&envelope);
    let id = task.id;
    queue.push(task);

    let outcome = processor.run_once().await.unwrap();
    assert!(matches!(outcome, Some(TaskOutcome::Permanent(ref r)) if r.contains("Unknown task type")));
    assert_eq!(dispatcher.calls(), 0);
    assert_eq!(queue.task(id).unwrap().status, TaskStatus::Failed);
}

#[tokio::test]
async fn claims_higher_priority_first() {
    let queue = MemoryTaskQueue::new();
    let dispatcher = ScriptedDispatcher::new(Scripted::Succeed);
    let processor = processor(&queue, &dispatcher);

    let payload = SendVerifyEmailPayload {
        user_name: "alice".to_string(),
    };
    let low = task_from_envelope(
        &TaskEnvelope::new(
            &payload,
            DeliveryOptions::new(1, Duration::from_secs(10)).with_priority(Priority::Low),
        )
        .unwrap(),
    );
    let critical = task_from_envelope(
        &TaskEnvelope::new(
            &payload,
            DeliveryOptions::new(1, Duration::from_secs(10)).with_priority(Priority::Critical),
        )
        .unwrap(),
    );
    let (low_id, critical_id) = (low.id, critical.id);
    queue.push(low);
    queue.push(critical);

    processor.run_once().await.unwrap();
    assert_eq!(queue.task(critical_id).unwrap().status, TaskStatus::Completed);
    assert_eq!(queue.task(low_id).unwrap().status, TaskStatus::Pending);
}

#[tokio::test]
async fn worker_pool_drains_queue_until_shutdown() {
    let queue = MemoryTaskQueue::new();
    let dispatcher = ScriptedDispatcher::new(Scripted::Succeed);
    let processor = processor(&queue, &dispatcher);
    for _ in 0..5 {
        queue.push(verify_task(3, Duration::from_secs(10)));
    }

    let handle = processor.start(None);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while queue
        .tasks()
        .iter()
        .any(|t| t.status != TaskStatus::Completed)
    {
        assert!(tokio::time::Instant::now() < deadline, "queue was not drained");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    processor.shutdown();
    handle.await.unwrap();
    assert_eq!(dispatcher.calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn deadline_cancels_handler_cooperatively() {
    let queue = MemoryTaskQueue::new();
    let dispatcher = ScriptedDispatcher::new(Scripted::Cooperative);
    let processor = processor(&queue, &dispatcher);
    let task = verify_task(3, Duration::from_secs(2));
    queue.push(task);

    let outcome = processor.run_once().await.unwrap();

    assert_eq!(outcome, Some(TaskOutcome::Retry("deadline exceeded".to_string())));
    assert_eq!(dispatcher.cancellations(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_in_flight_attempt() {
    let queue = MemoryTaskQueue::new();
    let dispatcher = ScriptedDispatcher::new(Scripted::Hang);
    let processor = processor(&queue, &dispatcher);
    let task = verify_task(3, Duration::from_secs(5));
    let id = task.id;
    queue.push(task);

    let handle = processor.start(None);
    while dispatcher.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(queue.task(id).unwrap().status, TaskStatus::Running);

    processor.shutdown();
    handle.await.unwrap();

    let task = queue.task(id).unwrap();
    assert_eq!(task.status, TaskStatus::Retrying);
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.last_error.as_deref(), Some("deadline exceeded"));
    assert_eq!(dispatcher.calls(), 1);
}
