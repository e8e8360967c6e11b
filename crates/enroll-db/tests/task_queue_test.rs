//! Task queue state transitions against a real Postgres.
//!
//! Requires Docker for testcontainers (Postgres).

mod helpers;

use std::time::Duration;

use enroll_core::models::{DeliveryOptions, Priority, Task, TaskStatus};
use enroll_db::TaskRepository;
use helpers::{setup_test_db, verify_email_envelope};
use sqlx::PgPool;
use uuid::Uuid;

async fn load(pool: &PgPool, id: Uuid) -> Task {
    sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn claim_retry_then_exhaust() {
    let Some(db) = setup_test_db().await else {
        return;
    };
    let repo = TaskRepository::new(db.pool.clone());
    let options = DeliveryOptions::new(1, Duration::from_secs(10));

    let task = repo
        .enqueue(&verify_email_envelope("alice", options))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.max_retry, 1);
    assert_eq!(task.timeout_seconds, 10);

    let claimed = repo.claim_next_task().await.unwrap().unwrap();
    assert_eq!(claimed.id, task.id);
    assert_eq!(claimed.status, TaskStatus::Running);
    assert!(claimed.started_at.is_some());
    assert!(repo.claim_next_task().await.unwrap().is_none());

    repo.schedule_retry(task.id, 0, "smtp unavailable")
        .await
        .unwrap();
    let retrying = load(&db.pool, task.id).await;
    assert_eq!(retrying.status, TaskStatus::Retrying);
    assert_eq!(retrying.retry_count, 1);
    assert_eq!(retrying.last_error.as_deref(), Some("smtp unavailable"));
    assert!(retrying.started_at.is_none());

    let reclaimed = repo.claim_next_task().await.unwrap().unwrap();
    assert_eq!(reclaimed.id, task.id);
    assert_eq!(reclaimed.retry_count, reclaimed.max_retry);

    repo.mark_failed(task.id, "smtp unavailable").await.unwrap();
    let failed = load(&db.pool, task.id).await;
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.completed_at.is_some());
    assert!(repo.claim_next_task().await.unwrap().is_none());
}

#[tokio::test]
async fn retry_backoff_delays_the_next_claim() {
    let Some(db) = setup_test_db().await else {
        return;
    };
    let repo = TaskRepository::new(db.pool.clone());
    let task = repo
        .enqueue(&verify_email_envelope(
            "alice",
            DeliveryOptions::new(3, Duration::from_secs(10)),
        ))
        .await
        .unwrap();

    repo.claim_next_task().await.unwrap().unwrap();
    repo.schedule_retry(task.id, 60, "temporary").await.unwrap();

    assert!(repo.claim_next_task().await.unwrap().is_none());
}

#[tokio::test]
async fn completed_task_clears_last_error() {
    let Some(db) = setup_test_db().await else {
        return;
    };
    let repo = TaskRepository::new(db.pool.clone());
    let task = repo
        .enqueue(&verify_email_envelope(
            "alice",
            DeliveryOptions::new(3, Duration::from_secs(10)),
        ))
        .await
        .unwrap();

    repo.claim_next_task().await.unwrap().unwrap();
    repo.schedule_retry(task.id, 0, "temporary").await.unwrap();
    repo.claim_next_task().await.unwrap().unwrap();
    repo.mark_completed(task.id).await.unwrap();

    let done = load(&db.pool, task.id).await;
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.last_error.is_none());
    assert!(done.completed_at.is_some());
}

#[tokio::test]
async fn higher_priority_is_claimed_first() {
    let Some(db) = setup_test_db().await else {
        return;
    };
    let repo = TaskRepository::new(db.pool.clone());
    let mut critical = DeliveryOptions::new(3, Duration::from_secs(10));
    critical.priority = Priority::Critical;

    repo.enqueue(&verify_email_envelope(
        "normal",
        DeliveryOptions::new(3, Duration::from_secs(10)),
    ))
    .await
    .unwrap();
    let urgent = repo
        .enqueue(&verify_email_envelope("urgent", critical))
        .await
        .unwrap();

    let claimed = repo.claim_next_task().await.unwrap().unwrap();
    assert_eq!(claimed.id, urgent.id);
    assert_eq!(claimed.priority, Priority::Critical.as_i32());
}

#[tokio::test]
async fn delayed_task_is_not_claimable_yet() {
    let Some(db) = setup_test_db().await else {
        return;
    };
    let repo = TaskRepository::new(db.pool.clone());
    let mut options = DeliveryOptions::new(3, Duration::from_secs(10));
    options.process_in = Some(Duration::from_secs(300));

    repo.enqueue(&verify_email_envelope("alice", options))
        .await
        .unwrap();

    assert!(repo.claim_next_task().await.unwrap().is_none());
}

#[tokio::test]
async fn reaper_requeues_stale_running_tasks() {
    let Some(db) = setup_test_db().await else {
        return;
    };
    let repo = TaskRepository::new(db.pool.clone());
    let task = repo
        .enqueue(&verify_email_envelope(
            "alice",
            DeliveryOptions::new(3, Duration::from_secs(10)),
        ))
        .await
        .unwrap();
    repo.claim_next_task().await.unwrap().unwrap();

    assert_eq!(repo.reap_stale_running_tasks(0).await.unwrap(), 0);

    sqlx::query("UPDATE tasks SET started_at = NOW() - INTERVAL '1 hour' WHERE id = $1")
        .bind(task.id)
        .execute(&db.pool)
        .await
        .unwrap();

    assert_eq!(repo.reap_stale_running_tasks(0).await.unwrap(), 1);

    let reaped = load(&db.pool, task.id).await;
    assert_eq!(reaped.status, TaskStatus::Retrying);
    assert_eq!(reaped.retry_count, 1);
    assert_eq!(
        reaped.last_error.as_deref(),
        Some("worker lost while running")
    );

    let reclaimed = repo.claim_next_task().await.unwrap().unwrap();
    assert_eq!(reclaimed.id, task.id);
}
