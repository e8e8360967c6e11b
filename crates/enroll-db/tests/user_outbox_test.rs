//! User creation and the task outbox against a real Postgres.
//!
//! Requires Docker for testcontainers (Postgres).

mod helpers;

use std::time::Duration;

use enroll_core::error::AppError;
use enroll_core::models::{DeliveryOptions, User};
use enroll_db::{AfterCreate, OutboxRepository, UserRepository};
use helpers::{setup_test_db, user_params, verify_email_envelope};
use sqlx::PgPool;

async fn outbox_len(pool: &PgPool) -> i64 {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM task_outbox")
        .fetch_one(pool)
        .await
        .unwrap();
    count
}

fn options() -> DeliveryOptions {
    DeliveryOptions::new(10, Duration::from_secs(10))
}

#[tokio::test]
async fn outbox_row_commits_with_the_user() {
    let Some(db) = setup_test_db().await else {
        return;
    };
    let users = UserRepository::new(db.pool.clone());

    let user = users
        .create_user_with_outbox(user_params("alice"), &verify_email_envelope("alice", options()))
        .await
        .unwrap();

    assert_eq!(user.username, "alice");
    assert!(!user.is_email_verified);
    assert!(users.get_user("alice").await.unwrap().is_some());
    assert_eq!(outbox_len(&db.pool).await, 1);
}

#[tokio::test]
async fn duplicate_username_leaves_no_outbox_row() {
    let Some(db) = setup_test_db().await else {
        return;
    };
    let users = UserRepository::new(db.pool.clone());
    users
        .create_user_with_outbox(user_params("alice"), &verify_email_envelope("alice", options()))
        .await
        .unwrap();

    let mut again = user_params("alice");
    again.email = "other@x.com".to_string();
    let err = users
        .create_user_with_outbox(again, &verify_email_envelope("alice", options()))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::AlreadyExists(_)));
    assert_eq!(outbox_len(&db.pool).await, 1);
}

#[tokio::test]
async fn failing_hook_keeps_committed_user() {
    let Some(db) = setup_test_db().await else {
        return;
    };
    let users = UserRepository::new(db.pool.clone());
    let hook: AfterCreate = Box::new(|_user: User| {
        Box::pin(async { Err(AppError::Distribution("queue down".to_string())) })
    });

    let err = users
        .create_user_with_side_effect(user_params("alice"), hook)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Distribution(_)));
    assert!(users.get_user("alice").await.unwrap().is_some());
}

#[tokio::test]
async fn fetch_counts_attempts_until_deleted() {
    let Some(db) = setup_test_db().await else {
        return;
    };
    let users = UserRepository::new(db.pool.clone());
    let outbox = OutboxRepository::new(db.pool.clone());
    users
        .create_user_with_outbox(user_params("alice"), &verify_email_envelope("alice", options()))
        .await
        .unwrap();

    let first = outbox.fetch_pending(10).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].attempts, 1);
    assert_eq!(first[0].task_type, "send_verify_email");
    assert_eq!(first[0].payload["user_name"], "alice");
    assert_eq!(first[0].options, options());

    outbox
        .record_failure(first[0].id, "queue down")
        .await
        .unwrap();
    let second = outbox.fetch_pending(10).await.unwrap();
    assert_eq!(second[0].attempts, 2);
    assert_eq!(second[0].last_error.as_deref(), Some("queue down"));

    outbox.delete(first[0].id).await.unwrap();
    assert!(outbox.fetch_pending(10).await.unwrap().is_empty());
}
