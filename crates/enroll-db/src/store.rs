//! Store traits consumed by the worker and the API.
//!
//! The repositories implement these against Postgres; the worker's
//! `test_helpers` module provides in-memory versions.

use anyhow::Result;
use async_trait::async_trait;
use enroll_core::error::AppError;
use enroll_core::models::{
    CreateUserParams, CreateVerifyEmailParams, OutboxMessage, Task, TaskEnvelope, User,
    VerifyEmail,
};
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::db::{OutboxRepository, TaskRepository, UserRepository, VerifyEmailRepository};

/// Hook run once a new user row is durable.
pub type AfterCreate = Box<dyn FnOnce(User) -> BoxFuture<'static, Result<(), AppError>> + Send>;

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create_user(&self, params: CreateUserParams) -> Result<User, AppError>;

    /// Insert, commit, then run `after_create`. Its error fails the call
    /// although the user stays committed.
    async fn create_user_with_side_effect(
        &self,
        params: CreateUserParams,
        after_create: AfterCreate,
    ) -> Result<User, AppError>;

    /// Insert the user and an outbox row for `envelope` atomically.
    async fn create_user_with_outbox(
        &self,
        params: CreateUserParams,
        envelope: &TaskEnvelope,
    ) -> Result<User, AppError>;

    async fn get_user(&self, username: &str) -> Result<Option<User>, AppError>;
}

#[async_trait]
pub trait VerifyEmailStore: Send + Sync {
    /// Returns the user's active record if one exists, otherwise creates one.
    async fn create_verify_email(&self, params: CreateVerifyEmailParams) -> Result<VerifyEmail>;

    async fn list_active(&self, username: &str) -> Result<Vec<VerifyEmail>>;
}

/// Durable at-least-once task queue.
#[async_trait]
pub trait TaskQueueStore: Send + Sync {
    async fn enqueue(&self, envelope: &TaskEnvelope) -> Result<Uuid>;

    async fn claim_next(&self) -> Result<Option<Task>>;

    async fn mark_completed(&self, task_id: Uuid) -> Result<()>;

    async fn schedule_retry(&self, task_id: Uuid, backoff_secs: i64, reason: &str) -> Result<()>;

    async fn mark_failed(&self, task_id: Uuid, reason: &str) -> Result<()>;

    async fn reap_stale_running(&self, grace_period_secs: i64) -> Result<u64>;
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn fetch_pending(&self, limit: i64) -> Result<Vec<OutboxMessage>>;

    async fn delete(&self, id: i64) -> Result<()>;

    async fn record_failure(&self, id: i64, error: &str) -> Result<()>;
}

// Implementations for concrete repository types

#[async_trait]
impl UserStore for UserRepository {
    async fn create_user(&self, params: CreateUserParams) -> Result<User, AppError> {
        UserRepository::create_user(self, params).await
    }

    async fn create_user_with_side_effect(
        &self,
        params: CreateUserParams,
        after_create: AfterCreate,
    ) -> Result<User, AppError> {
        UserRepository::create_user_with_side_effect(self, params, after_create).await
    }

    async fn create_user_with_outbox(
        &self,
        params: CreateUserParams,
        envelope: &TaskEnvelope,
    ) -> Result<User, AppError> {
        UserRepository::create_user_with_outbox(self, params, envelope).await
    }

    async fn get_user(&self, username: &str) -> Result<Option<User>, AppError> {
        UserRepository::get_user(self, username).await
    }
}

#[async_trait]
impl VerifyEmailStore for VerifyEmailRepository {
    async fn create_verify_email(&self, params: CreateVerifyEmailParams) -> Result<VerifyEmail> {
        VerifyEmailRepository::create_verify_email(self, params).await
    }

    async fn list_active(&self, username: &str) -> Result<Vec<VerifyEmail>> {
        VerifyEmailRepository::list_active(self, username).await
    }
}

#[async_trait]
impl TaskQueueStore for TaskRepository {
    async fn enqueue(&self, envelope: &TaskEnvelope) -> Result<Uuid> {
        Ok(TaskRepository::enqueue(self, envelope).await?.id)
    }

    async fn claim_next(&self) -> Result<Option<Task>> {
        self.claim_next_task().await
    }

    async fn mark_completed(&self, task_id: Uuid) -> Result<()> {
        TaskRepository::mark_completed(self, task_id).await
    }

    async fn schedule_retry(&self, task_id: Uuid, backoff_secs: i64, reason: &str) -> Result<()> {
        TaskRepository::schedule_retry(self, task_id, backoff_secs, reason).await
    }

    async fn mark_failed(&self, task_id: Uuid, reason: &str) -> Result<()> {
        TaskRepository::mark_failed(self, task_id, reason).await
    }

    async fn reap_stale_running(&self, grace_period_secs: i64) -> Result<u64> {
        self.reap_stale_running_tasks(grace_period_secs).await
    }
}

#[async_trait]
impl OutboxStore for OutboxRepository {
    async fn fetch_pending(&self, limit: i64) -> Result<Vec<OutboxMessage>> {
        OutboxRepository::fetch_pending(self, limit).await
    }

    async fn delete(&self, id: i64) -> Result<()> {
        OutboxRepository::delete(self, id).await
    }

    async fn record_failure(&self, id: i64, error: &str) -> Result<()> {
        OutboxRepository::record_failure(self, id, error).await
    }
}
