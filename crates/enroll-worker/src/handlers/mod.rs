//! Task handlers and dispatch.
//!
//! Every [`TaskKind`] has exactly one handler; [`Handlers`] matches on the
//! kind, so adding a kind without a handler does not compile.

mod verify_email;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use enroll_core::models::TaskKind;
use enroll_core::TaskError;

pub use verify_email::{SendVerifyEmailHandler, VerifyEmailSettings};

/// Per-attempt context handed to a handler.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: Uuid,
    /// Zero-based attempt number (the task's retry count at claim time).
    pub attempt: i32,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(task_id: Uuid, attempt: i32, cancel: CancellationToken) -> Self {
        Self {
            task_id,
            attempt,
            cancel,
        }
    }

    /// Fails with a retryable "deadline exceeded" once the attempt is cancelled.
    /// Handlers call this around each blocking step.
    pub fn ensure_active(&self) -> Result<(), TaskError> {
        if self.cancel.is_cancelled() {
            return Err(TaskError::retryable(anyhow::anyhow!("deadline exceeded")));
        }
        Ok(())
    }
}

/// Routes a claimed task to its handler.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        ctx: &TaskContext,
        kind: TaskKind,
        payload: &serde_json::Value,
    ) -> Result<(), TaskError>;
}

/// The process-wide handler table, built once at startup.
pub struct Handlers {
    pub send_verify_email: SendVerifyEmailHandler,
}

impl Handlers {
    pub fn new(send_verify_email: SendVerifyEmailHandler) -> Self {
        Self { send_verify_email }
    }
}

#[async_trait]
impl TaskDispatcher for Handlers {
    async fn dispatch(
        &self,
        ctx: &TaskContext,
        kind: TaskKind,
        payload: &serde_json::Value,
    ) -> Result<(), TaskError> {
        match kind {
            TaskKind::SendVerifyEmail => self.send_verify_email.handle(ctx, payload).await,
        }
    }
}
