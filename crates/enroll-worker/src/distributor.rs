//! Task distribution: hand an envelope to the durable queue.
//!
//! Distribution never retries on its own. Once the queue has accepted an
//! envelope, retries belong to the processor; if the queue cannot be reached
//! the caller decides what to do with the enclosing operation.

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use enroll_core::models::{DeliveryOptions, OptionsError, SendVerifyEmailPayload, TaskEnvelope};
use enroll_db::TaskQueueStore;

#[derive(Debug, thiserror::Error)]
pub enum DistributeError {
    #[error("invalid delivery options: {0}")]
    InvalidOptions(#[from] OptionsError),

    #[error("failed to encode task payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("task queue unavailable: {0}")]
    QueueUnavailable(#[source] anyhow::Error),
}

impl DistributeError {
    /// Only an unreachable queue may succeed on a later call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DistributeError::QueueUnavailable(_))
    }
}

#[async_trait]
pub trait TaskDistributor: Send + Sync {
    /// Make `envelope` durably visible to the queue and return its task id.
    async fn distribute(&self, envelope: &TaskEnvelope) -> Result<Uuid, DistributeError>;
}

/// Distributor backed by a [`TaskQueueStore`].
#[derive(Clone)]
pub struct QueueTaskDistributor {
    queue: Arc<dyn TaskQueueStore>,
}

impl QueueTaskDistributor {
    pub fn new(queue: Arc<dyn TaskQueueStore>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl TaskDistributor for QueueTaskDistributor {
    #[tracing::instrument(skip(self, envelope), fields(task_type = %envelope.task_type()))]
    async fn distribute(&self, envelope: &TaskEnvelope) -> Result<Uuid, DistributeError> {
        envelope.options().validate()?;

        let task_id = self.queue.enqueue(envelope).await.map_err(|e| {
            tracing::error!(
                error = %e,
                task_type = %envelope.task_type(),
                "Failed to enqueue task"
            );
            DistributeError::QueueUnavailable(e)
        })?;

        let options = envelope.options();
        tracing::info!(
            task_id = %task_id,
            task_type = %envelope.task_type(),
            queue = options.priority.queue_name(),
            max_retry = options.max_retry,
            timeout_secs = options.timeout_seconds(),
            "Enqueued task"
        );

        Ok(task_id)
    }
}

/// Build and distribute the verification email envelope for `payload`.
pub async fn distribute_send_verify_email(
    distributor: &dyn TaskDistributor,
    payload: &SendVerifyEmailPayload,
    options: DeliveryOptions,
) -> Result<Uuid, DistributeError> {
    options.validate()?;
    let envelope = TaskEnvelope::new(payload, options)?;
    distributor.distribute(&envelope).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::MemoryTaskQueue;
    use enroll_core::models::{Priority, TaskKind};
    use std::time::Duration;

    fn payload() -> SendVerifyEmailPayload {
        SendVerifyEmailPayload {
            user_name: "alice".to_string(),
        }
    }

    #[tokio::test]
    async fn distributes_envelope_to_queue() {
        let queue = MemoryTaskQueue::new();
        let distributor = QueueTaskDistributor::new(Arc::new(queue.clone()));
        let options =
            DeliveryOptions::new(10, Duration::from_secs(10)).with_priority(Priority::Critical);

        let task_id = distribute_send_verify_email(&distributor, &payload(), options)
            .await
            .unwrap();

        let tasks = queue.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, task_id);
        assert_eq!(tasks[0].kind().unwrap(), TaskKind::SendVerifyEmail);
        assert_eq!(tasks[0].payload, serde_json::json!({"user_name": "alice"}));
        assert_eq!(tasks[0].max_retry, 10);
        assert_eq!(tasks[0].timeout_seconds, 10);
        assert_eq!(tasks[0].priority, Priority::Critical.as_i32());
    }

    #[tokio::test]
    async fn invalid_options_are_not_enqueued() {
        let queue = MemoryTaskQueue::new();
        let distributor = QueueTaskDistributor::new(Arc::new(queue.clone()));

        let err = distribute_send_verify_email(
            &distributor,
            &payload(),
            DeliveryOptions::new(-1, Duration::from_secs(10)),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DistributeError::InvalidOptions(_)));
        assert!(!err.is_retryable());
        assert!(queue.tasks().is_empty());
    }

    #[tokio::test]
    async fn unreachable_queue_surfaces_once_without_retry() {
        let queue = MemoryTaskQueue::new();
        queue.set_unavailable(true);
        let distributor = QueueTaskDistributor::new(Arc::new(queue.clone()));

        let err = distribute_send_verify_email(
            &distributor,
            &payload(),
            DeliveryOptions::new(3, Duration::from_secs(10)),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DistributeError::QueueUnavailable(_)));
        assert!(err.is_retryable());
        assert_eq!(queue.enqueue_attempts(), 1);
    }

    #[tokio::test]
    async fn delayed_envelope_is_scheduled_in_the_future() {
        let queue = MemoryTaskQueue::new();
        let distributor = QueueTaskDistributor::new(Arc::new(queue.clone()));
        let options = DeliveryOptions::new(3, Duration::from_secs(10))
            .with_process_in(Duration::from_secs(60));

        distribute_send_verify_email(&distributor, &payload(), options)
            .await
            .unwrap();

        assert!(!queue.tasks()[0].is_ready_to_run());
    }
}
