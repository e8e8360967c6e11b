use anyhow::{Context, Result};
use chrono::Utc;
use enroll_core::models::{Task, TaskEnvelope};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

/// Channel workers LISTEN on for new-task wakeups.
pub const TASK_NOTIFY_CHANNEL: &str = "enroll_new_task";

const TASK_COLUMNS: &str = r#"
    id,
    task_type,
    status,
    priority,
    payload,
    retry_count,
    max_retry,
    timeout_seconds,
    scheduled_at,
    started_at,
    completed_at,
    last_error,
    created_at,
    updated_at
"#;

#[derive(Clone)]
pub struct TaskRepository {
    pool: PgPool,
}

impl TaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist an envelope as a pending task and notify listening workers.
    #[tracing::instrument(skip(self, envelope), fields(task_type = %envelope.task_type()))]
    pub async fn enqueue(&self, envelope: &TaskEnvelope) -> Result<Task> {
        let options = envelope.options();
        let scheduled_at = match options.process_in {
            Some(delay) => {
                Utc::now()
                    + chrono::Duration::from_std(delay)
                        .context("process_in delay out of range")?
            }
            None => Utc::now(),
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for task creation")?;

        let task: Task = sqlx::query_as::<Postgres, Task>(&format!(
            r#"
            INSERT INTO tasks (
                task_type, status, priority, payload, max_retry, timeout_seconds, scheduled_at
            )
            VALUES ($1, 'pending', $2, $3, $4, $5, $6)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(envelope.task_type())
        .bind(options.priority.as_i32())
        .bind(envelope.payload())
        .bind(options.max_retry)
        .bind(options.timeout_seconds())
        .bind(scheduled_at)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to insert task into database")?;

        // Workers fall back to polling if the notification is lost.
        if let Err(e) = sqlx::query("SELECT pg_notify($1, '')")
            .bind(TASK_NOTIFY_CHANNEL)
            .execute(&mut *tx)
            .await
        {
            tracing::warn!(
                error = %e,
                task_id = %task.id,
                "Failed to send pg_notify for new task, workers will discover task via polling"
            );
        }

        tx.commit()
            .await
            .context("Failed to commit task creation")?;

        tracing::info!(
            task_id = %task.id,
            task_type = %task.task_type,
            priority = task.priority,
            queue = options.priority.queue_name(),
            max_retry = task.max_retry,
            scheduled_at = %task.scheduled_at,
            "Task enqueued"
        );

        Ok(task)
    }

    /// Atomically claim the next due task, highest priority first.
    ///
    /// `FOR UPDATE SKIP LOCKED` keeps concurrent workers from claiming the
    /// same row.
    #[tracing::instrument(skip(self))]
    pub async fn claim_next_task(&self) -> Result<Option<Task>> {
        let task = sqlx::query_as::<Postgres, Task>(&format!(
            r#"
            UPDATE tasks
            SET status = 'running',
                started_at = NOW(),
                updated_at = NOW()
            WHERE id = (
                SELECT id
                FROM tasks
                WHERE status IN ('pending', 'retrying')
                    AND scheduled_at <= NOW()
                ORDER BY priority DESC, scheduled_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to claim next task")?;

        if let Some(ref task) = task {
            tracing::debug!(
                task_id = %task.id,
                task_type = %task.task_type,
                retry_count = task.retry_count,
                "Task claimed"
            );
        }

        Ok(task)
    }

    #[tracing::instrument(skip(self))]
    pub async fn mark_completed(&self, task_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'completed',
                completed_at = NOW(),
                last_error = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark task as completed")?;

        tracing::info!(task_id = %task_id, "Task completed");
        Ok(())
    }

    /// Put a failed attempt back in the queue after `backoff_secs`.
    #[tracing::instrument(skip(self, reason))]
    pub async fn schedule_retry(&self, task_id: Uuid, backoff_secs: i64, reason: &str) -> Result<()> {
        let row: Option<(i32, i32)> = sqlx::query_as(
            r#"
            UPDATE tasks
            SET status = 'retrying',
                retry_count = retry_count + 1,
                scheduled_at = NOW() + ($2 * INTERVAL '1 second'),
                started_at = NULL,
                last_error = $3,
                updated_at = NOW()
            WHERE id = $1
            RETURNING retry_count, max_retry
            "#,
        )
        .bind(task_id)
        .bind(backoff_secs as f64)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to schedule task retry")?;

        if let Some((retry_count, max_retry)) = row {
            tracing::info!(
                task_id = %task_id,
                retry_count = retry_count,
                max_retry = max_retry,
                backoff_secs = backoff_secs,
                "Task retry scheduled"
            );
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, reason))]
    pub async fn mark_failed(&self, task_id: Uuid, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'failed',
                completed_at = NOW(),
                last_error = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(reason)
        .execute(&self.pool)
        .await
        .context("Failed to mark task as failed")?;

        tracing::error!(task_id = %task_id, reason = %reason, "Task failed");
        Ok(())
    }

    /// Requeue tasks left `running` past their timeout plus `grace_period_secs`.
    ///
    /// The lost attempt counts against the retry budget.
    #[tracing::instrument(skip(self))]
    pub async fn reap_stale_running_tasks(&self, grace_period_secs: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'retrying',
                retry_count = retry_count + 1,
                scheduled_at = NOW(),
                started_at = NULL,
                last_error = 'worker lost while running',
                updated_at = NOW()
            WHERE status = 'running'
                AND started_at < NOW() - ((timeout_seconds + $1) * INTERVAL '1 second')
            "#,
        )
        .bind(grace_period_secs)
        .execute(&self.pool)
        .await
        .context("Failed to reap stale running tasks")?;

        let count = result.rows_affected();
        if count > 0 {
            tracing::warn!(count = count, "Requeued stale running tasks");
        }
        Ok(count)
    }
}
