use anyhow::{Context, Result};
use enroll_core::models::{OutboxMessage, TaskEnvelope};
use sqlx::{PgExecutor, PgPool, Postgres};

/// Write an envelope to the outbox on the caller's connection or transaction.
pub(crate) async fn insert_outbox_message<'e, E>(
    executor: E,
    envelope: &TaskEnvelope,
) -> Result<i64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO task_outbox (task_type, payload, options)
        VALUES ($1, $2, $3)
        RETURNING id
        "#,
    )
    .bind(envelope.task_type())
    .bind(envelope.payload())
    .bind(sqlx::types::Json(envelope.options()))
    .fetch_one(executor)
    .await?;

    Ok(id)
}

#[derive(Clone)]
pub struct OutboxRepository {
    pool: PgPool,
}

impl OutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Oldest pending messages, counting this fetch as an attempt.
    ///
    /// Row locks are held only for this statement, so two relays fetching
    /// at the same time can both receive a message. A message stays in the
    /// outbox until deleted and may be relayed more than once; the
    /// verification record dedupe absorbs the repeat.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_pending(&self, limit: i64) -> Result<Vec<OutboxMessage>> {
        let mut messages = sqlx::query_as::<Postgres, OutboxMessage>(
            r#"
            UPDATE task_outbox
            SET attempts = attempts + 1
            WHERE id IN (
                SELECT id
                FROM task_outbox
                ORDER BY created_at ASC, id ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, task_type, payload, options, attempts, last_error, created_at
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch pending outbox messages")?;

        messages.sort_by_key(|m| (m.created_at, m.id));
        Ok(messages)
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM task_outbox WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete outbox message")?;
        Ok(())
    }

    #[tracing::instrument(skip(self, error))]
    pub async fn record_failure(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query("UPDATE task_outbox SET last_error = $2 WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await
            .context("Failed to record outbox failure")?;
        Ok(())
    }
}
