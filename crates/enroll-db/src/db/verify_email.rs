use anyhow::{Context, Result};
use enroll_core::models::{CreateVerifyEmailParams, VerifyEmail};
use sqlx::{PgPool, Postgres};

use crate::db::transaction::with_transaction;

const VERIFY_EMAIL_COLUMNS: &str =
    "id, username, email, secret_code, is_used, created_at, expired_at";

#[derive(Clone)]
pub struct VerifyEmailRepository {
    pool: PgPool,
}

impl VerifyEmailRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a verification record unless the user already has an active one.
    ///
    /// Runs under a per-username advisory lock so concurrent deliveries of the
    /// same task serialise here. An active record (unused, unexpired) for the
    /// same address is returned as is; otherwise the user's other active
    /// records are expired and a fresh one is inserted.
    #[tracing::instrument(skip(self, params), fields(user_name = %params.username))]
    pub async fn create_verify_email(&self, params: CreateVerifyEmailParams) -> Result<VerifyEmail> {
        let record = with_transaction(&self.pool, move |tx| {
            Box::pin(async move {
                sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                    .bind(&params.username)
                    .execute(&mut **tx)
                    .await?;

                let active = sqlx::query_as::<Postgres, VerifyEmail>(&format!(
                    r#"
                    SELECT {VERIFY_EMAIL_COLUMNS}
                    FROM verify_emails
                    WHERE username = $1
                        AND email = $2
                        AND is_used = FALSE
                        AND expired_at > NOW()
                    ORDER BY created_at DESC
                    LIMIT 1
                    "#
                ))
                .bind(&params.username)
                .bind(&params.email)
                .fetch_optional(&mut **tx)
                .await?;

                if let Some(active) = active {
                    tracing::debug!(
                        verify_email_id = active.id,
                        "Active verification record exists, reusing it"
                    );
                    return Ok::<_, sqlx::Error>(active);
                }

                let retired = sqlx::query(
                    r#"
                    UPDATE verify_emails
                    SET expired_at = NOW()
                    WHERE username = $1
                        AND is_used = FALSE
                        AND expired_at > NOW()
                    "#,
                )
                .bind(&params.username)
                .execute(&mut **tx)
                .await?
                .rows_affected();

                if retired > 0 {
                    tracing::debug!(retired = retired, "Retired stale verification records");
                }

                let ttl_secs = params.ttl.num_seconds().max(1);
                let record = sqlx::query_as::<Postgres, VerifyEmail>(&format!(
                    r#"
                    INSERT INTO verify_emails (username, email, secret_code, expired_at)
                    VALUES ($1, $2, $3, NOW() + ($4 * INTERVAL '1 second'))
                    RETURNING {VERIFY_EMAIL_COLUMNS}
                    "#
                ))
                .bind(&params.username)
                .bind(&params.email)
                .bind(&params.secret_code)
                .bind(ttl_secs as f64)
                .fetch_one(&mut **tx)
                .await?;

                tracing::info!(verify_email_id = record.id, "Verification record created");
                Ok(record)
            })
        })
        .await
        .context("Failed to create verification record")?;

        Ok(record)
    }

    /// Active (unused, unexpired) records for a user, newest first.
    #[tracing::instrument(skip(self))]
    pub async fn list_active(&self, username: &str) -> Result<Vec<VerifyEmail>> {
        let records = sqlx::query_as::<Postgres, VerifyEmail>(&format!(
            r#"
            SELECT {VERIFY_EMAIL_COLUMNS}
            FROM verify_emails
            WHERE username = $1
                AND is_used = FALSE
                AND expired_at > NOW()
            ORDER BY created_at DESC
            "#
        ))
        .bind(username)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list active verification records")?;

        Ok(records)
    }
}
