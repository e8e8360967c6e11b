//! Database transaction utilities

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use sqlx::{PgPool, Postgres, Transaction};

/// Execute a closure within a database transaction.
///
/// Commits when the closure succeeds, rolls back otherwise.
///
/// ```ignore
/// with_transaction(pool, |tx| Box::pin(async move {
///     sqlx::query("INSERT INTO ...").execute(&mut **tx).await?;
///     Ok::<_, sqlx::Error>(())
/// }))
/// .await
/// ```
pub async fn with_transaction<F, R, E>(pool: &PgPool, f: F) -> Result<R>
where
    F: for<'a> FnOnce(&'a mut Transaction<'static, Postgres>) -> BoxFuture<'a, Result<R, E>>,
    E: Into<anyhow::Error>,
{
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;

    match f(&mut tx).await {
        Ok(result) => {
            tx.commit().await.context("Failed to commit transaction")?;
            Ok(result)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(error = %rollback_err, "Failed to roll back transaction");
            }
            Err(e.into())
        }
    }
}
