use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::{DeliveryOptions, TaskEnvelope};

/// An envelope written in the same transaction as the row that triggered it,
/// waiting for the relay to hand it to the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: i64,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub options: DeliveryOptions,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for OutboxMessage {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let options: sqlx::types::Json<DeliveryOptions> = row.try_get("options")?;
        Ok(OutboxMessage {
            id: row.try_get("id")?,
            task_type: row.try_get("task_type")?,
            payload: row.try_get("payload")?,
            options: options.0,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl OutboxMessage {
    pub fn envelope(&self) -> TaskEnvelope {
        TaskEnvelope::from_parts(self.task_type.clone(), self.payload.clone(), self.options)
    }
}
