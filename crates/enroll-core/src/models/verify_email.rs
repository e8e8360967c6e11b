use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One emailed verification secret for a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct VerifyEmail {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub secret_code: String,
    pub is_used: bool,
    pub created_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
}

impl VerifyEmail {
    /// Unused and not yet expired.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.is_used && self.expired_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateVerifyEmailParams {
    pub username: String,
    pub email: String,
    pub secret_code: String,
    pub ttl: chrono::Duration,
}
