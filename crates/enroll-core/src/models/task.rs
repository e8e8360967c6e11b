use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Closed set of task kinds the worker knows how to execute.
///
/// The wire tag (`Display`/`FromStr`) is what gets persisted in the queue, so
/// a row whose tag does not parse is a task type with no handler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    SendVerifyEmail,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::SendVerifyEmail => "send_verify_email",
        }
    }
}

impl Display for TaskKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send_verify_email" => Ok(TaskKind::SendVerifyEmail),
            _ => Err(anyhow::anyhow!("Unknown task type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(
    feature = "sqlx",
    derive(sqlx::Type),
    sqlx(type_name = "task_status", rename_all = "lowercase")
)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Retrying,
    Failed,
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Retrying => write!(f, "retrying"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "retrying" => Ok(TaskStatus::Retrying),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid task status: {}", s)),
        }
    }
}

/// Queue priority class. Higher weight is claimed first.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 3,
    #[default]
    Normal = 5,
    High = 7,
    Critical = 10,
}

impl Priority {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    /// Queue name reported in logs for this priority class.
    pub fn queue_name(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "default",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl From<Priority> for i32 {
    fn from(priority: Priority) -> Self {
        priority as i32
    }
}

impl FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" | "default" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(anyhow::anyhow!("Invalid priority: {}", other)),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OptionsError {
    #[error("max_retry must be >= 0, got {0}")]
    NegativeMaxRetry(i32),
    #[error("per-attempt timeout must be greater than zero")]
    ZeroTimeout,
}

/// Per-envelope delivery settings handed to the queue alongside the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOptions {
    pub max_retry: i32,
    pub timeout: Duration,
    #[serde(default)]
    pub priority: Priority,
    /// Delay before the first attempt becomes claimable.
    #[serde(default)]
    pub process_in: Option<Duration>,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            max_retry: 3,
            timeout: Duration::from_secs(3600),
            priority: Priority::Normal,
            process_in: None,
        }
    }
}

impl DeliveryOptions {
    pub fn new(max_retry: i32, timeout: Duration) -> Self {
        Self {
            max_retry,
            timeout,
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_process_in(mut self, delay: Duration) -> Self {
        self.process_in = Some(delay);
        self
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.max_retry < 0 {
            return Err(OptionsError::NegativeMaxRetry(self.max_retry));
        }
        if self.timeout.is_zero() {
            return Err(OptionsError::ZeroTimeout);
        }
        Ok(())
    }

    /// Timeout in whole seconds as stored by the queue (rounded up, at least 1).
    pub fn timeout_seconds(&self) -> i32 {
        let secs = self.timeout.as_secs() + u64::from(self.timeout.subsec_nanos() > 0);
        secs.clamp(1, i32::MAX as u64) as i32
    }
}

/// Trait for type-safe task payloads
pub trait TaskPayload: Serialize + for<'de> Deserialize<'de> {
    fn kind() -> TaskKind;
}

/// Payload of the verification email task. Carries only the username so the
/// handler always reads the user's current email at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendVerifyEmailPayload {
    pub user_name: String,
}

impl TaskPayload for SendVerifyEmailPayload {
    fn kind() -> TaskKind {
        TaskKind::SendVerifyEmail
    }
}

/// Immutable description of one unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    task_type: String,
    payload: serde_json::Value,
    options: DeliveryOptions,
}

impl TaskEnvelope {
    pub fn new<P: TaskPayload>(
        payload: &P,
        options: DeliveryOptions,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            task_type: P::kind().to_string(),
            payload: serde_json::to_value(payload)?,
            options,
        })
    }

    /// Rebuild an envelope from stored parts (outbox rows, tests).
    pub fn from_parts(
        task_type: impl Into<String>,
        payload: serde_json::Value,
        options: DeliveryOptions,
    ) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            options,
        }
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn options(&self) -> &DeliveryOptions {
        &self.options
    }

    pub fn kind(&self) -> anyhow::Result<TaskKind> {
        self.task_type.parse()
    }
}

/// A queued envelope as tracked by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: String,
    pub status: TaskStatus,
    pub priority: i32,
    pub payload: serde_json::Value,
    pub retry_count: i32,
    pub max_retry: i32,
    pub timeout_seconds: i32,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for Task {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Task {
            id: row.try_get("id")?,
            task_type: row.try_get("task_type")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            payload: row.try_get("payload")?,
            retry_count: row.try_get("retry_count")?,
            max_retry: row.try_get("max_retry")?,
            timeout_seconds: row.try_get("timeout_seconds")?,
            scheduled_at: row.try_get("scheduled_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl Task {
    pub fn kind(&self) -> anyhow::Result<TaskKind> {
        self.task_type.parse()
    }

    pub fn is_ready_to_run(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Retrying)
            && self.scheduled_at <= Utc::now()
    }

    /// Whether a failed attempt may be rescheduled.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retry
    }

    /// True once more attempts have been made than the budget allows
    /// (e.g. after a crashed worker's attempt was reaped).
    pub fn retry_budget_exhausted(&self) -> bool {
        self.retry_count > self.max_retry
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1) as u64)
    }

    /// Extract the payload as a typed struct, returning an error on failure.
    pub fn try_payload_as<P: TaskPayload>(&self) -> Result<P, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Result of one attempt, reported back to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Retry(String),
    Permanent(String),
}
