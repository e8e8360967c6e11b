//! In-memory stores, mailer and dispatcher for tests without a database.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use enroll_core::error::AppError;
use enroll_core::models::{
    CreateUserParams, CreateVerifyEmailParams, OutboxMessage, Task, TaskEnvelope, TaskKind,
    TaskStatus, User, VerifyEmail,
};
use enroll_core::TaskError;
use enroll_db::{AfterCreate, OutboxStore, TaskQueueStore, UserStore, VerifyEmailStore};
use enroll_services::{EmailMessage, EmailSender, MailError};

use crate::handlers::{TaskContext, TaskDispatcher};

pub fn sample_user(username: &str, email: &str) -> User {
    let now = Utc::now();
    User {
        username: username.to_string(),
        hashed_password: "$argon2id$v=19$m=19456,t=2,p=1$c2FsdA$aGFzaA".to_string(),
        full_name: format!("{} Example", username),
        email: email.to_string(),
        is_email_verified: false,
        password_changed_at: now,
        created_at: now,
    }
}

/// Builds a due task row the way the queue would after enqueueing `envelope`.
pub fn task_from_envelope(envelope: &TaskEnvelope) -> Task {
    let now = Utc::now();
    let options = envelope.options();
    let scheduled_at = options
        .process_in
        .and_then(|d| ChronoDuration::from_std(d).ok())
        .map(|d| now + d)
        .unwrap_or(now);
    Task {
        id: Uuid::new_v4(),
        task_type: envelope.task_type().to_string(),
        status: TaskStatus::Pending,
        priority: options.priority.as_i32(),
        payload: envelope.payload().clone(),
        retry_count: 0,
        max_retry: options.max_retry,
        timeout_seconds: options.timeout_seconds(),
        scheduled_at,
        started_at: None,
        completed_at: None,
        last_error: None,
        created_at: now,
        updated_at: now,
    }
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MemoryUserStore {
    users: Arc<Mutex<HashMap<String, User>>>,
    outbox: Option<MemoryOutboxStore>,
    reads: Arc<AtomicUsize>,
    fail_reads: Arc<AtomicBool>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose `create_user_with_outbox` writes into `outbox`.
    pub fn with_outbox(outbox: MemoryOutboxStore) -> Self {
        Self {
            outbox: Some(outbox),
            ..Self::default()
        }
    }

    pub fn add_user(&self, user: User) {
        self.users
            .lock()
            .unwrap()
            .insert(user.username.clone(), user);
    }

    pub fn user(&self, username: &str) -> Option<User> {
        self.users.lock().unwrap().get(username).cloned()
    }

    pub fn len(&self) -> usize {
        self.users.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Make `get_user` fail as if storage were unreachable.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn insert_new(&self, params: CreateUserParams) -> Result<User, AppError> {
        let mut users = self.users.lock().unwrap();
        if users.contains_key(&params.username) {
            return Err(AppError::AlreadyExists(format!(
                "username {} is already taken",
                params.username
            )));
        }
        if users.values().any(|u| u.email == params.email) {
            return Err(AppError::AlreadyExists(format!(
                "email {} is already registered",
                params.email
            )));
        }
        let now = Utc::now();
        let user = User {
            username: params.username,
            hashed_password: params.hashed_password,
            full_name: params.full_name,
            email: params.email,
            is_email_verified: false,
            password_changed_at: now,
            created_at: now,
        };
        users.insert(user.username.clone(), user.clone());
        Ok(user)
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn create_user(&self, params: CreateUserParams) -> Result<User, AppError> {
        self.insert_new(params)
    }

    async fn create_user_with_side_effect(
        &self,
        params: CreateUserParams,
        after_create: AfterCreate,
    ) -> Result<User, AppError> {
        let user = self.insert_new(params)?;
        after_create(user.clone()).await?;
        Ok(user)
    }

    async fn create_user_with_outbox(
        &self,
        params: CreateUserParams,
        envelope: &TaskEnvelope,
    ) -> Result<User, AppError> {
        let outbox = self
            .outbox
            .as_ref()
            .ok_or_else(|| AppError::Internal("no outbox configured".to_string()))?;
        let user = self.insert_new(params)?;
        outbox.push(envelope);
        Ok(user)
    }

    async fn get_user(&self, username: &str) -> Result<Option<User>, AppError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(AppError::Internal("connection refused".to_string()));
        }
        Ok(self.user(username))
    }
}

// ---------------------------------------------------------------------------
// Verification records
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MemoryVerifyEmailStore {
    records: Arc<Mutex<Vec<VerifyEmail>>>,
    next_id: Arc<AtomicI64>,
    writes: Arc<AtomicUsize>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryVerifyEmailStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<VerifyEmail> {
        self.records.lock().unwrap().clone()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl VerifyEmailStore for MemoryVerifyEmailStore {
    async fn create_verify_email(&self, params: CreateVerifyEmailParams) -> Result<VerifyEmail> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }

        let now = Utc::now();
        let mut records = self.records.lock().unwrap();
        if let Some(active) = records
            .iter()
            .rev()
            .find(|r| r.username == params.username && r.email == params.email && r.is_active(now))
        {
            return Ok(active.clone());
        }
        for record in records
            .iter_mut()
            .filter(|r| r.username == params.username && r.is_active(now))
        {
            record.expired_at = now;
        }

        let record = VerifyEmail {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            username: params.username,
            email: params.email,
            secret_code: params.secret_code,
            is_used: false,
            created_at: now,
            expired_at: now + params.ttl,
        };
        records.push(record.clone());
        Ok(record)
    }

    async fn list_active(&self, username: &str) -> Result<Vec<VerifyEmail>> {
        let now = Utc::now();
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|r| r.username == username && r.is_active(now))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Task queue
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MemoryTaskQueue {
    tasks: Arc<Mutex<Vec<Task>>>,
    unavailable: Arc<AtomicBool>,
    enqueue_attempts: Arc<AtomicUsize>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.lock().unwrap().clone()
    }

    pub fn task(&self, id: Uuid) -> Option<Task> {
        self.tasks.lock().unwrap().iter().find(|t| t.id == id).cloned()
    }

    /// Insert a row directly, bypassing the distributor.
    pub fn push(&self, task: Task) {
        self.tasks.lock().unwrap().push(task);
    }

    pub fn enqueue_attempts(&self) -> usize {
        self.enqueue_attempts.load(Ordering::SeqCst)
    }

    /// Make `enqueue` fail as if the queue could not be reached.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Skip pending backoff so retrying tasks can be claimed right away.
    pub fn make_due(&self) {
        let now = Utc::now();
        for task in self.tasks.lock().unwrap().iter_mut() {
            if matches!(task.status, TaskStatus::Pending | TaskStatus::Retrying) {
                task.scheduled_at = now;
            }
        }
    }

    /// Backdate `started_at` of running tasks, as if their worker vanished.
    pub fn age_running(&self, by: Duration) {
        let by = ChronoDuration::from_std(by).unwrap();
        for task in self.tasks.lock().unwrap().iter_mut() {
            if let (TaskStatus::Running, Some(started)) = (task.status, task.started_at) {
                task.started_at = Some(started - by);
            }
        }
    }

    fn update(&self, id: Uuid, f: impl FnOnce(&mut Task)) -> Result<()> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| anyhow::anyhow!("task {} not found", id))?;
        f(task);
        task.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl TaskQueueStore for MemoryTaskQueue {
    async fn enqueue(&self, envelope: &TaskEnvelope) -> Result<Uuid> {
        self.enqueue_attempts.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        let task = task_from_envelope(envelope);
        let id = task.id;
        self.push(task);
        Ok(id)
    }

    async fn claim_next(&self) -> Result<Option<Task>> {
        let now = Utc::now();
        let mut tasks = self.tasks.lock().unwrap();
        let next = tasks
            .iter_mut()
            .filter(|t| t.is_ready_to_run())
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.scheduled_at.cmp(&a.scheduled_at))
            });
        Ok(next.map(|task| {
            task.status = TaskStatus::Running;
            task.started_at = Some(now);
            task.updated_at = now;
            task.clone()
        }))
    }

    async fn mark_completed(&self, task_id: Uuid) -> Result<()> {
        self.update(task_id, |t| {
            t.status = TaskStatus::Completed;
            t.completed_at = Some(Utc::now());
            t.last_error = None;
        })
    }

    async fn schedule_retry(&self, task_id: Uuid, backoff_secs: i64, reason: &str) -> Result<()> {
        self.update(task_id, |t| {
            t.status = TaskStatus::Retrying;
            t.retry_count += 1;
            t.scheduled_at = Utc::now() + ChronoDuration::seconds(backoff_secs);
            t.started_at = None;
            t.last_error = Some(reason.to_string());
        })
    }

    async fn mark_failed(&self, task_id: Uuid, reason: &str) -> Result<()> {
        self.update(task_id, |t| {
            t.status = TaskStatus::Failed;
            t.completed_at = Some(Utc::now());
            t.last_error = Some(reason.to_string());
        })
    }

    async fn reap_stale_running(&self, grace_period_secs: i64) -> Result<u64> {
        let now = Utc::now();
        let mut reaped = 0;
        for task in self.tasks.lock().unwrap().iter_mut() {
            let Some(started) = task.started_at else {
                continue;
            };
            let limit = ChronoDuration::seconds(task.timeout_seconds as i64 + grace_period_secs);
            if task.status == TaskStatus::Running && started + limit < now {
                task.status = TaskStatus::Retrying;
                task.retry_count += 1;
                task.scheduled_at = now;
                task.started_at = None;
                task.last_error = Some("worker lost while running".to_string());
                reaped += 1;
            }
        }
        Ok(reaped)
    }
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MemoryOutboxStore {
    messages: Arc<Mutex<Vec<OutboxMessage>>>,
    next_id: Arc<AtomicI64>,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, envelope: &TaskEnvelope) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.messages.lock().unwrap().push(OutboxMessage {
            id,
            task_type: envelope.task_type().to_string(),
            payload: envelope.payload().clone(),
            options: *envelope.options(),
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
        });
        id
    }

    pub fn messages(&self) -> Vec<OutboxMessage> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn fetch_pending(&self, limit: i64) -> Result<Vec<OutboxMessage>> {
        let mut messages = self.messages.lock().unwrap();
        Ok(messages
            .iter_mut()
            .take(limit.max(0) as usize)
            .map(|m| {
                m.attempts += 1;
                m.clone()
            })
            .collect())
    }

    async fn delete(&self, id: i64) -> Result<()> {
        self.messages.lock().unwrap().retain(|m| m.id != id);
        Ok(())
    }

    async fn record_failure(&self, id: i64, error: &str) -> Result<()> {
        if let Some(m) = self.messages.lock().unwrap().iter_mut().find(|m| m.id == id) {
            m.last_error = Some(error.to_string());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mailer
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct RecordingEmailSender {
    sent: Arc<Mutex<Vec<EmailMessage>>>,
    attempts: Arc<AtomicUsize>,
    failure: Arc<Mutex<Option<MailError>>>,
}

impl RecordingEmailSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every send with `error` until cleared with `None`.
    pub fn fail_with(&self, error: Option<MailError>) {
        *self.failure.lock().unwrap() = error;
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmailSender for RecordingEmailSender {
    async fn send_email(&self, message: &EmailMessage) -> Result<(), MailError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scripted {
    Succeed,
    FailRetryable,
    FailPermanent,
    /// Never finishes on its own; exercises the attempt deadline.
    Hang,
    /// Works in short steps, checking for cancellation between them.
    Cooperative,
}

/// Dispatcher with fixed behaviour that counts its calls.
#[derive(Clone)]
pub struct ScriptedDispatcher {
    behavior: Scripted,
    calls: Arc<AtomicUsize>,
    kinds: Arc<Mutex<Vec<TaskKind>>>,
    cancellations: Arc<AtomicUsize>,
}

impl ScriptedDispatcher {
    pub fn new(behavior: Scripted) -> Self {
        Self {
            behavior,
            calls: Arc::new(AtomicUsize::new(0)),
            kinds: Arc::new(Mutex::new(Vec::new())),
            cancellations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Attempts that stopped because they saw their cancellation.
    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn kinds(&self) -> Vec<TaskKind> {
        self.kinds.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskDispatcher for ScriptedDispatcher {
    async fn dispatch(
        &self,
        ctx: &TaskContext,
        kind: TaskKind,
        _payload: &serde_json::Value,
    ) -> Result<(), TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.kinds.lock().unwrap().push(kind);
        match self.behavior {
            Scripted::Succeed => Ok(()),
            Scripted::FailRetryable => Err(TaskError::retryable(anyhow::anyhow!("mailer unreachable"))),
            Scripted::FailPermanent => Err(TaskError::permanent(anyhow::anyhow!("bad input"))),
            Scripted::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                ctx.ensure_active()
            }
            Scripted::Cooperative => loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if let Err(e) = ctx.ensure_active() {
                    self.cancellations.fetch_add(1, Ordering::SeqCst);
                    return Err(e);
                }
            },
        }
    }
}
