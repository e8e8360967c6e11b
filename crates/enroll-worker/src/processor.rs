//! Task processor: worker pool, LISTEN/NOTIFY or polling, deadlines and retry.
//!
//! Each claimed task runs one attempt under its own timeout. The handler's
//! classified outcome is reported back to the queue: success completes the
//! task, a retryable failure is rescheduled with exponential backoff while
//! the retry budget lasts, a permanent failure fails it at once.
//!
//! Shutdown: [`TaskProcessor::shutdown`] stops claiming. The pool task then
//! waits for attempts already running to finish or hit their deadline,
//! bounded by the longest timeout among claimed tasks, before it returns.

use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use enroll_core::models::{Task, TaskOutcome};
use enroll_core::Config;
use enroll_db::{TaskQueueStore, TASK_NOTIFY_CHANNEL};

use crate::handlers::{TaskContext, TaskDispatcher};

/// Maximum delay in seconds before retrying a failed task.
pub const MAX_RETRY_BACKOFF_SECS: u64 = 300;

/// Time a handler gets after its deadline to reach a cancellation check.
const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Headroom on the shutdown drain for recording the last outcomes.
const DRAIN_SLACK: Duration = Duration::from_secs(5);

/// Backoff before the retry that follows attempt `retry_count` (1s, 2s, 4s, ... capped).
pub fn compute_retry_backoff(retry_count: i32) -> Duration {
    let exp = retry_count.clamp(0, 31) as u32;
    Duration::from_secs(2_u64.saturating_pow(exp).min(MAX_RETRY_BACKOFF_SECS))
}

#[derive(Debug, Clone)]
pub struct TaskProcessorConfig {
    pub max_workers: usize,
    pub poll_interval_ms: u64,
    /// Interval in seconds between runs of the stale task reaper; 0 disables it.
    pub stale_task_reap_interval_secs: u64,
    /// Grace period in seconds added to a task's timeout before it is reaped.
    pub stale_task_grace_period_secs: i64,
}

impl Default for TaskProcessorConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            poll_interval_ms: 1000,
            stale_task_reap_interval_secs: 60,
            stale_task_grace_period_secs: 300,
        }
    }
}

impl From<&Config> for TaskProcessorConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_workers: config.task_queue_max_workers,
            poll_interval_ms: config.task_queue_poll_interval_ms,
            stale_task_reap_interval_secs: config.task_queue_stale_task_reap_interval_secs,
            stale_task_grace_period_secs: config.task_queue_stale_task_grace_period_secs,
        }
    }
}

#[derive(Clone)]
pub struct TaskProcessor {
    queue: Arc<dyn TaskQueueStore>,
    dispatcher: Arc<dyn TaskDispatcher>,
    config: TaskProcessorConfig,
    shutdown: CancellationToken,
    /// Longest per-attempt timeout among tasks claimed so far, in seconds.
    longest_timeout_secs: Arc<AtomicU64>,
}

impl TaskProcessor {
    pub fn new(
        queue: Arc<dyn TaskQueueStore>,
        dispatcher: Arc<dyn TaskDispatcher>,
        config: TaskProcessorConfig,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            config,
            shutdown: CancellationToken::new(),
            longest_timeout_secs: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn the worker pool.
    ///
    /// With a `pool`, workers also wake on Postgres NOTIFY for new tasks;
    /// otherwise they rely on polling alone.
    pub fn start(&self, pool: Option<sqlx::PgPool>) -> JoinHandle<()> {
        let processor = self.clone();
        tokio::spawn(async move { processor.worker_pool(pool).await })
    }

    /// Stop claiming new tasks. The handle returned by [`start`](Self::start)
    /// resolves once in-flight attempts are drained.
    pub fn shutdown(&self) {
        tracing::info!("Initiating task processor shutdown");
        self.shutdown.cancel();
    }

    async fn worker_pool(self, pool: Option<sqlx::PgPool>) {
        tracing::info!(
            max_workers = self.config.max_workers,
            poll_interval_ms = self.config.poll_interval_ms,
            listen_notify = pool.is_some(),
            "Task processor worker pool started"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        let (notify_tx, mut notify_rx) = mpsc::channel::<()>(16);
        if let Some(pool) = pool {
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = listen_for_new_tasks(pool, notify_tx) => {}
                    _ = shutdown.cancelled() => {}
                }
            });
        }

        if self.config.stale_task_reap_interval_secs > 0 {
            let queue = self.queue.clone();
            let shutdown = self.shutdown.clone();
            let reap_interval = Duration::from_secs(self.config.stale_task_reap_interval_secs);
            let grace_period = self.config.stale_task_grace_period_secs;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(reap_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(e) = queue.reap_stale_running(grace_period).await {
                                tracing::error!(error = %e, "Stale task reaper failed");
                            }
                        }
                        _ = shutdown.cancelled() => break,
                    }
                }
            });
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Task processor worker pool shutting down");
                    break;
                }
                _ = notify_rx.recv() => self.claim_available(&semaphore).await,
                _ = tokio::time::sleep(poll_interval) => self.claim_available(&semaphore).await,
            }
        }

        self.drain(&semaphore).await;
        tracing::info!("Task processor worker pool stopped");
    }

    /// Wait until every worker permit is back, i.e. no attempt is running.
    async fn drain(&self, semaphore: &Semaphore) {
        let workers = self.config.max_workers.max(1);
        let in_flight = workers - semaphore.available_permits();
        if in_flight == 0 {
            return;
        }

        let bound = Duration::from_secs(self.longest_timeout_secs.load(Ordering::SeqCst))
            + CANCEL_GRACE
            + DRAIN_SLACK;
        tracing::info!(
            in_flight,
            bound_secs = bound.as_secs(),
            "Waiting for in-flight task attempts"
        );

        let permits = u32::try_from(workers).unwrap_or(u32::MAX);
        match tokio::time::timeout(bound, semaphore.acquire_many(permits)).await {
            Ok(_) => tracing::info!("In-flight task attempts drained"),
            Err(_) => tracing::warn!(
                in_flight = workers - semaphore.available_permits(),
                "Drain timed out; remaining attempts are left to the stale task reaper"
            ),
        }
    }

    /// Claim and spawn tasks until the queue is empty or every worker is busy.
    async fn claim_available(&self, semaphore: &Arc<Semaphore>) {
        while !self.shutdown.is_cancelled() && self.claim_and_dispatch_one(semaphore).await {}
    }

    async fn claim_and_dispatch_one(&self, semaphore: &Arc<Semaphore>) -> bool {
        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::debug!("No workers available, skipping claim");
                return false;
            }
        };

        match self.queue.claim_next().await {
            Ok(Some(task)) => {
                self.longest_timeout_secs
                    .fetch_max(task.timeout().as_secs(), Ordering::SeqCst);
                let processor = self.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = processor.execute(&task).await {
                        tracing::error!(
                            task_id = %task.id,
                            error = %e,
                            "Failed to record task outcome"
                        );
                    }
                });
                true
            }
            Ok(None) => {
                tracing::trace!("No tasks available in queue");
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to claim task from queue");
                false
            }
        }
    }

    /// Claim one task and run it to completion on the current task.
    ///
    /// Returns `None` when nothing is due.
    pub async fn run_once(&self) -> Result<Option<TaskOutcome>> {
        match self.queue.claim_next().await? {
            Some(task) => Ok(Some(self.execute(&task).await?)),
            None => Ok(None),
        }
    }

    async fn execute(&self, task: &Task) -> Result<TaskOutcome> {
        let outcome = self.process(task).await;
        self.complete(task, &outcome).await?;
        Ok(outcome)
    }

    /// Run one attempt of `task` and classify the result.
    #[tracing::instrument(
        skip(self, task),
        fields(task_id = %task.id, task_type = %task.task_type, retry_count = task.retry_count)
    )]
    pub async fn process(&self, task: &Task) -> TaskOutcome {
        if task.retry_budget_exhausted() {
            return TaskOutcome::Permanent(format!(
                "retry budget exhausted: {} retries recorded, max_retry {}",
                task.retry_count, task.max_retry
            ));
        }

        let kind = match task.kind() {
            Ok(kind) => kind,
            Err(e) => return TaskOutcome::Permanent(e.to_string()),
        };

        let cancel = CancellationToken::new();
        let ctx = TaskContext::new(task.id, task.retry_count, cancel.clone());
        let timeout = task.timeout();

        let dispatch = self.dispatcher.dispatch(&ctx, kind, &task.payload);
        tokio::pin!(dispatch);

        tokio::select! {
            result = &mut dispatch => match result {
                Ok(()) => TaskOutcome::Success,
                Err(e) => e.outcome(),
            },
            _ = tokio::time::sleep(timeout) => {
                cancel.cancel();
                tracing::warn!(
                    timeout_secs = timeout.as_secs(),
                    "Task attempt exceeded its deadline"
                );
                // The handler stops at its next ensure_active() check or is dropped.
                match tokio::time::timeout(CANCEL_GRACE, &mut dispatch).await {
                    Ok(result) => tracing::debug!(
                        stopped_with_error = result.is_err(),
                        "Handler returned after cancellation"
                    ),
                    Err(_) => tracing::debug!("Handler did not observe cancellation, dropping it"),
                }
                TaskOutcome::Retry("deadline exceeded".to_string())
            }
        }
    }

    /// Report an attempt's outcome to the queue.
    pub async fn complete(&self, task: &Task, outcome: &TaskOutcome) -> Result<()> {
        match outcome {
            TaskOutcome::Success => {
                tracing::info!(task_id = %task.id, task_type = %task.task_type, "Task completed successfully");
                self.queue.mark_completed(task.id).await
            }
            TaskOutcome::Retry(reason) if task.can_retry() => {
                let backoff = compute_retry_backoff(task.retry_count);
                tracing::warn!(
                    task_id = %task.id,
                    reason = %reason,
                    retry_count = task.retry_count + 1,
                    max_retry = task.max_retry,
                    backoff_secs = backoff.as_secs(),
                    "Task attempt failed, scheduling retry"
                );
                self.queue
                    .schedule_retry(task.id, backoff.as_secs() as i64, reason)
                    .await
            }
            TaskOutcome::Retry(reason) => {
                let reason = format!(
                    "retries exhausted after {} attempts: {}",
                    task.retry_count + 1,
                    reason
                );
                tracing::error!(task_id = %task.id, reason = %reason, "Task failed after max retries");
                self.queue.mark_failed(task.id, &reason).await
            }
            TaskOutcome::Permanent(reason) => {
                tracing::error!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    reason = %reason,
                    "Task failed permanently, will not retry"
                );
                self.queue.mark_failed(task.id, reason).await
            }
        }
    }
}

async fn listen_for_new_tasks(pool: sqlx::PgPool, notify_tx: mpsc::Sender<()>) {
    loop {
        match sqlx::postgres::PgListener::connect_with(&pool).await {
            Ok(mut listener) => {
                if let Err(e) = listener.listen(TASK_NOTIFY_CHANNEL).await {
                    tracing::warn!(error = %e, "LISTEN failed, will retry");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
                while listener.recv().await.is_ok() {
                    if notify_tx.send(()).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "PgListener connect failed, will retry");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}
