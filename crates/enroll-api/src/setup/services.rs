//! Repositories, registration service and background workers

use anyhow::{Context, Result};
use enroll_core::{Config, EnqueuePolicy};
use enroll_db::{OutboxRepository, TaskRepository, UserRepository, VerifyEmailRepository};
use enroll_services::{EmailSender, LogEmailSender, SmtpEmailSender};
use enroll_worker::{
    Handlers, OutboxRelay, OutboxRelayConfig, QueueTaskDistributor, SendVerifyEmailHandler,
    TaskDistributor, TaskProcessor, TaskProcessorConfig, VerifyEmailSettings,
};
use sqlx::PgPool;
use std::sync::Arc;

use crate::services::registration::RegistrationService;

pub struct Services {
    pub registration: RegistrationService,
    pub processor: TaskProcessor,
    /// Present only under the outbox enqueue policy.
    pub relay: Option<OutboxRelay>,
}

fn setup_mailer(config: &Config) -> Result<Arc<dyn EmailSender>> {
    match &config.smtp {
        Some(smtp) => Ok(Arc::new(
            SmtpEmailSender::from_config(smtp).context("Failed to initialize SMTP sender")?,
        )),
        None => {
            tracing::warn!("SMTP_HOST/SMTP_FROM not set; verification emails will only be logged");
            Ok(Arc::new(LogEmailSender))
        }
    }
}

pub fn initialize_services(config: &Config, pool: &PgPool) -> Result<Services> {
    let users = Arc::new(UserRepository::new(pool.clone()));
    let verify_emails = Arc::new(VerifyEmailRepository::new(pool.clone()));
    let queue = Arc::new(TaskRepository::new(pool.clone()));
    let distributor: Arc<dyn TaskDistributor> = Arc::new(QueueTaskDistributor::new(queue.clone()));

    let handlers = Handlers::new(SendVerifyEmailHandler::new(
        users.clone(),
        verify_emails,
        setup_mailer(config)?,
        VerifyEmailSettings::from_config(config),
    ));
    let processor = TaskProcessor::new(
        queue,
        Arc::new(handlers),
        TaskProcessorConfig::from(config),
    );

    let relay = match config.enqueue_policy {
        EnqueuePolicy::Outbox => Some(OutboxRelay::new(
            Arc::new(OutboxRepository::new(pool.clone())),
            distributor.clone(),
            OutboxRelayConfig::from(config),
        )),
        EnqueuePolicy::AfterCommit => None,
    };

    let registration = RegistrationService::new(
        users,
        distributor,
        config.enqueue_policy,
        config.enqueue_failure_mode,
        config.verify_email_options(),
    )
    .context("Invalid verification email delivery options")?;

    tracing::info!(
        max_workers = config.task_queue_max_workers,
        enqueue_policy = ?config.enqueue_policy,
        "Services initialized"
    );

    Ok(Services {
        registration,
        processor,
        relay,
    })
}
