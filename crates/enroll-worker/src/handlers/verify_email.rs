use anyhow::Context;
use rand::distr::{Alphanumeric, SampleString};
use std::sync::Arc;

use enroll_core::models::{CreateVerifyEmailParams, SendVerifyEmailPayload};
use enroll_core::{Config, TaskError, TaskResultExt};
use enroll_db::{UserStore, VerifyEmailStore};
use enroll_services::{EmailMessage, EmailSender, MailError};

use super::TaskContext;

const SECRET_CODE_LEN: usize = 32;
const SUBJECT: &str = "Welcome to Enroll";

#[derive(Debug, Clone)]
pub struct VerifyEmailSettings {
    /// Prefix of the verification link, e.g. `http://localhost:8080/v1`.
    pub base_url: String,
    /// Lifetime of a verification record.
    pub ttl: chrono::Duration,
}

impl VerifyEmailSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.verify_email_base_url.clone(),
            ttl: config.verify_email_ttl(),
        }
    }

    pub fn verify_link(&self, email_id: i64, secret_code: &str) -> String {
        format!(
            "{}/verify_email?email_id={}&secret_code={}",
            self.base_url.trim_end_matches('/'),
            email_id,
            urlencoding::encode(secret_code)
        )
    }
}

fn generate_secret_code() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), SECRET_CODE_LEN)
}

fn welcome_body(full_name: &str, link: &str) -> String {
    format!(
        "Hello {full_name},<br/>\n\
         Thank you for registering with us!<br/>\n\
         Please <a href=\"{link}\">click here</a> to verify your email address.<br/>\n"
    )
}

/// Sends the registration verification email.
///
/// The payload only names the user; the address is read at execution time
/// so a changed email between enqueue and delivery is honoured.
#[derive(Clone)]
pub struct SendVerifyEmailHandler {
    users: Arc<dyn UserStore>,
    verify_emails: Arc<dyn VerifyEmailStore>,
    mailer: Arc<dyn EmailSender>,
    settings: VerifyEmailSettings,
}

impl SendVerifyEmailHandler {
    pub fn new(
        users: Arc<dyn UserStore>,
        verify_emails: Arc<dyn VerifyEmailStore>,
        mailer: Arc<dyn EmailSender>,
        settings: VerifyEmailSettings,
    ) -> Self {
        Self {
            users,
            verify_emails,
            mailer,
            settings,
        }
    }

    #[tracing::instrument(skip(self, payload), fields(task_id = %ctx.task_id, attempt = ctx.attempt))]
    pub async fn handle(
        &self,
        ctx: &TaskContext,
        payload: &serde_json::Value,
    ) -> Result<(), TaskError> {
        let payload: SendVerifyEmailPayload = serde_json::from_value(payload.clone())
            .map_err(|e| anyhow::anyhow!("invalid send_verify_email payload: {}", e))
            .permanent()?;

        ctx.ensure_active()?;
        let user = match self.users.get_user(&payload.user_name).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                tracing::warn!(
                    user_name = %payload.user_name,
                    "User no longer exists, dropping verification email"
                );
                return Err(TaskError::permanent(anyhow::anyhow!(
                    "user {} no longer exists",
                    payload.user_name
                )));
            }
            Err(e) => {
                return Err(TaskError::retryable(
                    anyhow::Error::new(e).context("failed to get user"),
                ))
            }
        };
        ctx.ensure_active()?;

        let record = self
            .verify_emails
            .create_verify_email(CreateVerifyEmailParams {
                username: user.username.clone(),
                email: user.email.clone(),
                secret_code: generate_secret_code(),
                ttl: self.settings.ttl,
            })
            .await
            .context("failed to create verify email")
            .retryable()?;
        ctx.ensure_active()?;

        let link = self.settings.verify_link(record.id, &record.secret_code);
        let message = EmailMessage {
            subject: SUBJECT.to_string(),
            html_body: welcome_body(&user.full_name, &link),
            to: vec![user.email.clone()],
            ..Default::default()
        };

        match self.mailer.send_email(&message).await {
            Ok(()) => {}
            Err(e @ MailError::Rejected(_)) => {
                return Err(TaskError::permanent(
                    anyhow::Error::new(e).context("failed to send verify email"),
                ))
            }
            Err(e @ MailError::Transient(_)) => {
                return Err(TaskError::retryable(
                    anyhow::Error::new(e).context("failed to send verify email"),
                ))
            }
        }

        tracing::info!(
            user_name = %user.username,
            verify_email_id = record.id,
            "Verification email sent"
        );
        Ok(())
    }
}
