//! Outbound email over SMTP.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;

use enroll_core::SmtpConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAttachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmailMessage {
    pub subject: String,
    pub html_body: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub attachments: Vec<EmailAttachment>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MailError {
    /// Transport unavailable or temporarily refusing; worth retrying.
    #[error("mail delivery failed: {0}")]
    Transient(String),
    /// The message or a recipient was refused for good.
    #[error("mail rejected: {0}")]
    Rejected(String),
}

impl MailError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, MailError::Rejected(_))
    }
}

/// Send-message capability used by task handlers.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_email(&self, message: &EmailMessage) -> Result<(), MailError>;
}

#[derive(Clone)]
pub struct SmtpEmailSender {
    mailer: Arc<AsyncSmtpTransport<Tokio1Executor>>,
    from: Mailbox,
}

impl SmtpEmailSender {
    pub fn from_config(config: &SmtpConfig) -> anyhow::Result<Self> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid SMTP_FROM: {}", e))?;

        let builder = if config.tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| anyhow::anyhow!("Invalid SMTP relay {}: {}", config.host, e))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };
        let builder = builder.port(config.port);
        let builder = match (&config.user, &config.password) {
            (Some(user), Some(password)) => {
                builder.credentials(Credentials::new(user.clone(), password.clone()))
            }
            _ => builder,
        };

        tracing::info!(
            host = %config.host,
            port = config.port,
            tls = config.tls,
            "Email sender initialized"
        );

        Ok(Self {
            mailer: Arc::new(builder.build()),
            from,
        })
    }

    fn build_message(&self, message: &EmailMessage) -> Result<Message, MailError> {
        if message.to.is_empty() {
            return Err(MailError::Rejected("message has no recipients".to_string()));
        }

        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(message.subject.clone());
        for addr in &message.to {
            builder = builder.to(parse_mailbox(addr)?);
        }
        for addr in &message.cc {
            builder = builder.cc(parse_mailbox(addr)?);
        }
        for addr in &message.bcc {
            builder = builder.bcc(parse_mailbox(addr)?);
        }

        let built = if message.attachments.is_empty() {
            builder
                .header(ContentType::TEXT_HTML)
                .body(message.html_body.clone())
        } else {
            let mut parts = MultiPart::mixed().singlepart(SinglePart::html(message.html_body.clone()));
            for attachment in &message.attachments {
                let content_type = ContentType::parse(&attachment.content_type).map_err(|e| {
                    MailError::Rejected(format!(
                        "invalid content type for {}: {}",
                        attachment.filename, e
                    ))
                })?;
                parts = parts.singlepart(
                    Attachment::new(attachment.filename.clone())
                        .body(attachment.data.clone(), content_type),
                );
            }
            builder.multipart(parts)
        };

        built.map_err(|e| MailError::Rejected(e.to_string()))
    }
}

fn parse_mailbox(addr: &str) -> Result<Mailbox, MailError> {
    addr.parse()
        .map_err(|e| MailError::Rejected(format!("invalid address {}: {}", addr, e)))
}

#[async_trait]
impl EmailSender for SmtpEmailSender {
    async fn send_email(&self, message: &EmailMessage) -> Result<(), MailError> {
        let email = self.build_message(message)?;

        match self.mailer.send(email).await {
            Ok(_) => {
                tracing::info!(recipients = message.to.len(), subject = %message.subject, "Email sent");
                Ok(())
            }
            Err(e) if e.is_permanent() => Err(MailError::Rejected(e.to_string())),
            Err(e) => Err(MailError::Transient(e.to_string())),
        }
    }
}

/// Development sender that logs messages instead of delivering them.
#[derive(Clone, Default)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send_email(&self, message: &EmailMessage) -> Result<(), MailError> {
        if message.to.is_empty() {
            return Err(MailError::Rejected("message has no recipients".to_string()));
        }
        tracing::warn!(
            to = %message.to.join(","),
            subject = %message.subject,
            body = %message.html_body,
            "SMTP not configured; email logged instead of sent"
        );
        Ok(())
    }
}
