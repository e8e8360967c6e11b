//! Enroll Services
//!
//! Outbound integrations used by background tasks.

pub mod email;

pub use email::{
    EmailAttachment, EmailMessage, EmailSender, LogEmailSender, MailError, SmtpEmailSender,
};
