//! Enroll Core Library
//!
//! Domain models, error types and configuration shared by the storage layer,
//! the background worker and the HTTP API.

pub mod config;
pub mod error;
pub mod models;
pub mod task_error;

pub use config::{Config, EnqueueFailureMode, EnqueuePolicy, SmtpConfig};
pub use error::{AppError, ErrorMetadata, LogLevel};
pub use task_error::{TaskError, TaskResultExt};
