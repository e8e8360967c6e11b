//! Enroll Database Layer
//!
//! Postgres repositories for users, verification records, the task queue and
//! the task outbox, plus the store traits the worker and API depend on.

// Module declarations
pub mod db;
pub mod store;

// Re-exports: repositories
pub use db::{OutboxRepository, TaskRepository, UserRepository, VerifyEmailRepository};

// Re-exports: Transaction utilities
pub use db::task::TASK_NOTIFY_CHANNEL;
pub use db::transaction::with_transaction;

// Re-exports: store traits
pub use store::{AfterCreate, OutboxStore, TaskQueueStore, UserStore, VerifyEmailStore};
