//! Database repositories for data access layer
//!
//! Each repository owns the SQL for one table and is cheap to clone (it only
//! holds the pool).

pub mod outbox;
pub mod task;
pub mod transaction;
pub mod user;
pub mod verify_email;

pub use outbox::OutboxRepository;
pub use task::TaskRepository;
pub use user::UserRepository;
pub use verify_email::VerifyEmailRepository;
