//! Data models shared by the registration flow and the task pipeline.

mod outbox;
mod task;
mod user;
mod verify_email;

pub use outbox::*;
pub use task::*;
pub use user::*;
pub use verify_email::*;
