//! Enroll Worker
//!
//! Hands task envelopes to the durable queue, runs the worker pool that
//! executes them, and relays outbox rows written by the registration flow.

pub mod distributor;
pub mod handlers;
pub mod processor;
pub mod relay;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use distributor::{
    distribute_send_verify_email, DistributeError, QueueTaskDistributor, TaskDistributor,
};
pub use handlers::{Handlers, SendVerifyEmailHandler, TaskContext, TaskDispatcher, VerifyEmailSettings};
pub use processor::{compute_retry_backoff, TaskProcessor, TaskProcessorConfig, MAX_RETRY_BACKOFF_SECS};
pub use relay::{OutboxRelay, OutboxRelayConfig};
