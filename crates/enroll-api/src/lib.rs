//! Enroll API Library
//!
//! HTTP surface of the registration flow and the wiring that starts the
//! background worker next to it.

pub mod error;
pub mod handlers;
pub mod services;
pub mod setup;
pub mod state;
pub mod telemetry;

pub use error::{ErrorResponse, HttpAppError};
pub use services::registration::RegistrationService;
pub use state::AppState;
