//! Application state shared by the HTTP handlers.

use sqlx::PgPool;
use std::sync::Arc;

use crate::services::registration::RegistrationService;

#[derive(Clone)]
pub struct AppState {
    pub registration: Arc<RegistrationService>,
    /// Checked by the health endpoint; absent when running on in-memory stores.
    pub pool: Option<PgPool>,
}

impl AppState {
    pub fn new(registration: RegistrationService, pool: Option<PgPool>) -> Self {
        Self {
            registration: Arc::new(registration),
            pool,
        }
    }
}
