//! Application setup and initialization

pub mod database;
pub mod routes;
pub mod server;
pub mod services;

use anyhow::{Context, Result};
use axum::Router;
use enroll_core::Config;
use enroll_worker::{OutboxRelay, TaskProcessor};
use sqlx::PgPool;

use crate::state::AppState;

pub struct App {
    pub router: Router,
    pub pool: PgPool,
    pub processor: TaskProcessor,
    pub relay: Option<OutboxRelay>,
}

/// Connect storage, build services and routes. Background workers are
/// returned unstarted.
pub async fn initialize_app(config: &Config) -> Result<App> {
    config.validate().context("Configuration validation failed")?;

    let pool = database::setup_database(config).await?;
    let services = services::initialize_services(config, &pool)?;

    let state = AppState::new(services.registration, Some(pool.clone()));
    let router = routes::setup_routes(state);

    Ok(App {
        router,
        pool,
        processor: services.processor,
        relay: services.relay,
    })
}
