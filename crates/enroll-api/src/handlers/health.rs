use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use std::time::Duration;

use crate::state::AppState;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: &'static str,
}

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = match &state.pool {
        Some(pool) => {
            let ping = sqlx::query("SELECT 1").execute(pool);
            match tokio::time::timeout(CHECK_TIMEOUT, ping).await {
                Ok(Ok(_)) => "healthy",
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Database health check failed");
                    "unhealthy"
                }
                Err(_) => "timeout",
            }
        }
        None => "not_configured",
    };

    let healthy = database != "unhealthy" && database != "timeout";
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "unhealthy" },
            database,
        }),
    )
}
