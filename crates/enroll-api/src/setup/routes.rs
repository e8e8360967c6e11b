//! Route configuration

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

pub const API_PREFIX: &str = "/v1";

const MAX_BODY_BYTES: usize = 64 * 1024;

pub fn setup_routes(state: AppState) -> Router {
    let api = Router::new().route("/users", post(handlers::users::create_user));

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .nest(API_PREFIX, api)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
