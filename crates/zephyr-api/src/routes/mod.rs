//! API routes.

pub mod health;
pub mod jobs;
pub mod metrics;
pub mod projects;
pub mod runs;
pub mod trigger;
pub mod webhooks;

use axum::Router;
use axum::middleware;
use axum::routing::get;

use crate::AppState;
use crate::auth::require_api_key;
use crate::ws::ws_handler;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_router(state.clone()))
        .nest("/webhooks", webhooks::router())
        .route("/ws", get(ws_handler))
        .merge(health::router())
        .merge(metrics::router())
        .with_state(state)
}

fn api_router(state: AppState) -> Router<AppState> {
    Router::new()
        .nest("/projects", projects::router())
        .nest("/runs", runs::router())
        .nest("/jobs", jobs::router())
        .nest("/trigger", trigger::router())
        .layer(middleware::from_fn_with_state(state, require_api_key))
}
