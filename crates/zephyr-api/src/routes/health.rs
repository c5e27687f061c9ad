//! Health endpoint.

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::routing::get;
use serde_json::{Value, json};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let queue_stats = state.store.count_runs_by_status().await.unwrap_or_default();
    Json(json!({
        "status": "ok",
        "running": state.scheduler.is_running(),
        "activeJobs": state.scheduler.active_jobs(),
        "maxConcurrent": state.scheduler.max_concurrent(),
        "queueStats": queue_stats,
    }))
}
