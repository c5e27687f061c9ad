//! Job endpoints.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;
use zephyr_store::{JobRecord, StepRecord};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}", get(show))
        .route("/{id}/logs", get(logs))
}

#[derive(Debug, Serialize)]
struct JobView {
    #[serde(flatten)]
    job: JobRecord,
    steps: Vec<StepRecord>,
}

async fn show(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let job = state.store.get_job(&id).await?;
    let steps = state.store.steps_for_job(&id).await?;
    Ok(Json(JobView { job, steps }))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    since: Option<i64>,
}

#[derive(Debug, Serialize)]
struct LogChunkView {
    seq: i64,
    step_id: Option<String>,
    stream: String,
    content: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}

async fn logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<LogChunkView>>, ApiError> {
    // 404 for unknown jobs rather than an empty tail.
    state.store.get_job(&id).await?;
    let chunks = state
        .store
        .logs_for_job(&id, query.since)
        .await?
        .into_iter()
        .map(|chunk| LogChunkView {
            seq: chunk.seq,
            step_id: chunk.step_id,
            stream: chunk.stream,
            content: String::from_utf8_lossy(&chunk.content).to_string(),
            timestamp: chunk.timestamp,
        })
        .collect();
    Ok(Json(chunks))
}
