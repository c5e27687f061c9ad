//! Manual run triggering.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/", post(trigger))
}

#[derive(Debug, Deserialize)]
struct TriggerRequest {
    project: String,
    #[serde(default = "default_pipeline")]
    pipeline: String,
    branch: Option<String>,
    commit_sha: Option<String>,
}

fn default_pipeline() -> String {
    "ci".to_string()
}

async fn trigger(
    State(state): State<AppState>,
    Json(body): Json<TriggerRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let project = match state.store.get_project(&body.project).await {
        Ok(project) => project,
        Err(_) => state.store.get_project_by_name(&body.project).await?,
    };

    let run = state
        .store
        .create_run(
            &project.id,
            &body.pipeline,
            "manual",
            &json!({ "source": "api" }),
            body.branch.as_deref(),
            body.commit_sha.as_deref(),
        )
        .await?;
    info!(run_id = %run.id, project = %project.name, "run triggered via API");
    state.scheduler.wake();

    Ok(Json(json!({ "id": run.id })))
}
