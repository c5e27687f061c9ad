//! Project endpoints.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;
use zephyr_store::ProjectRecord;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list).post(create))
}

async fn list(State(state): State<AppState>) -> Result<Json<Vec<ProjectRecord>>, ApiError> {
    Ok(Json(state.store.list_projects().await?))
}

#[derive(Debug, Deserialize)]
struct CreateProject {
    name: String,
    #[serde(default = "default_config_path")]
    config_path: String,
}

fn default_config_path() -> String {
    "zephyr.yml".to_string()
}

async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateProject>,
) -> Result<Json<ProjectRecord>, ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("project name must not be empty".to_string()));
    }
    let project = state
        .store
        .create_project(&body.name, &body.config_path)
        .await?;
    Ok(Json(project))
}
