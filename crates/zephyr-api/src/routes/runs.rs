//! Run endpoints.

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;
use zephyr_store::{JobRecord, RunRecord};

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    id: Option<String>,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct RunView {
    #[serde(flatten)]
    run: RunRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    jobs: Option<Vec<JobRecord>>,
}

async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<RunView>>, ApiError> {
    if let Some(id) = query.id {
        let run = state.store.get_run(&id).await?;
        let jobs = state.store.jobs_for_run(&id).await?;
        return Ok(Json(vec![RunView {
            run,
            jobs: Some(jobs),
        }]));
    }

    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let runs = state
        .store
        .list_runs(limit)
        .await?
        .into_iter()
        .map(|run| RunView { run, jobs: None })
        .collect();
    Ok(Json(runs))
}
