//! Prometheus-style metrics.

use axum::Router;
use axum::extract::State;
use axum::routing::get;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics))
}

async fn metrics(State(state): State<AppState>) -> String {
    let mut out = String::new();

    out.push_str("# HELP zephyr_jobs_total Jobs by status.\n");
    out.push_str("# TYPE zephyr_jobs_total gauge\n");
    let jobs = state.store.count_jobs_by_status().await.unwrap_or_default();
    for (status, count) in sorted(jobs) {
        out.push_str(&format!("zephyr_jobs_total{{status=\"{status}\"}} {count}\n"));
    }

    out.push_str("# HELP zephyr_runs_total Pipeline runs by status.\n");
    out.push_str("# TYPE zephyr_runs_total gauge\n");
    let runs = state.store.count_runs_by_status().await.unwrap_or_default();
    for (status, count) in sorted(runs) {
        out.push_str(&format!("zephyr_runs_total{{status=\"{status}\"}} {count}\n"));
    }

    out.push_str("# HELP zephyr_active_jobs Jobs currently executing.\n");
    out.push_str("# TYPE zephyr_active_jobs gauge\n");
    out.push_str(&format!("zephyr_active_jobs {}\n", state.scheduler.active_jobs()));

    out.push_str("# HELP zephyr_max_concurrent Global concurrency cap.\n");
    out.push_str("# TYPE zephyr_max_concurrent gauge\n");
    out.push_str(&format!("zephyr_max_concurrent {}\n", state.scheduler.max_concurrent()));

    out
}

fn sorted(map: std::collections::HashMap<String, i64>) -> Vec<(String, i64)> {
    let mut entries: Vec<(String, i64)> = map.into_iter().collect();
    entries.sort();
    entries
}
