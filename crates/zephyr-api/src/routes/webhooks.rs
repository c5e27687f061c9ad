//! Webhook intake for Git providers.

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{info, warn};

use zephyr_config::RunContext;
use zephyr_core::pipeline::TriggerEvent;
use zephyr_core::trigger;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/github", post(github_webhook))
}

/// Handle GitHub webhook events. The delivery is persisted before any
/// action so it can be replayed after a crash.
async fn github_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let event_type = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let signature = headers
        .get("X-Hub-Signature-256")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let delivery = state
        .store
        .save_webhook_delivery("github", &event_type, &body, signature.as_deref())
        .await?;

    if let Some(secret) = &state.webhook_secret {
        if !verify_github_signature(secret, &body, signature.as_deref()) {
            warn!(delivery_id = %delivery.id, "invalid webhook signature");
            state
                .store
                .mark_webhook_processed(&delivery.id, None, Some("signature invalid"))
                .await?;
            return Ok(StatusCode::UNAUTHORIZED);
        }
    }

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))?;

    info!(event = %event_type, "received GitHub webhook");

    let Some(event) = parse_event(&event_type, &payload) else {
        state
            .store
            .mark_webhook_processed(&delivery.id, None, None)
            .await?;
        return Ok(StatusCode::OK);
    };

    let run_id = trigger_matching_projects(&state, &event, &payload).await?;
    state
        .store
        .mark_webhook_processed(&delivery.id, run_id.as_deref(), None)
        .await?;

    Ok(StatusCode::OK)
}

/// Create a run for every project whose pipeline triggers match the event.
/// Returns the first created run id for the delivery link.
async fn trigger_matching_projects(
    state: &AppState,
    event: &TriggerEvent,
    payload: &serde_json::Value,
) -> Result<Option<String>, ApiError> {
    let (trigger_type, branch) = event_identity(event);
    let commit_sha = payload
        .get("after")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let mut first_run = None;
    for project in state.store.list_projects().await? {
        let ctx = RunContext {
            branch: branch.clone(),
            trigger_type: trigger_type.to_string(),
        };
        let pipeline = match zephyr_config::load_pipeline(&project.config_path, &ctx) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                warn!(project = %project.name, error = %e, "skipping project with unloadable config");
                continue;
            }
        };
        if !trigger::matches(event, &pipeline.triggers) {
            continue;
        }

        let run = state
            .store
            .create_run(
                &project.id,
                &pipeline.name,
                trigger_type,
                payload,
                branch.as_deref(),
                commit_sha.as_deref(),
            )
            .await?;
        info!(project = %project.name, run_id = %run.id, "run created from webhook");
        first_run.get_or_insert(run.id);
    }
    if first_run.is_some() {
        state.scheduler.wake();
    }
    Ok(first_run)
}

fn event_identity(event: &TriggerEvent) -> (&'static str, Option<String>) {
    match event {
        TriggerEvent::Push { branch, .. } => ("push", Some(branch.clone())),
        TriggerEvent::PullRequest { branch, .. } => ("pull_request", Some(branch.clone())),
        TriggerEvent::Tag { .. } => ("tag", None),
        TriggerEvent::Schedule => ("schedule", None),
        TriggerEvent::Manual => ("manual", None),
    }
}

/// Translate a GitHub payload into a trigger event. Tag pushes arrive as
/// push events with a `refs/tags/` ref.
fn parse_event(event_type: &str, payload: &serde_json::Value) -> Option<TriggerEvent> {
    match event_type {
        "push" => {
            let reference = payload.get("ref")?.as_str()?;
            if let Some(tag) = reference.strip_prefix("refs/tags/") {
                return Some(TriggerEvent::Tag {
                    name: tag.to_string(),
                });
            }
            let branch = reference
                .strip_prefix("refs/heads/")
                .unwrap_or(reference)
                .to_string();
            Some(TriggerEvent::Push {
                branch,
                changed_paths: changed_paths(payload),
            })
        }
        "pull_request" => {
            let action = payload.get("action")?.as_str()?.to_string();
            let branch = payload
                .pointer("/pull_request/base/ref")?
                .as_str()?
                .to_string();
            Some(TriggerEvent::PullRequest {
                action,
                branch,
                changed_paths: Vec::new(),
            })
        }
        _ => None,
    }
}

/// All files touched by the pushed commits.
fn changed_paths(payload: &serde_json::Value) -> Vec<String> {
    let mut paths = Vec::new();
    if let Some(commits) = payload.get("commits").and_then(|v| v.as_array()) {
        for commit in commits {
            for key in ["added", "modified", "removed"] {
                if let Some(files) = commit.get(key).and_then(|v| v.as_array()) {
                    paths.extend(files.iter().filter_map(|f| f.as_str()).map(str::to_string));
                }
            }
        }
    }
    paths.sort();
    paths.dedup();
    paths
}

/// Verify a GitHub webhook signature with a constant-time comparison.
fn verify_github_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };

    // Signature format: "sha256=<hex>"
    let Some(sig_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);

    mac.verify_slice(&sig_bytes).is_ok()
}
