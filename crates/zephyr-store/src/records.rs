//! Row types returned by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A project row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProjectRecord {
    pub id: String,
    pub name: String,
    pub config_path: String,
    pub created_at: DateTime<Utc>,
}

/// A pipeline run row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RunRecord {
    pub id: String,
    pub project_id: String,
    pub pipeline_name: String,
    pub status: String,
    pub trigger_type: String,
    pub trigger_data: String,
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A job row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRecord {
    pub id: String,
    pub pipeline_run_id: String,
    pub name: String,
    pub status: String,
    pub runner_image: String,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A step row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StepRecord {
    pub id: String,
    pub job_id: String,
    pub name: String,
    pub step_order: i64,
    pub status: String,
    pub exit_code: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One appended log chunk. `seq` is unique and monotonic across the store.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LogChunkRecord {
    pub seq: i64,
    pub job_id: String,
    pub step_id: Option<String>,
    pub stream: String,
    pub content: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// An artifact reference row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ArtifactRecord {
    pub id: String,
    pub job_id: String,
    pub name: String,
    pub path: String,
    pub size: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A webhook delivery row, persisted before any action is taken on it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookDeliveryRecord {
    pub id: String,
    pub provider: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub signature: Option<String>,
    pub processed: bool,
    pub pipeline_run_id: Option<String>,
    pub error: Option<String>,
    pub received_at: DateTime<Utc>,
}
