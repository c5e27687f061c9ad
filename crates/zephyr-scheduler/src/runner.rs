//! The seam between the scheduler and job executors.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use zephyr_core::Status;
use zephyr_core::pipeline::JobDef;

/// A file pushed into the guest workspace before steps run.
#[derive(Debug, Clone)]
pub struct WorkspaceFile {
    /// Path inside the guest, relative to the workspace.
    pub path: String,
    pub content: Vec<u8>,
    pub mode: Option<u32>,
}

/// Everything an executor needs to run one job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Store id of the job row.
    pub job_id: String,
    /// Store id of the owning run.
    pub run_id: String,
    /// The concrete (matrix-expanded, condition-resolved) definition.
    pub def: JobDef,
    /// Pipeline-level environment.
    pub env: HashMap<String, String>,
    /// Project secrets, substituted for `${{ secrets.NAME }}` references.
    pub secrets: HashMap<String, String>,
    /// Workspace inputs to upload before the first step.
    pub workspace_files: Vec<WorkspaceFile>,
    /// Cancellation intent; observed before each step dispatch.
    pub cancel: CancellationToken,
}

/// Final result of a job as seen by the DAG: one terminal status, after any
/// executor-internal retries.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub status: Status,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn success() -> Self {
        Self {
            status: Status::Success,
            exit_code: Some(0),
            error: None,
        }
    }

    pub fn failure(exit_code: Option<i64>, error: impl Into<String>) -> Self {
        Self {
            status: Status::Failure,
            exit_code,
            error: Some(error.into()),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: Status::Cancelled,
            exit_code: None,
            error: None,
        }
    }
}

/// Runs one job to completion. Implementations own their VM for the whole
/// job and must clean it up unconditionally.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run_job(&self, request: JobRequest) -> JobOutcome;
}
