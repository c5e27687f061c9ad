//! Typed operations over the embedded database.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;

use zephyr_core::{ResourceId, Status};

use crate::records::*;
use crate::{StoreError, StoreResult};

/// Statuses a row can still move out of.
const NON_TERMINAL: &str = "('pending', 'queued', 'running')";

/// The store facade. Cheap to clone; all methods are one transaction each.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// Projects.
impl Store {
    pub async fn create_project(&self, name: &str, config_path: &str) -> StoreResult<ProjectRecord> {
        let record = sqlx::query_as::<_, ProjectRecord>(
            r#"
            INSERT INTO projects (id, name, config_path, created_at)
            VALUES (?1, ?2, ?3, ?4)
            RETURNING *
            "#,
        )
        .bind(ResourceId::new().to_string())
        .bind(name)
        .bind(config_path)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Duplicate(format!("project '{name}'"))
            }
            _ => StoreError::Sqlx(e),
        })?;
        Ok(record)
    }

    pub async fn get_project(&self, id: &str) -> StoreResult<ProjectRecord> {
        sqlx::query_as::<_, ProjectRecord>("SELECT * FROM projects WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("project {id}")))
    }

    pub async fn get_project_by_name(&self, name: &str) -> StoreResult<ProjectRecord> {
        sqlx::query_as::<_, ProjectRecord>("SELECT * FROM projects WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("project '{name}'")))
    }

    pub async fn list_projects(&self) -> StoreResult<Vec<ProjectRecord>> {
        let records =
            sqlx::query_as::<_, ProjectRecord>("SELECT * FROM projects ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
        Ok(records)
    }
}

// Pipeline runs.
impl Store {
    pub async fn create_run(
        &self,
        project_id: &str,
        pipeline_name: &str,
        trigger_type: &str,
        trigger_data: &serde_json::Value,
        branch: Option<&str>,
        commit_sha: Option<&str>,
    ) -> StoreResult<RunRecord> {
        let record = sqlx::query_as::<_, RunRecord>(
            r#"
            INSERT INTO pipeline_runs
                (id, project_id, pipeline_name, status, trigger_type, trigger_data,
                 branch, commit_sha, created_at)
            VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?7, ?8)
            RETURNING *
            "#,
        )
        .bind(ResourceId::new().to_string())
        .bind(project_id)
        .bind(pipeline_name)
        .bind(trigger_type)
        .bind(trigger_data.to_string())
        .bind(branch)
        .bind(commit_sha)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn get_run(&self, id: &str) -> StoreResult<RunRecord> {
        sqlx::query_as::<_, RunRecord>("SELECT * FROM pipeline_runs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("run {id}")))
    }

    pub async fn list_runs(&self, limit: i64) -> StoreResult<Vec<RunRecord>> {
        let records = sqlx::query_as::<_, RunRecord>(
            "SELECT * FROM pipeline_runs ORDER BY created_at DESC, id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Update a run's status. Terminal rows are never mutated again, and
    /// re-applying the current value is a no-op.
    pub async fn update_run_status(
        &self,
        id: &str,
        status: Status,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        sqlx::query(&format!(
            r#"
            UPDATE pipeline_runs
            SET status = ?1,
                started_at = COALESCE(?2, started_at),
                finished_at = COALESCE(?3, finished_at)
            WHERE id = ?4 AND status IN {NON_TERMINAL}
            "#
        ))
        .bind(status.as_str())
        .bind(started_at)
        .bind(finished_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Claim the oldest pending run (FIFO by creation time), flipping it to
    /// `queued` so concurrent pollers cannot pick it up twice.
    pub async fn next_pending_run(&self) -> StoreResult<Option<RunRecord>> {
        let record = sqlx::query_as::<_, RunRecord>(
            r#"
            UPDATE pipeline_runs
            SET status = 'queued'
            WHERE id = (
                SELECT id FROM pipeline_runs
                WHERE status = 'pending'
                ORDER BY created_at ASC, id ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn pending_runs(&self, limit: i64) -> StoreResult<Vec<RunRecord>> {
        let records = sqlx::query_as::<_, RunRecord>(
            r#"
            SELECT * FROM pipeline_runs
            WHERE status = 'pending'
            ORDER BY created_at ASC, id ASC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn count_runs_by_status(&self) -> StoreResult<HashMap<String, i64>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM pipeline_runs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }
}

// Jobs.
impl Store {
    pub async fn create_job(
        &self,
        pipeline_run_id: &str,
        name: &str,
        runner_image: &str,
    ) -> StoreResult<JobRecord> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            INSERT INTO jobs (id, pipeline_run_id, name, status, runner_image, created_at)
            VALUES (?1, ?2, ?3, 'pending', ?4, ?5)
            RETURNING *
            "#,
        )
        .bind(ResourceId::new().to_string())
        .bind(pipeline_run_id)
        .bind(name)
        .bind(runner_image)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn get_job(&self, id: &str) -> StoreResult<JobRecord> {
        sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))
    }

    pub async fn jobs_for_run(&self, pipeline_run_id: &str) -> StoreResult<Vec<JobRecord>> {
        let records = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM jobs WHERE pipeline_run_id = ?1 ORDER BY created_at ASC, name ASC",
        )
        .bind(pipeline_run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn update_job_status(
        &self,
        id: &str,
        status: Status,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
        exit_code: Option<i64>,
        error: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = ?1,
                started_at = COALESCE(?2, started_at),
                finished_at = COALESCE(?3, finished_at),
                exit_code = COALESCE(?4, exit_code),
                error = COALESCE(?5, error)
            WHERE id = ?6 AND status IN {NON_TERMINAL}
            "#
        ))
        .bind(status.as_str())
        .bind(started_at)
        .bind(finished_at)
        .bind(exit_code)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count_jobs_by_status(&self) -> StoreResult<HashMap<String, i64>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }
}

// Steps.
impl Store {
    pub async fn create_step(
        &self,
        job_id: &str,
        name: &str,
        step_order: i64,
    ) -> StoreResult<StepRecord> {
        let record = sqlx::query_as::<_, StepRecord>(
            r#"
            INSERT INTO steps (id, job_id, name, step_order, status)
            VALUES (?1, ?2, ?3, ?4, 'pending')
            RETURNING *
            "#,
        )
        .bind(ResourceId::new().to_string())
        .bind(job_id)
        .bind(name)
        .bind(step_order)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn steps_for_job(&self, job_id: &str) -> StoreResult<Vec<StepRecord>> {
        let records = sqlx::query_as::<_, StepRecord>(
            "SELECT * FROM steps WHERE job_id = ?1 ORDER BY step_order ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Move every non-terminal step of a job to `status`. Used when a job is
    /// skipped or cancelled before (or while) its steps run.
    pub async fn mark_steps_for_job(&self, job_id: &str, status: Status) -> StoreResult<()> {
        sqlx::query(&format!(
            "UPDATE steps SET status = ?1 WHERE job_id = ?2 AND status IN {NON_TERMINAL}"
        ))
        .bind(status.as_str())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reset step rows to `pending` for a fresh executor attempt.
    pub async fn reset_steps_for_job(&self, job_id: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE steps
            SET status = 'pending', exit_code = NULL, started_at = NULL, finished_at = NULL
            WHERE job_id = ?1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_step_status(
        &self,
        id: &str,
        status: Status,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
        exit_code: Option<i64>,
    ) -> StoreResult<()> {
        sqlx::query(&format!(
            r#"
            UPDATE steps
            SET status = ?1,
                started_at = COALESCE(?2, started_at),
                finished_at = COALESCE(?3, finished_at),
                exit_code = COALESCE(?4, exit_code)
            WHERE id = ?5 AND status IN {NON_TERMINAL}
            "#
        ))
        .bind(status.as_str())
        .bind(started_at)
        .bind(finished_at)
        .bind(exit_code)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// Logs.
impl Store {
    /// Append one log chunk and return its assigned sequence number.
    pub async fn append_log(
        &self,
        job_id: &str,
        step_id: Option<&str>,
        stream: &str,
        content: &[u8],
    ) -> StoreResult<i64> {
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO logs (job_id, step_id, stream, content, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5)
            RETURNING seq
            "#,
        )
        .bind(job_id)
        .bind(step_id)
        .bind(stream)
        .bind(content)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(seq)
    }

    /// Ordered log tail for a job, optionally since a sequence cursor.
    pub async fn logs_for_job(
        &self,
        job_id: &str,
        since_seq: Option<i64>,
    ) -> StoreResult<Vec<LogChunkRecord>> {
        let records = sqlx::query_as::<_, LogChunkRecord>(
            r#"
            SELECT * FROM logs
            WHERE job_id = ?1 AND seq > COALESCE(?2, -1)
            ORDER BY seq ASC
            "#,
        )
        .bind(job_id)
        .bind(since_seq)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}

// Artifacts.
impl Store {
    pub async fn create_artifact(
        &self,
        job_id: &str,
        name: &str,
        path: &str,
        size: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<ArtifactRecord> {
        let record = sqlx::query_as::<_, ArtifactRecord>(
            r#"
            INSERT INTO artifacts (id, job_id, name, path, size, created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            RETURNING *
            "#,
        )
        .bind(ResourceId::new().to_string())
        .bind(job_id)
        .bind(name)
        .bind(path)
        .bind(size)
        .bind(Utc::now())
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn artifacts_for_job(&self, job_id: &str) -> StoreResult<Vec<ArtifactRecord>> {
        let records = sqlx::query_as::<_, ArtifactRecord>(
            "SELECT * FROM artifacts WHERE job_id = ?1 ORDER BY name",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}

// Secrets.
impl Store {
    pub async fn set_secret(
        &self,
        project_id: &str,
        name: &str,
        value: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO secrets (id, project_id, name, value, created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (project_id, name) DO UPDATE SET value = ?4, expires_at = ?6
            "#,
        )
        .bind(ResourceId::new().to_string())
        .bind(project_id)
        .bind(name)
        .bind(value)
        .bind(Utc::now())
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All unexpired secrets for a project.
    pub async fn secrets_for_project(
        &self,
        project_id: &str,
    ) -> StoreResult<HashMap<String, String>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT name, value FROM secrets
            WHERE project_id = ?1 AND (expires_at IS NULL OR expires_at > ?2)
            "#,
        )
        .bind(project_id)
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }
}

// Webhook deliveries.
impl Store {
    /// Persist a delivery before acting on it, so it can be replayed after a
    /// crash.
    pub async fn save_webhook_delivery(
        &self,
        provider: &str,
        event_type: &str,
        payload: &[u8],
        signature: Option<&str>,
    ) -> StoreResult<WebhookDeliveryRecord> {
        let record = sqlx::query_as::<_, WebhookDeliveryRecord>(
            r#"
            INSERT INTO webhook_deliveries
                (id, provider, event_type, payload, signature, processed, received_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
            RETURNING *
            "#,
        )
        .bind(ResourceId::new().to_string())
        .bind(provider)
        .bind(event_type)
        .bind(payload)
        .bind(signature)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn mark_webhook_processed(
        &self,
        id: &str,
        pipeline_run_id: Option<&str>,
        error: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET processed = 1, pipeline_run_id = ?2, error = ?3
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(pipeline_run_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
