//! Restart recovery: reconcile rows left non-terminal by a crashed process.

use chrono::Utc;
use tracing::{info, warn};

use zephyr_core::Status;

use crate::store::Store;
use crate::{StoreError, StoreResult};

/// What recovery did on startup.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Jobs marked `failure` with exit code -1.
    pub orphaned_jobs: usize,
    /// Runs marked `failure`.
    pub failed_runs: usize,
    /// Runs whose jobs were all still pending, put back in the queue.
    pub requeued_runs: usize,
}

impl Store {
    /// Scan for runs and jobs left non-terminal by a previous process.
    ///
    /// Jobs caught mid-flight are marked `failure` with exit code -1 and the
    /// reason "orphaned on restart". Their runs become `failure`. A run whose
    /// jobs never left `pending` (or that has no jobs yet) is re-queued
    /// instead. No attempt is made to reattach to hypervisor sockets.
    pub async fn recover_orphans(&self) -> StoreResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let open_runs = sqlx::query_as::<_, (String,)>(
            "SELECT id FROM pipeline_runs WHERE status IN ('queued', 'running')",
        )
        .fetch_all(self.pool())
        .await?;

        for (run_id,) in open_runs {
            let jobs = self.jobs_for_run(&run_id).await?;
            let all_pending = jobs.iter().all(|j| j.status == "pending");

            if all_pending {
                sqlx::query(
                    "UPDATE pipeline_runs SET status = 'pending', started_at = NULL WHERE id = ?1",
                )
                .bind(&run_id)
                .execute(self.pool())
                .await?;
                info!(run_id = %run_id, "re-queued run untouched by previous process");
                report.requeued_runs += 1;
                continue;
            }

            for job in jobs.iter().filter(|j| !is_terminal(&j.status)) {
                self.orphan_job(&job.id).await?;
                report.orphaned_jobs += 1;
            }

            self.update_run_status(&run_id, Status::Failure, None, Some(Utc::now()))
                .await?;
            warn!(run_id = %run_id, "run orphaned on restart, marked failure");
            report.failed_runs += 1;
        }

        Ok(report)
    }

    async fn orphan_job(&self, job_id: &str) -> Result<(), StoreError> {
        // Running steps failed with the process; untouched steps were skipped.
        sqlx::query(
            "UPDATE steps SET status = 'failure', finished_at = ?2 WHERE job_id = ?1 AND status = 'running'",
        )
        .bind(job_id)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        sqlx::query(
            "UPDATE steps SET status = 'skipped' WHERE job_id = ?1 AND status IN ('pending', 'queued')",
        )
        .bind(job_id)
        .execute(self.pool())
        .await?;

        self.update_job_status(
            job_id,
            Status::Failure,
            None,
            Some(Utc::now()),
            Some(-1),
            Some("orphaned on restart"),
        )
        .await?;
        Ok(())
    }
}

fn is_terminal(status: &str) -> bool {
    matches!(status, "success" | "failure" | "cancelled" | "skipped")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::open(dir.path().join("zephyr.db")).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn mid_flight_run_is_failed_with_orphan_reason() {
        let (store, _dir) = test_store().await;
        let project = store.create_project("demo", "zephyr.yml").await.unwrap();
        let run = store
            .create_run(&project.id, "ci", "push", &serde_json::json!({}), None, None)
            .await
            .unwrap();
        store
            .update_run_status(&run.id, Status::Running, Some(Utc::now()), None)
            .await
            .unwrap();

        let job = store.create_job(&run.id, "build", "alpine").await.unwrap();
        store
            .update_job_status(&job.id, Status::Running, Some(Utc::now()), None, None, None)
            .await
            .unwrap();
        let step = store.create_step(&job.id, "compile", 0).await.unwrap();
        store
            .update_step_status(&step.id, Status::Running, Some(Utc::now()), None, None)
            .await
            .unwrap();
        let pending_step = store.create_step(&job.id, "test", 1).await.unwrap();

        let report = store.recover_orphans().await.unwrap();
        assert_eq!(report.orphaned_jobs, 1);
        assert_eq!(report.failed_runs, 1);
        assert_eq!(report.requeued_runs, 0);

        let job = store.get_job(&job.id).await.unwrap();
        assert_eq!(job.status, "failure");
        assert_eq!(job.exit_code, Some(-1));
        assert_eq!(job.error.as_deref(), Some("orphaned on restart"));

        let steps = store.steps_for_job(&job.id).await.unwrap();
        assert_eq!(steps[0].status, "failure");
        assert_eq!(steps[1].status, "skipped");
        assert_eq!(steps[1].id, pending_step.id);

        let run = store.get_run(&run.id).await.unwrap();
        assert_eq!(run.status, "failure");
    }

    #[tokio::test]
    async fn untouched_run_is_requeued() {
        let (store, _dir) = test_store().await;
        let project = store.create_project("demo", "zephyr.yml").await.unwrap();
        let run = store
            .create_run(&project.id, "ci", "push", &serde_json::json!({}), None, None)
            .await
            .unwrap();
        // Claimed but the process died before any job started.
        let claimed = store.next_pending_run().await.unwrap().unwrap();
        assert_eq!(claimed.id, run.id);

        let report = store.recover_orphans().await.unwrap();
        assert_eq!(report.requeued_runs, 1);
        assert_eq!(report.failed_runs, 0);

        let run = store.get_run(&run.id).await.unwrap();
        assert_eq!(run.status, "pending");
    }

    #[tokio::test]
    async fn terminal_runs_are_untouched() {
        let (store, _dir) = test_store().await;
        let project = store.create_project("demo", "zephyr.yml").await.unwrap();
        let run = store
            .create_run(&project.id, "ci", "push", &serde_json::json!({}), None, None)
            .await
            .unwrap();
        store
            .update_run_status(&run.id, Status::Success, None, Some(Utc::now()))
            .await
            .unwrap();

        let report = store.recover_orphans().await.unwrap();
        assert_eq!(report, RecoveryReport::default());
    }
}
