//! Implementation of `zephyr run`: execute a pipeline locally.

use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use zephyr_config::RunContext;
use zephyr_scheduler::{BusEvent, FileResolver, LogBus, Scheduler, SchedulerConfig};

use super::EngineArgs;

/// Run the pipeline once against a local state directory and mirror the
/// worst status in the exit code.
pub async fn run(config: &Path, branch: &str, engine: EngineArgs) -> anyhow::Result<i32> {
    // Validate the file up front so a bad config fails before any VM work.
    let ctx = RunContext {
        branch: Some(branch.to_string()),
        trigger_type: "manual".to_string(),
    };
    let pipeline =
        zephyr_config::load_pipeline(config, &ctx).context("invalid pipeline configuration")?;

    let state_dir = Path::new(".zephyr");
    std::fs::create_dir_all(state_dir)?;
    let store = zephyr_store::open(state_dir.join("local.db")).await?;
    store.recover_orphans().await?;

    let project = match store.get_project_by_name(&pipeline.name).await {
        Ok(project) => project,
        Err(_) => {
            store
                .create_project(&pipeline.name, &config.display().to_string())
                .await?
        }
    };
    let run = store
        .create_run(
            &project.id,
            &pipeline.name,
            "manual",
            &serde_json::json!({ "source": "cli" }),
            Some(branch),
            None,
        )
        .await?;
    info!(run_id = %run.id, pipeline = %pipeline.name, "starting local run");

    let bus = LogBus::new();
    let (vms, runner) = super::build_engine(&store, &bus, &engine);
    let (scheduler, _handle) = Scheduler::new(
        store.clone(),
        bus.clone(),
        Arc::new(FileResolver::new()),
        runner,
        SchedulerConfig {
            max_concurrent: engine.max_concurrent,
            poll_interval: Duration::from_millis(200),
        },
    );

    let shutdown = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));

    // Mirror logs and status changes onto the terminal as they happen.
    let mut events = bus.subscribe();
    let echo_run_id = run.id.clone();
    let echo = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                BusEvent::Log { content, .. } => print!("{content}"),
                BusEvent::JobUpdate { job_id, status, run_id } if run_id == echo_run_id => {
                    eprintln!("job {job_id}: {status}");
                }
                _ => {}
            }
        }
    });

    let final_status = loop {
        let record = store.get_run(&run.id).await?;
        if matches!(
            record.status.as_str(),
            "success" | "failure" | "cancelled" | "skipped"
        ) {
            break record.status;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    };

    shutdown.cancel();
    scheduler_task.await?;
    vms.destroy_all().await?;
    echo.abort();

    println!("run {}: {final_status}", run.id);
    Ok(if final_status == "success" { 0 } else { 1 })
}
