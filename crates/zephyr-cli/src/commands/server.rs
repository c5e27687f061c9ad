//! Implementation of `zephyr server`: scheduler plus HTTP API.

use anyhow::Context;
use clap::Args;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use zephyr_api::AppState;
use zephyr_scheduler::{FileResolver, LogBus, Scheduler, SchedulerConfig};

use super::EngineArgs;

#[derive(Debug, Args)]
pub struct ServerArgs {
    /// Listen address
    #[arg(long, env = "ZEPHYR_LISTEN", default_value = "0.0.0.0:8090")]
    pub listen: SocketAddr,

    /// Database file
    #[arg(long, env = "ZEPHYR_DB", default_value = "/var/lib/zephyr/zephyr.db")]
    pub db: PathBuf,

    /// Require this API key on /api/v1 requests
    #[arg(long, env = "ZEPHYR_API_KEY")]
    pub api_key: Option<String>,

    /// Shared secret for GitHub webhook signatures
    #[arg(long, env = "ZEPHYR_WEBHOOK_SECRET")]
    pub webhook_secret: Option<String>,
}

pub async fn server(args: ServerArgs, engine: EngineArgs) -> anyhow::Result<i32> {
    if let Some(parent) = args.db.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = zephyr_store::open(&args.db)
        .await
        .with_context(|| format!("opening {}", args.db.display()))?;

    let report = store.recover_orphans().await?;
    if report.orphaned_jobs > 0 || report.requeued_runs > 0 {
        info!(
            orphaned_jobs = report.orphaned_jobs,
            failed_runs = report.failed_runs,
            requeued_runs = report.requeued_runs,
            "recovered state from previous process"
        );
    }

    let bus = LogBus::new();
    let (vms, runner) = super::build_engine(&store, &bus, &engine);

    let (scheduler, handle) = Scheduler::new(
        store.clone(),
        bus.clone(),
        Arc::new(FileResolver::new()),
        runner,
        SchedulerConfig {
            max_concurrent: engine.max_concurrent,
            poll_interval: Duration::from_millis(500),
        },
    );
    let shutdown = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));

    let state = AppState::new(store, bus, handle)
        .with_api_key(args.api_key)
        .with_webhook_secret(args.webhook_secret);
    let app = zephyr_api::routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!(listen = %args.listen, "starting server");
    let listener = TcpListener::bind(args.listen).await?;
    let http_shutdown = shutdown.clone();
    let serve = axum::serve(listener, app)
        .with_graceful_shutdown(async move { http_shutdown.cancelled().await });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        signal_shutdown.cancel();
    });
    serve.await?;

    // Cancel in-flight runs, then reclaim every remaining VM.
    scheduler_task.await?;
    vms.destroy_all().await?;
    info!("shutdown complete");
    Ok(0)
}
