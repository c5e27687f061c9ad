//! Zephyr CLI.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "zephyr")]
#[command(about = "Zephyr CI: pipelines in microVMs", long_about = None)]
struct Cli {
    /// API server URL (for `trigger`)
    #[arg(long, env = "ZEPHYR_API_URL", default_value = "http://localhost:8090")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold a pipeline configuration in the current directory
    Init {
        /// Path to write
        #[arg(default_value = "zephyr.yml")]
        path: PathBuf,
    },
    /// Execute a pipeline locally and stream its logs
    Run {
        /// Pipeline configuration file
        #[arg(default_value = "zephyr.yml")]
        config: PathBuf,
        /// Branch the run pretends to be on
        #[arg(long, default_value = "main")]
        branch: String,
        #[command(flatten)]
        engine: commands::EngineArgs,
    },
    /// Start the scheduler and HTTP API
    Server {
        #[command(flatten)]
        server: commands::ServerArgs,
        #[command(flatten)]
        engine: commands::EngineArgs,
    },
    /// Start the dashboard server (serves the same API)
    Ui {
        #[command(flatten)]
        server: commands::ServerArgs,
        #[command(flatten)]
        engine: commands::EngineArgs,
    },
    /// Trigger a run through a running server
    Trigger {
        /// Project name or id
        project: String,
        /// Pipeline name
        #[arg(long, default_value = "ci")]
        pipeline: String,
        /// Branch to report
        #[arg(long)]
        branch: Option<String>,
        /// API key, when the server requires one
        #[arg(long, env = "ZEPHYR_API_KEY")]
        api_key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let exit_code = match cli.command {
        Commands::Init { path } => commands::init(&path)?,
        Commands::Run {
            config,
            branch,
            engine,
        } => commands::run(&config, &branch, engine).await?,
        Commands::Server { server, engine } | Commands::Ui { server, engine } => {
            commands::server(server, engine).await?
        }
        Commands::Trigger {
            project,
            pipeline,
            branch,
            api_key,
        } => commands::trigger(&cli.api_url, &project, &pipeline, branch, api_key).await?,
    };

    std::process::exit(exit_code);
}
