//! Durable state and log store for Zephyr.
//!
//! A single embedded SQLite file holds projects, runs, jobs, steps, logs,
//! artifacts, secrets and webhook deliveries. Write-ahead logging and
//! foreign keys are always on; every state transition is one transaction.

pub mod error;
pub mod records;
pub mod recovery;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use records::*;
pub use recovery::RecoveryReport;
pub use store::Store;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Open (creating if missing) the database file and run migrations.
pub async fn open(path: impl AsRef<Path>) -> StoreResult<Store> {
    let url = format!("sqlite://{}", path.as_ref().display());
    let pool = create_pool(&url).await?;
    run_migrations(&pool).await?;
    Ok(Store::new(pool))
}

/// Create a new connection pool with WAL and foreign keys enabled.
pub async fn create_pool(database_url: &str) -> StoreResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &SqlitePool) -> StoreResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
