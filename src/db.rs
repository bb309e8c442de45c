//! SQLite connection pool for the job store and settings.
//!
//! The pool runs in WAL mode so status polls never block on a running job's
//! progress writes, and waits on a locked database instead of failing: the
//! CLI and `trk serve` may open the same file.

use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::time::Duration;

use crate::config::Config;

/// How long a statement waits on a lock held by another connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Connections beyond one per worker, for the dispatcher and API reads.
const SPARE_CONNECTIONS: u32 = 3;

/// Opens (creating if needed) the database at `[db].path`.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    let max_connections = config.runner.workers as u32 + SPARE_CONNECTIONS;
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    tracing::debug!(path = %db_path.display(), max_connections, "database opened");
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn creates_missing_directories_in_wal_mode() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("nested/dir/jobs.sqlite"));
        let pool = connect(&config).await.unwrap();

        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        assert!(tmp.path().join("nested/dir/jobs.sqlite").exists());
    }

    #[tokio::test]
    async fn pool_has_room_for_every_worker() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::with_db_path(tmp.path().join("jobs.sqlite"));
        config.runner.workers = 4;
        let pool = connect(&config).await.unwrap();
        assert_eq!(pool.options().get_max_connections(), 4 + SPARE_CONNECTIONS);
    }
}
