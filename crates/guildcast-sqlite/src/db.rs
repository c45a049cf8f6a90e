//! Connection setup and schema bootstrap.
//!
//! Every table uses `CREATE TABLE IF NOT EXISTS`, so this is safe to run on
//! every start.

use std::str::FromStr;
use std::time::Duration;

use guildcast_core::domain::GuildcastError;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::info;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS dispatches (
    dispatch_id     TEXT PRIMARY KEY NOT NULL,
    origin_guild_id TEXT,
    message         TEXT NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS consumptions (
    dispatch_id     TEXT NOT NULL REFERENCES dispatches(dispatch_id),
    guild_id        TEXT NOT NULL,
    consumed_at     TEXT NOT NULL,
    PRIMARY KEY (dispatch_id, guild_id)
);

CREATE TABLE IF NOT EXISTS tasks (
    task_id         TEXT PRIMARY KEY NOT NULL,
    kind            TEXT NOT NULL,
    parameters      TEXT NOT NULL,
    failed_attempts INTEGER NOT NULL DEFAULT 0,
    state           TEXT NOT NULL CHECK(state IN ('pending','in_progress')),
    available_at    INTEGER NOT NULL,
    claim_token     TEXT,
    claimed_until   INTEGER,
    last_error      TEXT,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS dead_letters (
    task_id          TEXT PRIMARY KEY NOT NULL,
    kind             TEXT NOT NULL,
    parameters       TEXT NOT NULL,
    failed_attempts  INTEGER NOT NULL,
    reason           TEXT NOT NULL,
    error_kind       TEXT NOT NULL,
    failure          TEXT NOT NULL,
    dead_lettered_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_claimable ON tasks(state, available_at);
CREATE INDEX IF NOT EXISTS idx_tasks_claimed_until ON tasks(state, claimed_until);
";

/// Open a pool for `url` (`sqlite://path` or `sqlite::memory:`) with foreign
/// keys enforced, and apply the schema.
///
/// An in-memory database lives inside a single connection, so the pool is
/// capped at one connection that is never recycled.
pub async fn connect(url: &str) -> Result<SqlitePool, GuildcastError> {
    let in_memory = url.contains(":memory:") || url.contains("mode=memory");

    let mut options = SqliteConnectOptions::from_str(url)
        .map_err(persistence)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(8)
    };
    let pool = pool_options
        .connect_with(options)
        .await
        .map_err(persistence)?;

    bootstrap_schema(&pool).await?;
    info!(url, "sqlite store ready");
    Ok(pool)
}

pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<(), GuildcastError> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(persistence)?;
    Ok(())
}

pub(crate) fn persistence(err: sqlx::Error) -> GuildcastError {
    GuildcastError::Persistence(err.to_string())
}

pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_foreign_key_violation())
}

/// File-backed databases for tests that need several real connections.
#[cfg(test)]
pub(crate) mod testing {
    use std::path::PathBuf;

    use sqlx::SqlitePool;
    use ulid::Ulid;

    use super::connect;

    /// A database file under the temp dir, removed with its WAL files on drop.
    pub(crate) struct TempDb {
        path: PathBuf,
    }

    impl TempDb {
        pub(crate) fn new() -> Self {
            Self {
                path: std::env::temp_dir().join(format!("guildcast-{}.db", Ulid::new())),
            }
        }

        pub(crate) fn url(&self) -> String {
            format!("sqlite://{}", self.path.display())
        }

        /// A fresh pool of up to 8 connections on the file.
        pub(crate) async fn pool(&self) -> SqlitePool {
            connect(&self.url()).await.unwrap()
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            for suffix in ["", "-wal", "-shm"] {
                let _ = std::fs::remove_file(format!("{}{suffix}", self.path.display()));
            }
        }
    }
}
