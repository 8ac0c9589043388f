//! Persistence layer for the task store.
//!
//! SQLite via sqlx: pool management, embedded migrations, the task and log
//! models, and the repository that owns every status transition.

pub mod models;
pub mod repositories;
pub mod retry;
pub mod time;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use std::time::Duration;

use crate::Result;

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Upper bound for the pool size; SQLite readers stop scaling well past this.
const MAX_POOL_SIZE: u32 = 8;

/// Busy timeout in milliseconds.
const BUSY_TIMEOUT_MS: u64 = 30_000;

/// WAL auto-checkpoint threshold in pages (~4MB with 4KB pages).
const WAL_AUTOCHECKPOINT_PAGES: i32 = 1000;

async fn apply_per_connection_pragmas(
    conn: &mut sqlx::SqliteConnection,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "PRAGMA wal_autocheckpoint = {}",
        WAL_AUTOCHECKPOINT_PAGES
    ))
    .execute(&mut *conn)
    .await?;

    sqlx::query("PRAGMA temp_store = MEMORY")
        .execute(&mut *conn)
        .await?;

    Ok(())
}

async fn ensure_wal_mode(pool: &DbPool) -> std::result::Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    let row = sqlx::query("PRAGMA journal_mode")
        .fetch_one(&mut *conn)
        .await?;
    let mode: String = row.get(0);
    if mode != "wal" && mode != "memory" {
        tracing::warn!(journal_mode = %mode, "Journal mode is not WAL; re-setting");
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Default pool size derived from available cores.
pub fn default_pool_size() -> u32 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(2);
    (cores * 2).min(MAX_POOL_SIZE)
}

/// Initialize a connection pool with WAL mode, foreign keys and a busy timeout.
///
/// # Arguments
/// * `database_url` - SQLite database URL (e.g., "sqlite:contentgen.db?mode=rwc")
/// * `max_connections` - Maximum number of connections in the pool
pub async fn init_pool_with_size(database_url: &str, max_connections: u32) -> Result<DbPool> {
    let connect_options = SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))
        // Log rows cascade with their task.
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .after_connect(|conn, _meta| {
            Box::pin(async move { apply_per_connection_pragmas(&mut *conn).await })
        })
        .connect_with(connect_options)
        .await?;

    ensure_wal_mode(&pool).await?;

    tracing::info!(max_connections, "Database pool initialized");

    Ok(pool)
}

/// Initialize the connection pool with the default size.
pub async fn init_pool(database_url: &str) -> Result<DbPool> {
    init_pool_with_size(database_url, default_pool_size()).await
}

/// Apply the embedded, versioned schema.
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

/// Start a `BEGIN IMMEDIATE` transaction on a dedicated pool connection.
///
/// The write lock is taken up front, so a multi-statement batch such as a
/// bulk force-cancel never has to upgrade a read lock mid-way.
pub async fn begin_immediate(pool: &DbPool) -> Result<ImmediateTransaction> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(ImmediateTransaction::new(conn))
}

/// Manually managed immediate transaction.
///
/// Dropping it without `commit`/`rollback` closes the connection, which makes
/// SQLite roll the transaction back.
pub struct ImmediateTransaction {
    conn: sqlx::pool::PoolConnection<Sqlite>,
    finished: bool,
}

impl ImmediateTransaction {
    fn new(conn: sqlx::pool::PoolConnection<Sqlite>) -> Self {
        Self {
            conn,
            finished: false,
        }
    }

    pub async fn commit(mut self) -> Result<()> {
        sqlx::query("COMMIT").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<()> {
        sqlx::query("ROLLBACK").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }
}

impl std::ops::Deref for ImmediateTransaction {
    type Target = sqlx::SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for ImmediateTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for ImmediateTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.conn.close_on_drop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn file_pool(dir: &TempDir) -> DbPool {
        let path = dir.path().join("store.db");
        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy().replace('\\', "/"));
        init_pool(&url).await.unwrap()
    }

    #[tokio::test]
    async fn test_init_pool_uses_wal() {
        let dir = TempDir::new().unwrap();
        let pool = file_pool(&dir).await;

        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(result.0, "wal");
    }

    #[tokio::test]
    async fn test_migrations_create_task_tables() {
        let dir = TempDir::new().unwrap();
        let pool = file_pool(&dir).await;
        run_migrations(&pool).await.unwrap();

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert!(names.contains(&"generation_task"));
        assert!(names.contains(&"generation_task_log"));

        let indexes: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type='index' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        let names: Vec<&str> = indexes.iter().map(|t| t.0.as_str()).collect();
        assert!(names.contains(&"idx_generation_task_status"));
        assert!(names.contains(&"idx_generation_task_resource"));
        assert!(names.contains(&"uq_generation_task_active_resource"));
    }

    #[tokio::test]
    async fn test_dropped_immediate_transaction_rolls_back() {
        let dir = TempDir::new().unwrap();
        let pool = file_pool(&dir).await;
        run_migrations(&pool).await.unwrap();

        {
            let mut tx = begin_immediate(&pool).await.unwrap();
            sqlx::query(
                "INSERT INTO generation_task (task_id, resource_ref, task_type, status, created_at, updated_at) \
                 VALUES ('t1', 'r1', 'quiz_only', 'pending', 0, 0)",
            )
            .execute(&mut *tx)
            .await
            .unwrap();
        }

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM generation_task")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
