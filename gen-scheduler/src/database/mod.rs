//! Persistence layer: SQLite through sqlx.
//!
//! Task claims and rate-limit acquisitions both depend on `BEGIN IMMEDIATE`:
//! the write lock is held before any candidate row is read, so two
//! connections can never observe the same row as claimable.

pub mod models;
pub mod repositories;
pub mod retry;
pub mod time;

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite, SqliteConnection};
use std::str::FromStr;
use std::time::Duration;

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Statements run on every new connection.
const CONNECTION_PRAGMAS: [&str; 2] = ["PRAGMA wal_autocheckpoint = 1000", "PRAGMA temp_store = MEMORY"];

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct DbOptions {
    pub max_connections: u32,
    /// How long a connection waits on the write lock before SQLITE_BUSY.
    /// Claimers queue behind each other for at most this long.
    pub busy_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            max_connections: 8,
            busy_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

async fn prepare_connection(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    for pragma in CONNECTION_PRAGMAS {
        sqlx::query(pragma).execute(&mut *conn).await?;
    }
    Ok(())
}

/// The journal mode is persistent per file; repair it if something switched it off.
async fn ensure_wal_mode(pool: &DbPool) -> Result<(), sqlx::Error> {
    let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
        .fetch_one(pool)
        .await?;
    if !matches!(mode.as_str(), "wal" | "memory") {
        tracing::warn!(journal_mode = %mode, "Database not in WAL mode, switching");
        sqlx::query("PRAGMA journal_mode = WAL").execute(pool).await?;
    }
    Ok(())
}

/// Open a WAL-mode pool.
///
/// `database_url` is a sqlx SQLite URL such as `sqlite:gen-scheduler.db?mode=rwc`.
pub async fn connect(database_url: &str, options: &DbOptions) -> Result<DbPool, sqlx::Error> {
    let connect_options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(options.busy_timeout);

    let pool = SqlitePoolOptions::new()
        .max_connections(options.max_connections)
        .acquire_timeout(options.acquire_timeout)
        .after_connect(|conn, _meta| Box::pin(prepare_connection(conn)))
        .connect_with(connect_options)
        .await?;

    ensure_wal_mode(&pool).await?;
    tracing::info!(
        max_connections = options.max_connections,
        "Database pool ready"
    );
    Ok(pool)
}

/// Open a pool with default options and the given connection ceiling.
pub async fn init_pool_with_size(
    database_url: &str,
    max_connections: u32,
) -> Result<DbPool, sqlx::Error> {
    let options = DbOptions {
        max_connections,
        ..DbOptions::default()
    };
    connect(database_url, &options).await
}

pub async fn init_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    connect(database_url, &DbOptions::default()).await
}

pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database schema up to date");
    Ok(())
}

/// Open a transaction that takes the SQLite write lock up front.
pub async fn begin_immediate(pool: &DbPool) -> Result<ImmediateTransaction, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(ImmediateTransaction { conn, open: true })
}

/// A `BEGIN IMMEDIATE` transaction on a pooled connection.
///
/// If it is dropped while still open, the connection is closed rather than
/// returned to the pool, and SQLite discards the transaction with it.
pub struct ImmediateTransaction {
    conn: PoolConnection<Sqlite>,
    open: bool,
}

impl ImmediateTransaction {
    pub async fn commit(self) -> Result<(), sqlx::Error> {
        self.finish("COMMIT").await
    }

    pub async fn rollback(self) -> Result<(), sqlx::Error> {
        self.finish("ROLLBACK").await
    }

    async fn finish(mut self, statement: &'static str) -> Result<(), sqlx::Error> {
        sqlx::query(statement).execute(&mut *self.conn).await?;
        self.open = false;
        Ok(())
    }
}

impl std::ops::Deref for ImmediateTransaction {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        &self.conn
    }
}

impl std::ops::DerefMut for ImmediateTransaction {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }
}

impl Drop for ImmediateTransaction {
    fn drop(&mut self) {
        if self.open {
            self.conn.close_on_drop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn file_pool(dir: &TempDir) -> DbPool {
        let path = dir.path().join("db_mod.db");
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
    async fn test_migrations_create_tables() {
        let dir = TempDir::new().unwrap();
        let pool = file_pool(&dir).await;
        run_migrations(&pool).await.unwrap();

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        for table in [
            "generation_task",
            "composite_record",
            "page_task",
            "rate_limit_hit",
            "app_setting",
        ] {
            assert!(names.contains(&table), "{table} table missing");
        }
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let dir = TempDir::new().unwrap();
        let pool = file_pool(&dir).await;
        run_migrations(&pool).await.unwrap();

        {
            let mut tx = begin_immediate(&pool).await.unwrap();
            sqlx::query("INSERT INTO app_setting (key, value, updated_at) VALUES ('k', '1', 0)")
                .execute(&mut *tx)
                .await
                .unwrap();
        }

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM app_setting")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }
}
