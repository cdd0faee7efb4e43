//! Database module for campus-notifier.
//!
//! The store is a SQLite database shared with the collaborator that owns all
//! record writes. This core reads timestamped entities and recipient
//! membership, appends to the notification ledger and flips recipient status.
//! Every component shares the single pool returned by [`init_pool`].

pub mod models;
pub mod repositories;
pub mod retry;
pub mod time;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Default connection pool size.
const DEFAULT_POOL_SIZE: u32 = 5;

/// How long a statement waits on the collaborator's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a caller waits for a free pooled connection.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pragmas that are per connection and not covered by the connect options.
const CONNECTION_PRAGMAS: &[&str] = &["PRAGMA wal_autocheckpoint = 1000", "PRAGMA temp_store = MEMORY"];

/// Open the shared store.
///
/// # Arguments
/// * `database_url` - SQLite database URL (e.g., "sqlite:student_bot.db?mode=rwc")
/// * `max_connections` - Maximum number of connections in the pool
pub async fn init_pool_with_size(
    database_url: &str,
    max_connections: u32,
) -> Result<DbPool, sqlx::Error> {
    let connect_options = SqliteConnectOptions::from_str(database_url)?
        // The collaborator keeps writing while we scan
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                for pragma in CONNECTION_PRAGMAS {
                    sqlx::query(pragma).execute(&mut *conn).await?;
                }
                Ok(())
            })
        })
        .connect_with(connect_options)
        .await?;

    let (journal_mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
        .fetch_one(&pool)
        .await?;
    if journal_mode != "wal" && journal_mode != "memory" {
        warn!(journal_mode = %journal_mode, "Store is not in WAL mode; scans may block the collaborator");
    }

    info!(max_connections, journal_mode = %journal_mode, "Database pool initialized");
    Ok(pool)
}

/// Open the shared store with the default pool size.
pub async fn init_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    init_pool_with_size(database_url, DEFAULT_POOL_SIZE).await
}

/// Apply the migrations owned by this crate (the notification ledger only).
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Ledger migrations applied");
    Ok(())
}
