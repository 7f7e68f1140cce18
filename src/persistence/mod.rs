//! Persistence layer.
//!
//! One SQLite database file in WAL journal mode holds the `signals`,
//! `positions`, `order_tracker` and `reentry_locks` tables. All access
//! goes through the store APIs which serialize writes internally; no
//! in-memory state duplicates durable state.
//!
//! Schema evolution is additive: tables are created if missing and new
//! columns are added with defaults behind a `pragma_table_info` check.

pub mod lifecycle_store;
pub mod models;
pub mod signal_store;
pub mod telemetry;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Database connection pool
pub type DbPool = SqlitePool;

/// Database initialization error
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Query error: {0}")]
    QueryError(String),
}

/// Initialize the database connection pool and run migrations.
///
/// # Arguments
/// - `database_url`: SQLite URL (e.g. `sqlite://data/kasima.db`)
pub async fn init_database(database_url: &str) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", database_url);

    // Ensure the data directory exists
    if let Some(db_path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
            })?;
        }
    }

    let in_memory = database_url.contains(":memory:");
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    // WAL applies to file-backed databases; in-memory ones ignore it.
    let options = if in_memory {
        options
    } else {
        options.journal_mode(SqliteJournalMode::Wal)
    };

    // Pooled in-memory connections would each get their own database.
    let max_connections = if in_memory { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    info!("Database initialized");

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS signals (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            channel_name      TEXT NOT NULL,
            chat_id           TEXT NOT NULL,
            message_id        INTEGER NOT NULL,
            message_ts        TEXT,
            received_at       TEXT NOT NULL,
            symbol            TEXT NOT NULL,
            side              TEXT NOT NULL CHECK(side IN ('LONG', 'SHORT')),
            entry_mid         TEXT NOT NULL,
            entry_low         TEXT,
            entry_high        TEXT,
            sl_price          TEXT,
            tp_prices         TEXT NOT NULL,
            declared_leverage TEXT,
            signal_type       TEXT,
            status            TEXT NOT NULL DEFAULT 'NEW',
            dedup_hash        TEXT NOT NULL,
            raw_text          TEXT NOT NULL,
            claimed_by        TEXT,
            claimed_at        TEXT,
            last_error        TEXT,
            UNIQUE(chat_id, message_id)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create signals table: {}", e)))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS positions (
            id                   INTEGER PRIMARY KEY AUTOINCREMENT,
            signal_id            INTEGER NOT NULL,
            bot_order_id         TEXT NOT NULL UNIQUE,
            symbol               TEXT NOT NULL,
            side                 TEXT NOT NULL CHECK(side IN ('LONG', 'SHORT')),
            state                TEXT NOT NULL,
            planned_qty          TEXT NOT NULL,
            filled_qty           TEXT NOT NULL DEFAULT '0',
            remaining_qty        TEXT NOT NULL DEFAULT '0',
            avg_entry_price      TEXT,
            original_entry_price TEXT,
            leverage             TEXT NOT NULL,
            initial_margin       TEXT NOT NULL,
            sl_price             TEXT,
            sl_order_id          TEXT,
            tp_levels            TEXT NOT NULL DEFAULT '[]',
            entry_order_ids      TEXT NOT NULL DEFAULT '[]',
            replacement_order_id TEXT,
            close_reason         TEXT,
            pyramid_state        TEXT NOT NULL DEFAULT '{"executed":[]}',
            hedge_state          TEXT NOT NULL DEFAULT 'NONE',
            hedge_entry_order_id TEXT,
            hedge_tp_order_id    TEXT,
            hedge_sl_order_id    TEXT,
            peak_price           TEXT,
            trailing_active      INTEGER NOT NULL DEFAULT 0,
            created_at           TEXT NOT NULL,
            updated_at           TEXT NOT NULL,
            FOREIGN KEY (signal_id) REFERENCES signals(id)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        DatabaseError::MigrationError(format!("Failed to create positions table: {}", e))
    })?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS order_tracker (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            position_id       INTEGER NOT NULL,
            order_id          TEXT NOT NULL UNIQUE,
            kind              TEXT NOT NULL,
            level_index       INTEGER,
            last_executed_qty TEXT NOT NULL DEFAULT '0',
            last_status       TEXT,
            created_at        TEXT NOT NULL,
            FOREIGN KEY (position_id) REFERENCES positions(id)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        DatabaseError::MigrationError(format!("Failed to create order_tracker table: {}", e))
    })?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reentry_locks (
            symbol     TEXT NOT NULL,
            side       TEXT NOT NULL,
            signal_id  INTEGER,
            reason     TEXT,
            locked_at  TEXT NOT NULL,
            PRIMARY KEY (symbol, side)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        DatabaseError::MigrationError(format!("Failed to create reentry_locks table: {}", e))
    })?;

    // Columns added after the first release (for databases migrated from
    // older versions).
    ensure_column(pool, "signals", "reentry_attempts", "INTEGER NOT NULL DEFAULT 0").await?;
    ensure_column(pool, "positions", "sl_amended_at", "TEXT").await?;

    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_signals_status ON signals(status)",
        "CREATE INDEX IF NOT EXISTS idx_signals_received_at ON signals(received_at)",
        "CREATE INDEX IF NOT EXISTS idx_signals_lookup ON signals(channel_name, symbol, side, received_at)",
        "CREATE INDEX IF NOT EXISTS idx_positions_state ON positions(state)",
        "CREATE INDEX IF NOT EXISTS idx_positions_signal ON positions(signal_id)",
        "CREATE INDEX IF NOT EXISTS idx_tracker_position ON order_tracker(position_id)",
        "CREATE INDEX IF NOT EXISTS idx_tracker_created ON order_tracker(created_at)",
    ] {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;
    }

    info!("Database migrations completed");

    Ok(())
}

/// Add a column if it does not exist yet. Safe for repeated runs.
async fn ensure_column(
    pool: &DbPool,
    table: &str,
    column: &str,
    declaration: &str,
) -> Result<(), DatabaseError> {
    let exists: (i64,) = sqlx::query_as(&format!(
        "SELECT COUNT(*) FROM pragma_table_info('{}') WHERE name = '{}'",
        table, column
    ))
    .fetch_one(pool)
    .await
    .unwrap_or((0,));

    if exists.0 == 0 {
        sqlx::query(&format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            table, column, declaration
        ))
        .execute(pool)
        .await
        .map_err(|e| {
            DatabaseError::MigrationError(format!(
                "Failed to add column {}.{}: {}",
                table, column, e
            ))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_init() {
        let pool = init_database("sqlite::memory:").await;
        assert!(pool.is_ok());
    }

    #[tokio::test]
    async fn test_migrations_create_tables() {
        let pool = init_database("sqlite::memory:").await.unwrap();

        let result: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' \
             AND name IN ('signals', 'positions', 'order_tracker', 'reentry_locks')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert_eq!(result.0, 4);
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        // Second run must be a no-op, including the additive columns.
        run_migrations(&pool).await.unwrap();

        let exists: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM pragma_table_info('signals') WHERE name='reentry_attempts'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(exists.0, 1);
    }
}
