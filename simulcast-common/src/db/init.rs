//! Database initialization
//!
//! Creates the database on first run with an idempotent schema: every
//! worker process can call this on startup without coordination.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // Enable foreign keys
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    // WAL mode: concurrent readers with one writer, needed because every
    // worker process opens the same file
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_broadcasts_table(&pool).await?;
    create_playlist_items_table(&pool).await?;

    Ok(pool)
}

async fn create_broadcasts_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS broadcasts (
            id TEXT PRIMARY KEY,
            slug TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL DEFAULT '',
            start_at_ms INTEGER NOT NULL,
            loop_count INTEGER NOT NULL DEFAULT 1,
            drift_tolerance_secs REAL NOT NULL DEFAULT 5.0,
            resync_interval_ms INTEGER NOT NULL DEFAULT 5000,
            forced_stop_at_ms INTEGER,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_playlist_items_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS playlist_items (
            id TEXT PRIMARY KEY,
            broadcast_id TEXT NOT NULL REFERENCES broadcasts(id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            media_id TEXT NOT NULL,
            access_policy TEXT NOT NULL DEFAULT 'public',
            duration_secs REAL NOT NULL,
            UNIQUE (broadcast_id, position)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}
