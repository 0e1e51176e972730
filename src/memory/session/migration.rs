// src/memory/session/migration.rs

//! Table creation for the durable counter store. Two independent tables:
//! counts move once per turn, summary timestamps once per summarization.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS message_counts (
            session_id TEXT PRIMARY KEY,
            count INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS session_summary_times (
            session_id TEXT PRIMARY KEY,
            last_summary_timestamp REAL NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
