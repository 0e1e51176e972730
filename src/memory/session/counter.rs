// src/memory/session/counter.rs

//! Durable per-session message counters and last-summary timestamps.
//!
//! Every mutation is a single UPSERT statement, so concurrent callers get
//! single-writer-per-row semantics from SQLite itself. Storage failures
//! never reach the caller as errors: write paths report success as a bool,
//! read paths fall back to defaults, and everything is logged.

use sqlx::{Row, SqlitePool};
use tracing::{debug, error, warn};

pub struct CounterStore {
    pool: SqlitePool,
}

impl CounterStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Add one to the un-summarized turn count for this session.
    pub async fn increment(&self, session_id: &str) -> bool {
        if session_id.is_empty() {
            warn!("Refusing to increment counter for empty session id");
            return false;
        }
        let result = sqlx::query(
            r#"
            INSERT INTO message_counts (session_id, count) VALUES (?, 1)
            ON CONFLICT(session_id) DO UPDATE SET count = count + 1
            "#,
        )
        .bind(session_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                error!("Failed to increment counter for session {}: {}", session_id, e);
                false
            }
        }
    }

    /// Reset the count to zero. Callers pair this with
    /// `set_last_summary_time` when a summarization is launched.
    pub async fn reset(&self, session_id: &str) -> bool {
        if session_id.is_empty() {
            warn!("Refusing to reset counter for empty session id");
            return false;
        }
        let result = sqlx::query(
            r#"
            INSERT INTO message_counts (session_id, count) VALUES (?, 0)
            ON CONFLICT(session_id) DO UPDATE SET count = 0
            "#,
        )
        .bind(session_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!("Counter reset to 0 for session {}", session_id);
                true
            }
            Err(e) => {
                error!("Failed to reset counter for session {}: {}", session_id, e);
                false
            }
        }
    }

    /// Current count; 0 for unknown sessions and on storage failure.
    pub async fn get(&self, session_id: &str) -> i64 {
        if session_id.is_empty() {
            warn!("Counter requested for empty session id, returning 0");
            return 0;
        }
        let result = sqlx::query("SELECT count FROM message_counts WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await;

        match result {
            Ok(Some(row)) => row.get::<i64, _>("count"),
            Ok(None) => 0,
            Err(e) => {
                error!("Failed to read counter for session {}: {}", session_id, e);
                0
            }
        }
    }

    /// Reconcile the stored count against the live history length. A
    /// history shorter than the count means the host truncated it
    /// externally; the count is clamped down (never up) to match. Returns
    /// false only when the clamp write fails.
    pub async fn adjust_if_necessary(&self, session_id: &str, history_len: usize) -> bool {
        if session_id.is_empty() {
            warn!("Refusing to adjust counter for empty session id");
            return false;
        }
        let current = self.get(session_id).await;
        let history_len = history_len as i64;
        if history_len >= current {
            debug!(
                "Counter for session {} consistent with history ({} >= {})",
                session_id, history_len, current
            );
            return true;
        }

        warn!(
            "History for session {} is shorter ({}) than the stored counter ({}), clamping",
            session_id, history_len, current
        );
        let result = sqlx::query(
            r#"
            INSERT INTO message_counts (session_id, count) VALUES (?, ?)
            ON CONFLICT(session_id) DO UPDATE SET count = excluded.count
            "#,
        )
        .bind(session_id)
        .bind(history_len)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                error!("Failed to clamp counter for session {}: {}", session_id, e);
                false
            }
        }
    }

    /// Stored last-summary timestamp, if the session has ever summarized.
    pub async fn last_summary_time(&self, session_id: &str) -> Option<f64> {
        if session_id.is_empty() {
            return None;
        }
        let result = sqlx::query(
            "SELECT last_summary_timestamp FROM session_summary_times WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(row) => row.map(|r| r.get::<f64, _>("last_summary_timestamp")),
            Err(e) => {
                error!(
                    "Failed to read last summary time for session {}: {}",
                    session_id, e
                );
                None
            }
        }
    }

    pub async fn set_last_summary_time(&self, session_id: &str, timestamp: f64) -> bool {
        if session_id.is_empty() {
            warn!("Refusing to persist summary time for empty session id");
            return false;
        }
        let result = sqlx::query(
            r#"
            INSERT INTO session_summary_times (session_id, last_summary_timestamp) VALUES (?, ?)
            ON CONFLICT(session_id) DO UPDATE SET last_summary_timestamp = excluded.last_summary_timestamp
            "#,
        )
        .bind(session_id)
        .bind(timestamp)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                error!(
                    "Failed to persist last summary time for session {}: {}",
                    session_id, e
                );
                false
            }
        }
    }
}
