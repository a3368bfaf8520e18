//! Durable per-session turn counter
//!
//! Counts turns accumulated since the last successful summarization.
//! Backed by SQLite so counts survive restarts; every mutation is a single
//! statement so concurrent sessions stay consistent.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use crate::error::{MnemosyneError, Result};

/// SQLite-backed counter of unsummarized turns per session
pub struct TurnCounter {
    pool: SqlitePool,
}

impl TurnCounter {
    /// Open (or create) the counter database at the given path.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| MnemosyneError::Counter(format!("Failed to open counter db: {e}")))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS turn_counts (
                session_id TEXT PRIMARY KEY,
                count INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| MnemosyneError::Counter(format!("Failed to create counter table: {e}")))?;

        Ok(Self { pool })
    }

    /// In-memory database, for tests and ephemeral deployments.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| MnemosyneError::Counter(format!("Invalid sqlite url: {e}")))?;

        // A single connection: each :memory: connection is its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| MnemosyneError::Counter(format!("Failed to open counter db: {e}")))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS turn_counts (
                session_id TEXT PRIMARY KEY,
                count INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| MnemosyneError::Counter(format!("Failed to create counter table: {e}")))?;

        Ok(Self { pool })
    }

    /// Atomically increment a session's counter and return the new value.
    pub async fn increment(&self, session_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO turn_counts (session_id, count) VALUES (?1, 1)
             ON CONFLICT(session_id) DO UPDATE SET count = count + 1
             RETURNING count",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| MnemosyneError::Counter(format!("Failed to increment counter: {e}")))?;

        row.try_get("count")
            .map_err(|e| MnemosyneError::Counter(format!("Failed to read counter: {e}")))
    }

    /// Current counter value; 0 for unseen sessions.
    pub async fn get(&self, session_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT count FROM turn_counts WHERE session_id = ?1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| MnemosyneError::Counter(format!("Failed to read counter: {e}")))?;

        match row {
            Some(row) => row
                .try_get("count")
                .map_err(|e| MnemosyneError::Counter(format!("Failed to read counter: {e}"))),
            None => Ok(0),
        }
    }

    /// Reset a session's counter to zero.
    pub async fn reset(&self, session_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO turn_counts (session_id, count) VALUES (?1, 0)
             ON CONFLICT(session_id) DO UPDATE SET count = 0",
        )
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(|e| MnemosyneError::Counter(format!("Failed to reset counter: {e}")))?;

        Ok(())
    }

    /// Force the counter down to the session's actual history length when it
    /// has drifted above it (history trimmed, state lost, etc.). Returns
    /// false when a correction was applied.
    pub async fn reconcile(&self, session_id: &str, history_len: i64) -> Result<bool> {
        let count = self.get(session_id).await?;
        if count <= history_len {
            return Ok(true);
        }

        tracing::warn!(
            session_id,
            count,
            history_len,
            "Counter exceeds history length, correcting"
        );

        sqlx::query("UPDATE turn_counts SET count = ?2 WHERE session_id = ?1")
            .bind(session_id)
            .bind(history_len)
            .execute(&self.pool)
            .await
            .map_err(|e| MnemosyneError::Counter(format!("Failed to correct counter: {e}")))?;

        Ok(false)
    }
}
