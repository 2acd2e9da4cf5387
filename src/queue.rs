use std::path::Path;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};

use crate::models::ScrobbleTrack;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub const QUEUE_DB_FILE: &str = "scrobbles.db";

/// Durable FIFO of scrobbles awaiting submission, one logical queue per
/// directory.
///
/// Rows are removed only by `mark_completed`, never by `dequeue`, so a crash
/// between the two re-delivers the batch instead of losing it. Writes are
/// synced on commit; an acknowledged `enqueue` survives power loss.
#[derive(Debug, Clone)]
pub struct ScrobbleQueue {
    pool: SqlitePool,
}

impl ScrobbleQueue {
    /// Open (or create) the queue database under `dir`.
    pub async fn open(dir: &Path) -> Result<Self, QueueError> {
        let database_path = dir.join(QUEUE_DB_FILE);
        info!("Opening scrobble queue at {}", database_path.display());

        let options = SqliteConnectOptions::new()
            .filename(&database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = SqlitePool::connect_with(options).await?;

        let queue = ScrobbleQueue { pool };
        queue.create_tables().await?;
        Ok(queue)
    }

    async fn create_tables(&self) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_scrobbles (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                track_id TEXT NOT NULL UNIQUE,
                artist TEXT NOT NULL,
                title TEXT NOT NULL,
                album TEXT,
                duration_secs INTEGER,
                timestamp INTEGER NOT NULL,
                source_id TEXT,
                queued_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Append a pending scrobble. Re-enqueueing the same track id keeps the
    /// original row, so callers may retry without creating duplicates.
    pub async fn enqueue(&self, track: &ScrobbleTrack) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO pending_scrobbles (
                track_id, artist, title, album,
                duration_secs, timestamp, source_id, queued_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&track.id)
        .bind(&track.artist)
        .bind(&track.title)
        .bind(&track.album)
        .bind(track.duration_secs.map(i64::from))
        .bind(track.timestamp)
        .bind(&track.source_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!("Scrobble {} already queued, keeping original", track.id);
        }
        Ok(())
    }

    /// Read up to `limit` pending scrobbles in enqueue order, without
    /// removing them.
    pub async fn dequeue(&self, limit: u32) -> Result<Vec<ScrobbleTrack>, QueueError> {
        let rows = sqlx::query(
            "SELECT * FROM pending_scrobbles ORDER BY seq ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ScrobbleTrack {
                id: row.get("track_id"),
                artist: row.get("artist"),
                title: row.get("title"),
                album: row.get("album"),
                duration_secs: row
                    .get::<Option<i64>, _>("duration_secs")
                    .map(|secs| secs as u32),
                timestamp: row.get("timestamp"),
                source_id: row.get("source_id"),
            })
            .collect())
    }

    /// Permanently remove the given ids in one statement. Ids that are no
    /// longer pending are ignored.
    pub async fn mark_completed(&self, track_ids: &[String]) -> Result<(), QueueError> {
        if track_ids.is_empty() {
            return Ok(());
        }

        let placeholders = vec!["?"; track_ids.len()].join(", ");
        let sql = format!(
            "DELETE FROM pending_scrobbles WHERE track_id IN ({})",
            placeholders
        );
        let mut query = sqlx::query(&sql);
        for id in track_ids {
            query = query.bind(id);
        }
        let result = query.execute(&self.pool).await?;
        debug!("Completed {} queued scrobbles", result.rows_affected());
        Ok(())
    }

    pub async fn pending_count(&self) -> Result<u64, QueueError> {
        let row = sqlx::query("SELECT COUNT(*) AS pending FROM pending_scrobbles")
            .fetch_one(&self.pool)
            .await?;
        let pending: i64 = row.get("pending");
        Ok(pending as u64)
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.pending_count().await? == 0)
    }

    /// Close the connection pool. Used by tests that reopen the same
    /// directory to prove durability.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
