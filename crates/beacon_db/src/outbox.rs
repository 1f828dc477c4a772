//! Outbox repository: FIFO selection, publication marking, dead-letter.

use crate::error::Result;
use crate::models::{OutboxRow, OutboxStats};
use crate::pool::DbPool;
use chrono::Utc;
use tracing::warn;

pub struct OutboxRepo {
    pool: DbPool,
}

impl OutboxRepo {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Stage a payload outside an admission transaction. Admission itself
    /// uses `JobRepo::admit_and_enqueue`.
    pub async fn insert(&self, topic: &str, payload_json: &str) -> Result<i64> {
        let done = sqlx::query(
            r#"
            INSERT INTO outbox (topic, payload_json, attempts, created_at)
            VALUES (?, ?, 0, ?)
            "#,
        )
        .bind(topic)
        .bind(payload_json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(done.last_insert_rowid())
    }

    /// Unpublished rows in FIFO order. Monotone id provides the ordering.
    pub async fn fetch_unpublished(&self, limit: i64) -> Result<Vec<OutboxRow>> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            SELECT * FROM outbox
            WHERE published_at IS NULL
            ORDER BY id ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn mark_published(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE outbox SET published_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_failure(&self, id: i64, error: &str) -> Result<i64> {
        sqlx::query(
            r#"
            UPDATE outbox
            SET attempts = attempts + 1, last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        let (attempts,): (i64,) = sqlx::query_as("SELECT attempts FROM outbox WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(attempts)
    }

    /// Rewrite the row onto the dead-letter topic and mark it published so
    /// the main loop stops retrying it.
    pub async fn dead_letter(&self, id: i64, dead_letter_topic: &str) -> Result<()> {
        warn!(id, topic = dead_letter_topic, "Outbox row dead-lettered");
        sqlx::query(
            r#"
            UPDATE outbox
            SET topic = ?, published_at = ?
            WHERE id = ?
            "#,
        )
        .bind(dead_letter_topic)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Unpublished count and age of the oldest unpublished row.
    pub async fn stats(&self) -> Result<OutboxStats> {
        let (unpublished,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM outbox WHERE published_at IS NULL")
                .fetch_one(&self.pool)
                .await?;

        let oldest: Option<(chrono::DateTime<Utc>,)> = sqlx::query_as(
            r#"
            SELECT created_at FROM outbox
            WHERE published_at IS NULL
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let oldest_age_secs = oldest
            .map(|(created_at,)| (Utc::now() - created_at).num_seconds().max(0))
            .unwrap_or(0);

        Ok(OutboxStats {
            unpublished,
            oldest_age_secs,
        })
    }
}
