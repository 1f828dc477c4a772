//! Key-value store with TTL, used for replay nonces.

use crate::error::Result;
use crate::pool::DbPool;
use chrono::{Duration, Utc};

pub struct KvStore {
    pool: DbPool,
}

impl KvStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Atomic set-if-absent with TTL.
    ///
    /// Returns `true` when this call inserted the key. A live existing key
    /// keeps its value and returns `false`; an expired one is replaced.
    pub async fn set_if_absent(&self, key: &str, value: &str, ttl_secs: i64) -> Result<bool> {
        let now = Utc::now();
        let expires_at = now + Duration::seconds(ttl_secs);
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM kv WHERE key = ? AND expires_at IS NOT NULL AND expires_at <= ?")
            .bind(key)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        let affected = sqlx::query(
            r#"
            INSERT INTO kv (key, value, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(affected > 0)
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT value FROM kv
            WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(key)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(v,)| v))
    }

    /// Remove expired rows. Called opportunistically; correctness does not
    /// depend on it.
    pub async fn purge_expired(&self) -> Result<u64> {
        let affected =
            sqlx::query("DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?")
                .bind(Utc::now())
                .execute(&self.pool)
                .await?
                .rows_affected();
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_pool, DbConfig};
    use crate::schema;

    async fn setup() -> KvStore {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        schema::migrate(&pool).await.unwrap();
        KvStore::new(pool)
    }

    #[tokio::test]
    async fn second_set_loses() {
        let store = setup().await;
        assert!(store.set_if_absent("nonce:kid:n1", "1", 600).await.unwrap());
        assert!(!store.set_if_absent("nonce:kid:n1", "2", 600).await.unwrap());
        assert_eq!(store.get("nonce:kid:n1").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn expired_key_can_be_reused() {
        let store = setup().await;
        // TTL in the past: the key is immediately expired.
        assert!(store.set_if_absent("k", "old", -1).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_if_absent("k", "new", 600).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn purge_removes_only_expired() {
        let store = setup().await;
        store.set_if_absent("dead", "x", -1).await.unwrap();
        store.set_if_absent("live", "y", 600).await.unwrap();

        let purged = store.purge_expired().await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.get("live").await.unwrap().as_deref(), Some("y"));
    }
}
