//! Transparency log rows. Append-only; the writer owns index assignment.

use crate::error::{DbError, Result};
use crate::models::TransparencyRow;
use crate::pool::DbPool;

pub struct TransparencyRepo {
    pool: DbPool,
}

impl TransparencyRepo {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Persist one log entry. The log writer serializes appends, so a
    /// colliding index here means the writer invariant was violated.
    pub async fn append(&self, row: &TransparencyRow) -> Result<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO transparency_log (
                log_index, execution_id, job_id, region, provider_id, status,
                output_hash, receipt_hash, ipfs_cid, prev_hash,
                merkle_tree_root, merkle_proof_json, logged_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.log_index)
        .bind(row.execution_id)
        .bind(&row.job_id)
        .bind(&row.region)
        .bind(&row.provider_id)
        .bind(&row.status)
        .bind(&row.output_hash)
        .bind(&row.receipt_hash)
        .bind(&row.ipfs_cid)
        .bind(&row.prev_hash)
        .bind(&row.merkle_tree_root)
        .bind(&row.merkle_proof_json)
        .bind(row.logged_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(e) if DbError::is_unique_violation(&e) => Err(DbError::duplicate(format!(
                "transparency index {} already written",
                row.log_index
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM transparency_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn get_by_index(&self, log_index: i64) -> Result<Option<TransparencyRow>> {
        let row = sqlx::query_as::<_, TransparencyRow>(
            "SELECT * FROM transparency_log WHERE log_index = ?",
        )
        .bind(log_index)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_by_execution(&self, execution_id: i64) -> Result<Option<TransparencyRow>> {
        let row = sqlx::query_as::<_, TransparencyRow>(
            "SELECT * FROM transparency_log WHERE execution_id = ? ORDER BY log_index ASC LIMIT 1",
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_by_cid(&self, ipfs_cid: &str) -> Result<Option<TransparencyRow>> {
        let row = sqlx::query_as::<_, TransparencyRow>(
            "SELECT * FROM transparency_log WHERE ipfs_cid = ? ORDER BY log_index ASC LIMIT 1",
        )
        .bind(ipfs_cid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Every entry in index order, for rebuilding the in-memory tree at
    /// startup.
    pub async fn list_all(&self) -> Result<Vec<TransparencyRow>> {
        let rows = sqlx::query_as::<_, TransparencyRow>(
            "SELECT * FROM transparency_log ORDER BY log_index ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_pool, DbConfig};
    use crate::schema;
    use chrono::Utc;

    fn row(log_index: i64, execution_id: i64) -> TransparencyRow {
        TransparencyRow {
            log_index,
            execution_id,
            job_id: "job-A".into(),
            region: "US".into(),
            provider_id: "provider-1".into(),
            status: "completed".into(),
            output_hash: format!("out-{log_index}"),
            receipt_hash: format!("rcpt-{log_index}"),
            ipfs_cid: format!("cid-{log_index}"),
            prev_hash: String::new(),
            merkle_tree_root: format!("root-{log_index}"),
            merkle_proof_json: "[]".into(),
            logged_at: Utc::now(),
        }
    }

    async fn setup() -> TransparencyRepo {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        schema::migrate(&pool).await.unwrap();
        TransparencyRepo::new(pool)
    }

    #[tokio::test]
    async fn append_and_lookup() {
        let repo = setup().await;
        repo.append(&row(0, 11)).await.unwrap();
        repo.append(&row(1, 12)).await.unwrap();

        assert_eq!(repo.count().await.unwrap(), 2);
        assert!(repo.get_by_index(0).await.unwrap().is_some());
        assert_eq!(
            repo.get_by_execution(12).await.unwrap().unwrap().log_index,
            1
        );
        assert_eq!(repo.get_by_cid("cid-0").await.unwrap().unwrap().log_index, 0);
        assert!(repo.get_by_index(7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_index_is_rejected() {
        let repo = setup().await;
        repo.append(&row(0, 1)).await.unwrap();
        let err = repo.append(&row(0, 2)).await.unwrap_err();
        assert!(matches!(err, DbError::Duplicate(_)));
    }

    #[tokio::test]
    async fn list_all_is_index_ordered() {
        let repo = setup().await;
        repo.append(&row(0, 1)).await.unwrap();
        repo.append(&row(1, 2)).await.unwrap();
        repo.append(&row(2, 3)).await.unwrap();

        let all = repo.list_all().await.unwrap();
        let indexes: Vec<i64> = all.iter().map(|r| r.log_index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
    }
}
