//! Job repository: admission writes and status CAS.

use crate::error::{DbError, Result};
use crate::models::JobRow;
use crate::pool::DbPool;
use beacon_protocol::JobStatus;
use chrono::Utc;
use tracing::info;

pub struct JobRepo {
    pool: DbPool,
}

impl JobRepo {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Admit-and-enqueue: insert the job row in `queued` state and the
    /// outbox row pointing at it, atomically. Either both commit or
    /// neither does.
    pub async fn admit_and_enqueue(
        &self,
        job_id: &str,
        spec_json: &str,
        topic: &str,
        payload_json: &str,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (jobspec_id, jobspec_data, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(job_id)
        .bind(spec_json)
        .bind(JobStatus::Queued.as_str())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            if DbError::is_unique_violation(&e) {
                return Err(DbError::duplicate(format!("job {job_id} already exists")));
            }
            return Err(e.into());
        }

        sqlx::query(
            r#"
            INSERT INTO outbox (topic, payload_json, attempts, created_at)
            VALUES (?, ?, 0, ?)
            "#,
        )
        .bind(topic)
        .bind(payload_json)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(job_id, "Job admitted and staged for publication");
        Ok(())
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<JobRow>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE jobspec_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<JobRow>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs ORDER BY created_at DESC, jobspec_id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Compare-and-set status transition. The caller asserts the expected
    /// prior status; a stale assertion surfaces as `Conflict`.
    pub async fn transition(
        &self,
        job_id: &str,
        expected: JobStatus,
        next: JobStatus,
    ) -> Result<()> {
        let affected = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, updated_at = ?
            WHERE jobspec_id = ? AND status = ?
            "#,
        )
        .bind(next.as_str())
        .bind(Utc::now())
        .bind(job_id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(DbError::conflict(format!(
                "job {job_id} is not in state {expected}"
            )));
        }
        info!(job_id, from = %expected, to = %next, "Job status transition");
        Ok(())
    }

    /// Liveness probe for readiness checks.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_pool, DbConfig};
    use crate::schema;

    async fn setup() -> DbPool {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        schema::migrate(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn admit_creates_job_and_outbox_atomically() {
        let pool = setup().await;
        let repo = JobRepo::new(pool.clone());

        repo.admit_and_enqueue("job-A", "{}", "jobs.submitted", r#"{"id":"job-A"}"#)
            .await
            .unwrap();

        let job = repo.get("job-A").await.unwrap().unwrap();
        assert_eq!(job.status(), Some(JobStatus::Queued));

        let (outbox_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM outbox")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(outbox_count, 1);
    }

    #[tokio::test]
    async fn duplicate_admit_is_rejected_without_orphan_outbox() {
        let pool = setup().await;
        let repo = JobRepo::new(pool.clone());

        repo.admit_and_enqueue("job-A", "{}", "jobs.submitted", "{}")
            .await
            .unwrap();
        let err = repo
            .admit_and_enqueue("job-A", "{}", "jobs.submitted", "{}")
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Duplicate(_)));

        let (outbox_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM outbox")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(outbox_count, 1);
    }

    #[tokio::test]
    async fn transition_enforces_expected_status() {
        let pool = setup().await;
        let repo = JobRepo::new(pool);
        repo.admit_and_enqueue("job-A", "{}", "jobs.submitted", "{}")
            .await
            .unwrap();

        repo.transition("job-A", JobStatus::Queued, JobStatus::Processing)
            .await
            .unwrap();

        let err = repo
            .transition("job-A", JobStatus::Queued, JobStatus::Processing)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));

        repo.transition("job-A", JobStatus::Processing, JobStatus::Completed)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn list_recent_orders_newest_first() {
        let pool = setup().await;
        let repo = JobRepo::new(pool);
        repo.admit_and_enqueue("job-1", "{}", "t", "{}").await.unwrap();
        repo.admit_and_enqueue("job-2", "{}", "t", "{}").await.unwrap();

        let jobs = repo.list_recent(10).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].jobspec_id, "job-2");
    }
}
