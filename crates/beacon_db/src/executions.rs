//! Execution repository: idempotent inserts keyed by plan, status CAS.

use crate::error::{DbError, Result};
use crate::models::ExecutionRow;
use crate::pool::DbPool;
use beacon_protocol::{ExecutionStatus, Plan};
use chrono::Utc;
use tracing::debug;

pub struct ExecutionRepo {
    pool: DbPool,
}

impl ExecutionRepo {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a new execution in `created` state.
    ///
    /// The `(job_id, region, model_id, question_id)` key dedups dispatch
    /// retries: a second insert for the same plan surfaces as `Duplicate`
    /// so the executor attaches to the existing row instead.
    pub async fn insert_created(
        &self,
        job_id: &str,
        provider_id: &str,
        plan: &Plan,
    ) -> Result<ExecutionRow> {
        let question_id = plan.question_id.as_deref().unwrap_or("");
        let inserted = sqlx::query(
            r#"
            INSERT INTO executions (job_id, provider_id, region, model_id, question_id, status)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job_id)
        .bind(provider_id)
        .bind(&plan.region)
        .bind(&plan.model_id)
        .bind(question_id)
        .bind(ExecutionStatus::Created.as_str())
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(done) => {
                let id = done.last_insert_rowid();
                debug!(job_id, region = %plan.region, model = %plan.model_id, id, "Execution created");
                self.get(id)
                    .await?
                    .ok_or_else(|| DbError::not_found(format!("execution {id}")))
            }
            Err(e) if DbError::is_unique_violation(&e) => Err(DbError::duplicate(format!(
                "execution for job {job_id} plan ({}, {}, {question_id}) already recorded",
                plan.region, plan.model_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn find_by_plan(&self, job_id: &str, plan: &Plan) -> Result<Option<ExecutionRow>> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT * FROM executions
            WHERE job_id = ? AND region = ? AND model_id = ? AND question_id = ?
            "#,
        )
        .bind(job_id)
        .bind(&plan.region)
        .bind(&plan.model_id)
        .bind(plan.question_id.as_deref().unwrap_or(""))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get(&self, id: i64) -> Result<Option<ExecutionRow>> {
        let row = sqlx::query_as::<_, ExecutionRow>("SELECT * FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// `created -> running`, recording `started_at`.
    pub async fn mark_running(&self, id: i64) -> Result<()> {
        let affected = sqlx::query(
            r#"
            UPDATE executions
            SET status = ?, started_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(ExecutionStatus::Running.as_str())
        .bind(Utc::now())
        .bind(id)
        .bind(ExecutionStatus::Created.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(DbError::conflict(format!("execution {id} is not in created state")));
        }
        Ok(())
    }

    /// Move a live execution to a terminal state with its output and
    /// receipt. Accepts both `created` and `running` so plans cancelled
    /// before their first transition can still be marked `timeout`.
    pub async fn finish(
        &self,
        id: i64,
        status: ExecutionStatus,
        output_json: Option<&str>,
        receipt_json: Option<&str>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(DbError::conflict(format!("{status} is not a terminal status")));
        }

        let affected = sqlx::query(
            r#"
            UPDATE executions
            SET status = ?, completed_at = ?, output_json = ?, receipt_json = ?
            WHERE id = ? AND status IN (?, ?)
            "#,
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(output_json)
        .bind(receipt_json)
        .bind(id)
        .bind(ExecutionStatus::Created.as_str())
        .bind(ExecutionStatus::Running.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(DbError::conflict(format!(
                "execution {id} already reached a terminal state"
            )));
        }
        Ok(())
    }

    /// Persist preflight region verification fields.
    pub async fn record_region_verification(
        &self,
        id: i64,
        claimed: &str,
        observed: &str,
        verified: bool,
        method: &str,
        evidence_ref: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE executions
            SET region_claimed = ?, region_observed = ?, region_verified = ?,
                verification_method = ?, evidence_ref = ?
            WHERE id = ?
            "#,
        )
        .bind(claimed)
        .bind(observed)
        .bind(verified)
        .bind(method)
        .bind(evidence_ref)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_for_job(&self, job_id: &str) -> Result<Vec<ExecutionRow>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM executions WHERE job_id = ? ORDER BY id ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_page(&self, page: u32, per_page: u32) -> Result<Vec<ExecutionRow>> {
        let offset = i64::from(page.saturating_sub(1)) * i64::from(per_page);
        let rows = sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM executions ORDER BY id DESC LIMIT ? OFFSET ?",
        )
        .bind(i64::from(per_page))
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
