//! Optional trace-span persistence.
//!
//! Spans are best-effort: a failed write logs and returns, it never fails
//! the operation being traced.

use crate::error::Result;
use crate::pool::DbPool;
use chrono::{DateTime, Utc};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct TraceSpan {
    pub trace_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub attrs_json: Option<String>,
}

pub struct TraceSpanRepo {
    pool: DbPool,
}

impl TraceSpanRepo {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, span: &TraceSpan) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trace_spans (trace_id, parent_id, name, started_at, ended_at, attrs_json)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&span.trace_id)
        .bind(&span.parent_id)
        .bind(&span.name)
        .bind(span.started_at)
        .bind(span.ended_at)
        .bind(&span.attrs_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fire-and-forget variant used from hot paths.
    pub async fn record_best_effort(&self, span: &TraceSpan) {
        if let Err(e) = self.record(span).await {
            debug!(error = %e, span = %span.name, "Trace span write skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_pool, DbConfig};
    use crate::schema;

    #[tokio::test]
    async fn record_span() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        schema::migrate(&pool).await.unwrap();
        let repo = TraceSpanRepo::new(pool.clone());

        repo.record(&TraceSpan {
            trace_id: "t-1".into(),
            parent_id: None,
            name: "execute".into(),
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
            attrs_json: Some(r#"{"job":"job-A"}"#.into()),
        })
        .await
        .unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM trace_spans")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
