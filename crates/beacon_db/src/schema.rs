//! Schema creation and version tracking.

use crate::error::Result;
use crate::pool::DbPool;
use tracing::info;

/// Current schema version. Increment when schema changes.
pub const SCHEMA_VERSION: i32 = 1;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS beacon_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        jobspec_id TEXT PRIMARY KEY,
        jobspec_data TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS executions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL,
        provider_id TEXT NOT NULL,
        region TEXT NOT NULL,
        model_id TEXT NOT NULL,
        question_id TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        output_json TEXT,
        receipt_json TEXT,
        region_claimed TEXT,
        region_observed TEXT,
        region_verified INTEGER,
        verification_method TEXT,
        evidence_ref TEXT,
        UNIQUE(job_id, region, model_id, question_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS outbox (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        topic TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        published_at TEXT,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transparency_log (
        log_index INTEGER PRIMARY KEY,
        execution_id INTEGER NOT NULL,
        job_id TEXT NOT NULL,
        region TEXT NOT NULL,
        provider_id TEXT NOT NULL,
        status TEXT NOT NULL,
        output_hash TEXT NOT NULL,
        receipt_hash TEXT NOT NULL,
        ipfs_cid TEXT NOT NULL DEFAULT '',
        prev_hash TEXT NOT NULL,
        merkle_tree_root TEXT NOT NULL,
        merkle_proof_json TEXT NOT NULL,
        logged_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS kv (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        expires_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS trace_spans (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        trace_id TEXT NOT NULL,
        parent_id TEXT,
        name TEXT NOT NULL,
        started_at TEXT NOT NULL,
        ended_at TEXT,
        attrs_json TEXT
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_executions_job_id ON executions(job_id)",
    "CREATE INDEX IF NOT EXISTS idx_outbox_unpublished ON outbox(published_at, id)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_transparency_log_index ON transparency_log(log_index)",
    "CREATE INDEX IF NOT EXISTS idx_transparency_execution ON transparency_log(execution_id)",
];

/// Create all tables and record the schema version.
pub async fn migrate(pool: &DbPool) -> Result<()> {
    for ddl in TABLES {
        sqlx::query(ddl).execute(pool).await?;
    }
    for ddl in INDEXES {
        sqlx::query(ddl).execute(pool).await?;
    }

    sqlx::query(
        r#"
        INSERT INTO beacon_meta (key, value) VALUES ('schema_version', ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(SCHEMA_VERSION.to_string())
    .execute(pool)
    .await?;

    info!(version = SCHEMA_VERSION, "Database schema ready");
    Ok(())
}

/// Read the recorded schema version, if any.
pub async fn current_version(pool: &DbPool) -> Result<Option<i32>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT value FROM beacon_meta WHERE key = 'schema_version'")
            .fetch_optional(pool)
            .await
            .ok()
            .flatten();
    Ok(row.and_then(|(v,)| v.parse().ok()))
}
