//! Row structs shared by the repositories.

use beacon_protocol::{ExecutionStatus, JobStatus};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;

/// One admitted job. `jobspec_data` is the spec exactly as admitted.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub jobspec_id: String,
    pub jobspec_data: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRow {
    pub fn status(&self) -> Option<JobStatus> {
        self.status.parse().ok()
    }

    pub fn spec_value(&self) -> Option<Value> {
        serde_json::from_str(&self.jobspec_data).ok()
    }
}

/// One plan's persisted attempt.
///
/// `question_id` is stored as an empty string rather than NULL so the
/// `(job_id, region, model_id, question_id)` uniqueness key also covers
/// plans without questions.
#[derive(Debug, Clone, FromRow)]
pub struct ExecutionRow {
    pub id: i64,
    pub job_id: String,
    pub provider_id: String,
    pub region: String,
    pub model_id: String,
    pub question_id: String,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output_json: Option<String>,
    pub receipt_json: Option<String>,
    pub region_claimed: Option<String>,
    pub region_observed: Option<String>,
    pub region_verified: Option<bool>,
    pub verification_method: Option<String>,
    pub evidence_ref: Option<String>,
}

impl ExecutionRow {
    pub fn status(&self) -> Option<ExecutionStatus> {
        self.status.parse().ok()
    }

    pub fn question_id_opt(&self) -> Option<&str> {
        if self.question_id.is_empty() {
            None
        } else {
            Some(&self.question_id)
        }
    }

    pub fn output_value(&self) -> Option<Value> {
        self.output_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    pub fn receipt_value(&self) -> Option<Value> {
        self.receipt_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// One staged queue publication. Unpublished iff `published_at IS NULL`.
#[derive(Debug, Clone, FromRow)]
pub struct OutboxRow {
    pub id: i64,
    pub topic: String,
    pub payload_json: String,
    pub published_at: Option<DateTime<Utc>>,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Gauge snapshot for the publisher loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutboxStats {
    pub unpublished: i64,
    pub oldest_age_secs: i64,
}

/// One transparency log entry as persisted.
#[derive(Debug, Clone, FromRow)]
pub struct TransparencyRow {
    pub log_index: i64,
    pub execution_id: i64,
    pub job_id: String,
    pub region: String,
    pub provider_id: String,
    pub status: String,
    pub output_hash: String,
    pub receipt_hash: String,
    pub ipfs_cid: String,
    pub prev_hash: String,
    pub merkle_tree_root: String,
    pub merkle_proof_json: String,
    pub logged_at: DateTime<Utc>,
}
