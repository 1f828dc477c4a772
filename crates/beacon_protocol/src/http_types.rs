//! Request/response envelopes for the runner HTTP API.

use crate::error::ApiError;
use crate::types::{ExecutionStatus, JobStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `POST /jobs` and `POST /jobs/cross-region` accepted response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub id: String,
}

/// One row of `GET /jobs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<JobSummary>,
}

/// `GET /jobs/:id`, optionally with `?include=executions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetail {
    pub id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub spec: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executions: Option<Vec<ExecutionView>>,
}

/// API view of one execution row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionView {
    pub id: i64,
    pub job_id: String,
    pub provider_id: String,
    pub region: String,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_id: Option<String>,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_claimed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_observed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListExecutionsResponse {
    pub executions: Vec<ExecutionView>,
    pub page: u32,
    pub per_page: u32,
}

/// `GET /executions/:id/cross-region` — a job's executions grouped by region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossRegionResults {
    pub job_id: String,
    pub regions: Vec<RegionOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionOutcome {
    pub region: String,
    pub completed: usize,
    pub failed: usize,
    pub executions: Vec<ExecutionView>,
}

/// `GET /executions/:id/diff-analysis` — cross-region output divergence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffAnalysis {
    pub job_id: String,
    pub regions_compared: Vec<String>,
    /// Equality classes over output hashes: regions in the same class
    /// produced byte-identical output.
    pub classes: Vec<DiffClass>,
    /// Fraction of compared regions inside the largest equality class.
    pub agreement_ratio: f64,
    pub divergent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffClass {
    pub output_hash: String,
    pub regions: Vec<String>,
}

/// `GET /transparency/root`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransparencyRootResponse {
    pub root: String,
    pub size: u64,
}

/// Sibling direction inside an inclusion proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofDirection {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: String,
    pub direction: ProofDirection,
}

/// `GET /transparency/proof`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofResponse {
    pub log_index: u64,
    pub leaf_hash: String,
    pub proof: Vec<ProofStep>,
    pub root: String,
}

/// Aggregated readiness state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Ready,
    Degraded,
    Down,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeReport {
    pub name: String,
    pub state: HealthState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub probes: Vec<ProbeReport>,
}

/// Error body wrapper: `{"error": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ApiError,
}
