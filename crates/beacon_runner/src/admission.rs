//! Admission pipeline: parse, validate, verify, replay-check, persist.
//!
//! The request body is parsed twice: once into the typed `JobSpec` and
//! once into a generic value that preserves the exact content for
//! canonicalization and auditing. Model normalization happens in the
//! executor, strictly after the signature has been checked, so it can
//! never alter the signed bytes.

use crate::admin::Flags;
use crate::metrics::{Metrics, METRICS};
use beacon_db::{DbError, JobRepo, KvStore};
use beacon_protocol::{ApiError, ErrorKind, JobSpec, JobStatus, QueueEnvelope};
use beacon_security::{
    key_id, verify_spec_signature, FailureRateLimiter, KeyTrust, TrustedKeys,
};
use beacon_transparency::Emitter;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub max_age_secs: i64,
    pub skew_secs: i64,
    pub topic: String,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_age_secs: beacon_protocol::defaults::MAX_TIMESTAMP_AGE_SECS,
            skew_secs: beacon_protocol::defaults::TIMESTAMP_SKEW_SECS,
            topic: beacon_protocol::defaults::JOBS_TOPIC.to_string(),
        }
    }
}

pub struct AdmissionPipeline {
    jobs: JobRepo,
    kv: KvStore,
    keys: TrustedKeys,
    limiter: FailureRateLimiter,
    flags: Arc<Flags>,
    emitter: Arc<dyn Emitter>,
    config: AdmissionConfig,
}

impl AdmissionPipeline {
    pub fn new(
        jobs: JobRepo,
        kv: KvStore,
        keys: TrustedKeys,
        limiter: FailureRateLimiter,
        flags: Arc<Flags>,
        emitter: Arc<dyn Emitter>,
        config: AdmissionConfig,
    ) -> Self {
        Self {
            jobs,
            kv,
            keys,
            limiter,
            flags,
            emitter,
            config,
        }
    }

    /// Run the full admission contract over a request body. On success the
    /// job row and its outbox row are committed and the assigned id is
    /// returned.
    pub async fn admit(&self, body: &[u8], remote_ip: &str) -> Result<String, ApiError> {
        let result = self.admit_inner(body, remote_ip).await;
        match &result {
            Ok(job_id) => {
                Metrics::inc(&METRICS.jobs_admitted);
                info!(%job_id, "Job admitted");
            }
            Err(e) => {
                match e.kind {
                    ErrorKind::Validation => Metrics::inc(&METRICS.jobs_rejected_validation),
                    ErrorKind::Signature => Metrics::inc(&METRICS.jobs_rejected_signature),
                    ErrorKind::Replay => Metrics::inc(&METRICS.jobs_rejected_replay),
                    ErrorKind::RateLimited => Metrics::inc(&METRICS.jobs_rejected_rate_limited),
                    _ => {}
                }
                warn!(kind = %e.kind, message = %e.message, "Job rejected");
            }
        }
        result
    }

    async fn admit_inner(&self, body: &[u8], remote_ip: &str) -> Result<String, ApiError> {
        // Parse twice: typed for validation, generic for the signed bytes.
        let spec: JobSpec = serde_json::from_slice(body)
            .map_err(|e| ApiError::validation(format!("malformed job spec: {e}")))?;
        let raw: Value = serde_json::from_slice(body)
            .map_err(|e| ApiError::validation(format!("malformed JSON: {e}")))?;

        self.validate_structure(&spec)?;

        let Some(public_key) = spec.public_key.clone() else {
            return Err(ApiError::signature("public_key is required"));
        };
        let Some(signature) = spec.signature.clone() else {
            return Err(ApiError::signature("signature is required"));
        };

        // Rate-limit gate: a blocked bucket fails fast, no verification.
        let kid = match self.keys.check(&public_key, Utc::now()) {
            KeyTrust::Trusted { kid } => kid,
            _ => key_id(&public_key),
        };
        if self.limiter.blocked(remote_ip, &kid) {
            return Err(ApiError::rate_limited(
                "too many signature failures, try again later",
            ));
        }

        if let Err(e) = verify_spec_signature(&raw, &signature, &public_key) {
            self.limiter.record_failure(remote_ip, &kid);
            return Err(ApiError::signature(e.to_string()));
        }

        // Trust gate. With no allowlist configured the signature alone
        // gates admission; with one, unknown keys pass only under an
        // explicitly enabled bypass, which the deployment policy can veto.
        match self.keys.check(&public_key, Utc::now()) {
            KeyTrust::Trusted { .. } => {}
            KeyTrust::Unknown if self.keys.is_empty() => {}
            KeyTrust::Unknown => {
                if self.flags.signature_bypass() {
                    warn!("admitting job from unlisted key under signature bypass");
                } else {
                    return Err(ApiError::signature("public key is not trusted"));
                }
            }
            KeyTrust::Rejected { kid, reason } => {
                return Err(ApiError::signature(format!("key {kid} rejected: {reason}")));
            }
        }

        self.check_replay(&spec, &kid).await?;

        // Assign the id and persist exactly what was admitted.
        let job_id = spec
            .id
            .clone()
            .unwrap_or_else(|| format!("job-{}", Uuid::new_v4()));
        let mut stored = raw;
        stored["id"] = Value::String(job_id.clone());
        let spec_json = serde_json::to_string(&stored)
            .map_err(|e| ApiError::internal(format!("spec serialization failed: {e}")))?;

        let envelope = QueueEnvelope {
            id: job_id.clone(),
            enqueued_at: Utc::now(),
            attempts: 0,
        };
        let payload_json = serde_json::to_string(&envelope)
            .map_err(|e| ApiError::internal(format!("envelope serialization failed: {e}")))?;

        match self
            .jobs
            .admit_and_enqueue(&job_id, &spec_json, &self.config.topic, &payload_json)
            .await
        {
            Ok(()) => {}
            Err(DbError::Duplicate(_)) => {
                return Err(ApiError::replay(format!("job {job_id} was already submitted")));
            }
            Err(e) => {
                return Err(ApiError::new(ErrorKind::Database, e.to_string()));
            }
        }

        self.emitter.emit(
            "job.status_changed",
            json!({"id": job_id, "status": JobStatus::Queued}),
        );

        Ok(job_id)
    }

    fn validate_structure(&self, spec: &JobSpec) -> Result<(), ApiError> {
        if spec.requires_questions() {
            let has_questions = spec
                .questions
                .as_ref()
                .map(|qs| !qs.is_empty())
                .unwrap_or(false);
            if !has_questions {
                return Err(ApiError::validation(
                    "bias benchmarks require a non-empty questions array",
                ));
            }
        }

        if spec.constraints.regions.is_empty() {
            return Err(ApiError::validation("constraints.regions must be non-empty"));
        }
        if spec.benchmark.container.image.is_empty() {
            return Err(ApiError::validation("benchmark.container.image is required"));
        }
        let has_hash = spec
            .benchmark
            .input
            .hash
            .as_deref()
            .map(|h| !h.is_empty())
            .unwrap_or(false);
        if !has_hash {
            return Err(ApiError::validation("benchmark.input.hash is required"));
        }
        if spec.constraints.timeout_secs == 0 {
            return Err(ApiError::validation("constraints.timeout must be positive"));
        }
        if !(0.0..=1.0).contains(&spec.constraints.min_success_rate) {
            return Err(ApiError::validation(
                "constraints.min_success_rate must be within [0, 1]",
            ));
        }
        // Model ids are checked before verification only for shape; the
        // normalized form is derived later.
        if spec.resolve_models().is_err() {
            return Err(ApiError::validation("model list is malformed or has empty ids"));
        }
        Ok(())
    }

    async fn check_replay(&self, spec: &JobSpec, kid: &str) -> Result<(), ApiError> {
        let Some(submitted_at) = spec.submitted_at() else {
            return Err(ApiError::validation(
                "metadata.timestamp is required (RFC 3339, UTC)",
            ));
        };
        let Some(nonce) = spec.nonce() else {
            return Err(ApiError::validation("metadata.nonce is required"));
        };

        let now = Utc::now();
        let age = now - submitted_at;
        if age > ChronoDuration::seconds(self.config.max_age_secs) {
            return Err(ApiError::replay("timestamp is older than the allowed age"));
        }
        if submitted_at - now > ChronoDuration::seconds(self.config.skew_secs) {
            return Err(ApiError::replay("timestamp is too far in the future"));
        }

        let key = format!("nonce:{kid}:{nonce}");
        let inserted = self
            .kv
            .set_if_absent(&key, "1", self.config.max_age_secs)
            .await
            .map_err(|e| ApiError::new(ErrorKind::Database, e.to_string()))?;
        if !inserted {
            return Err(ApiError::replay("replay detected"));
        }
        Ok(())
    }
}
