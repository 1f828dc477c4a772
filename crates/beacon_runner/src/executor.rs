//! Cross-region executor: the worker entry point.
//!
//! Each dequeued envelope loads its job spec, expands the region x model
//! x question cross product into plans, and walks the regions in declared
//! order. Within a region, plans run with a configurable fan-out. Every
//! plan is one idempotent execution row; receipts hand off to the
//! transparency log without blocking; the job reconciles to a terminal
//! status in one final compare-and-set.

use crate::admin::Flags;
use crate::breaker::BreakerRegistry;
use crate::metrics::{Metrics, METRICS};
use crate::probe::RegionProbe;
use crate::provider::{FailureClass, PlanRequest, ProviderClient, ProviderResult};
use crate::queue::WorkReceiver;
use crate::trace::{SpanRecorder, TraceContext};
use chrono::Utc;
use beacon_db::{DbError, ExecutionRepo, JobRepo};
use beacon_protocol::{
    canonical_json, ExecutionStatus, JobSpec, JobStatus, Plan, QueueEnvelope,
};
use beacon_transparency::{Emitter, PendingEntry, TransparencySink};
use rand::Rng;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Budget charged per plan when bounding the job deadline.
    pub per_region_budget: Duration,
    /// Concurrent plan calls within one region.
    pub region_fan_out: usize,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// Jitter fraction applied to each retry delay.
    pub retry_jitter: f64,
    /// Optional fallback region per primary region, used when the primary
    /// breaker is open.
    pub fallback_regions: HashMap<String, String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        use beacon_protocol::defaults;
        Self {
            per_region_budget: Duration::from_secs(defaults::PER_REGION_BUDGET_SECS),
            region_fan_out: defaults::REGION_FAN_OUT,
            retry_base: Duration::from_millis(defaults::RETRY_BASE_MS),
            retry_max: Duration::from_millis(defaults::RETRY_MAX_MS),
            retry_jitter: defaults::RETRY_JITTER,
            fallback_regions: HashMap::new(),
        }
    }
}

/// Job-level result of one `execute` call.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: String,
    pub status: JobStatus,
    pub completed: usize,
    pub total: usize,
    pub reason: Option<String>,
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("job {0} has an unreadable spec: {1}")]
    SpecDecode(String, String),
}

pub struct CrossRegionExecutor {
    jobs: JobRepo,
    executions: ExecutionRepo,
    provider: Arc<dyn ProviderClient>,
    probe: Option<Arc<dyn RegionProbe>>,
    breakers: Arc<BreakerRegistry>,
    sink: TransparencySink,
    emitter: Arc<dyn Emitter>,
    flags: Arc<Flags>,
    spans: SpanRecorder,
    config: ExecutorConfig,
}

impl CrossRegionExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: JobRepo,
        executions: ExecutionRepo,
        provider: Arc<dyn ProviderClient>,
        probe: Option<Arc<dyn RegionProbe>>,
        breakers: Arc<BreakerRegistry>,
        sink: TransparencySink,
        emitter: Arc<dyn Emitter>,
        flags: Arc<Flags>,
        spans: SpanRecorder,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            jobs,
            executions,
            provider,
            probe,
            breakers,
            sink,
            emitter,
            flags,
            spans,
            config,
        }
    }

    /// Execute one dequeued job to a terminal status.
    pub async fn execute(
        &self,
        envelope: QueueEnvelope,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JobOutcome, ExecError> {
        let job_id = envelope.id.clone();
        let row = self
            .jobs
            .get(&job_id)
            .await?
            .ok_or_else(|| ExecError::JobNotFound(job_id.clone()))?;

        // At-least-once delivery: a terminal job is a finished redelivery.
        if let Some(status) = row.status() {
            if status.is_terminal() {
                debug!(%job_id, %status, "Skipping redelivered terminal job");
                return self.outcome_from_rows(&job_id, status, None).await;
            }
        }

        let spec: JobSpec = serde_json::from_str(&row.jobspec_data)
            .map_err(|e| ExecError::SpecDecode(job_id.clone(), e.to_string()))?;

        match self
            .jobs
            .transition(&job_id, JobStatus::Queued, JobStatus::Processing)
            .await
        {
            Ok(()) => {
                self.emitter.emit(
                    "job.status_changed",
                    json!({"id": job_id, "status": JobStatus::Processing}),
                );
            }
            // Already processing: a prior worker died mid-job. Attach.
            Err(DbError::Conflict(_)) => {
                debug!(%job_id, "Attaching to job already in processing");
            }
            Err(e) => return Err(e.into()),
        }

        // Normalization runs only now, after the signature was verified
        // at admission.
        let models = spec
            .resolve_models()
            .map_err(|e| ExecError::SpecDecode(job_id.clone(), e.to_string()))?;
        let questions = spec.resolve_questions();
        let plans = spec.expand_plans(&models, &questions);
        let total = plans.len();

        // Deadline: the spec timeout, bounded so a hung provider cannot
        // hold the job past plans x per-region budget.
        let spec_timeout = Duration::from_secs(spec.constraints.timeout_secs);
        let budget_cap = self
            .config
            .per_region_budget
            .saturating_mul(total.max(1) as u32);
        let deadline = Instant::now() + spec_timeout.min(budget_cap);

        info!(%job_id, plans = total, "Executing job");
        let trace = TraceContext::with_trace_id(job_id.as_str());
        let span_start = Utc::now();

        for (region, region_plans) in group_by_region(&plans) {
            if Instant::now() >= deadline || *shutdown.borrow() {
                break;
            }
            debug!(%job_id, %region, plans = region_plans.len(), "Dispatching region");

            let fan_out = self.config.region_fan_out.max(1);
            if fan_out == 1 {
                for plan in region_plans {
                    if Instant::now() >= deadline || *shutdown.borrow() {
                        break;
                    }
                    self.run_plan(&job_id, &spec, plan, deadline, &shutdown).await;
                }
            } else {
                use futures::stream::{self, StreamExt};
                stream::iter(region_plans)
                    .for_each_concurrent(fan_out, |plan| {
                        self.run_plan(&job_id, &spec, plan, deadline, &shutdown)
                    })
                    .await;
            }
        }

        let timed_out = Instant::now() >= deadline;
        let unfinished = self.mark_unfinished_timeout(&job_id, &plans).await?;
        let outcome = self
            .reconcile(&job_id, &spec, total, timed_out, unfinished)
            .await?;

        self.spans.record(
            &trace,
            "job.execute",
            span_start,
            Some(json!({
                "job_id": job_id,
                "plans": total,
                "status": outcome.status,
            })),
        );
        Ok(outcome)
    }

    /// One plan: idempotent insert, probe, provider call with retries,
    /// terminal persistence, transparency hand-off. Never returns an
    /// error: a plan failure is data, not a job failure.
    async fn run_plan(
        &self,
        job_id: &str,
        spec: &JobSpec,
        plan: &Plan,
        deadline: Instant,
        shutdown: &watch::Receiver<bool>,
    ) {
        let row = match self.executions.insert_created(job_id, self.provider.id(), plan).await {
            Ok(row) => row,
            Err(DbError::Duplicate(_)) => {
                match self.executions.find_by_plan(job_id, plan).await {
                    Ok(Some(existing)) => {
                        if existing.status().map(|s| s.is_terminal()).unwrap_or(false) {
                            debug!(job_id, region = %plan.region, "Plan already recorded, skipping");
                            return;
                        }
                        existing
                    }
                    Ok(None) => return,
                    Err(e) => {
                        error!(job_id, error = %e, "Execution lookup failed");
                        return;
                    }
                }
            }
            Err(e) => {
                error!(job_id, error = %e, "Execution insert failed");
                return;
            }
        };

        if row.status() == Some(ExecutionStatus::Created) {
            if let Err(e) = self.executions.mark_running(row.id).await {
                // Lost a race with another worker attached to this plan.
                debug!(execution = row.id, error = %e, "Skipping run transition");
            }
        }

        self.preflight_probe(row.id, &plan.region).await;

        let result = self.call_provider(job_id, spec, plan, deadline, shutdown).await;
        self.persist_result(row.id, job_id, plan, result).await;
    }

    /// Best-effort region verification. Errors skip persistence of the
    /// verification fields; telemetry counters always move.
    async fn preflight_probe(&self, execution_id: i64, region: &str) {
        let Some(probe) = &self.probe else { return };
        if !self.flags.probe_enabled.load(std::sync::atomic::Ordering::Relaxed) {
            return;
        }

        Metrics::inc(&METRICS.probe_attempts);
        match probe.observe(region).await {
            Ok(obs) => {
                if obs.verified {
                    Metrics::inc(&METRICS.probe_verified);
                }
                if let Err(e) = self
                    .executions
                    .record_region_verification(
                        execution_id,
                        region,
                        &obs.region_observed,
                        obs.verified,
                        &obs.method,
                        obs.evidence_ref.as_deref(),
                    )
                    .await
                {
                    debug!(execution = execution_id, error = %e, "Verification persist failed");
                }
            }
            Err(e) => {
                debug!(execution = execution_id, error = %e, "Region probe failed");
            }
        }
    }

    /// Provider call with breaker gating, fallback routing, and capped
    /// exponential retry of transient failures inside the plan budget.
    async fn call_provider(
        &self,
        job_id: &str,
        spec: &JobSpec,
        plan: &Plan,
        deadline: Instant,
        shutdown: &watch::Receiver<bool>,
    ) -> PlanResult {
        let mut region = plan.region.clone();
        let mut breaker = self
            .breakers
            .get_or_create(&breaker_key(self.provider.id(), &region));

        if !breaker.allow() {
            let fallback_enabled = self
                .flags
                .fallback_enabled
                .load(std::sync::atomic::Ordering::Relaxed);
            let rerouted = fallback_enabled
                .then(|| self.config.fallback_regions.get(&plan.region))
                .flatten();
            match rerouted {
                Some(fallback) => {
                    let fb_breaker = self
                        .breakers
                        .get_or_create(&breaker_key(self.provider.id(), fallback));
                    if fb_breaker.allow() {
                        warn!(job_id, from = %plan.region, to = %fallback, "Routing plan to fallback region");
                        region = fallback.clone();
                        breaker = fb_breaker;
                    } else {
                        return PlanResult::BreakerOpen;
                    }
                }
                None => return PlanResult::BreakerOpen,
            }
        }

        let request = PlanRequest {
            job_id: job_id.to_string(),
            region,
            model_id: plan.model_id.clone(),
            question_id: plan.question_id.clone(),
            benchmark: spec.benchmark.clone(),
        };

        let mut attempt: u32 = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return PlanResult::TimedOut;
            }

            let mut cancel = shutdown.clone();
            let cancelled = async move {
                loop {
                    if cancel.changed().await.is_err() {
                        // Sender gone: cancellation can never arrive.
                        std::future::pending::<()>().await;
                    }
                    if *cancel.borrow() {
                        return;
                    }
                }
            };
            let result = tokio::select! {
                result = self.provider.execute(&request, remaining) => result,
                // Best-effort cancellation of the in-flight call.
                _ = cancelled => return PlanResult::Cancelled,
            };

            match result {
                ProviderResult::Success { output, receipt } => {
                    breaker.on_success();
                    return PlanResult::Success { output, receipt };
                }
                ProviderResult::TimedOut => {
                    breaker.on_failure();
                    return PlanResult::TimedOut;
                }
                ProviderResult::Failed { class, message } => {
                    breaker.on_failure();
                    if class == FailureClass::Permanent {
                        return PlanResult::Failed { message };
                    }

                    attempt += 1;
                    Metrics::inc(&METRICS.provider_retries);
                    let delay = self.retry_delay(attempt);
                    if Instant::now() + delay >= deadline {
                        return PlanResult::Failed { message };
                    }
                    debug!(%job_id, attempt, delay_ms = delay.as_millis() as u64, "Retrying transient provider error");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .retry_base
            .saturating_mul(1u32 << (attempt - 1).min(16));
        let capped = exp.min(self.config.retry_max);
        let jitter = 1.0 + (rand::thread_rng().gen::<f64>() * 2.0 - 1.0) * self.config.retry_jitter;
        capped.mul_f64(jitter.max(0.0))
    }

    async fn persist_result(&self, execution_id: i64, job_id: &str, plan: &Plan, result: PlanResult) {
        let (status, output, receipt) = match result {
            PlanResult::Success { output, receipt } => {
                Metrics::inc(&METRICS.executions_completed);
                (ExecutionStatus::Completed, Some(output), Some(receipt))
            }
            PlanResult::Failed { message } => {
                Metrics::inc(&METRICS.executions_failed);
                let detail = json!({"error": {"type": "external_service", "message": message}});
                (ExecutionStatus::Failed, Some(detail), None)
            }
            PlanResult::BreakerOpen => {
                Metrics::inc(&METRICS.executions_failed);
                let detail = json!({"error": {"type": "circuit_breaker", "message": "breaker open"}});
                (ExecutionStatus::Failed, Some(detail), None)
            }
            PlanResult::TimedOut | PlanResult::Cancelled => {
                Metrics::inc(&METRICS.executions_timeout);
                (ExecutionStatus::Timeout, None, None)
            }
        };

        let output_json = output.as_ref().map(|v| v.to_string());
        let receipt_json = receipt.as_ref().map(|v| v.to_string());
        if let Err(e) = self
            .executions
            .finish(
                execution_id,
                status,
                output_json.as_deref(),
                receipt_json.as_deref(),
            )
            .await
        {
            // Another worker may have finished the attached row first.
            debug!(execution = execution_id, error = %e, "Terminal persist skipped");
            return;
        }

        // Timed-out plans never reached the provider, so there is no
        // receipt to log.
        if matches!(status, ExecutionStatus::Completed | ExecutionStatus::Failed) {
            let entry = PendingEntry {
                execution_id,
                job_id: job_id.to_string(),
                region: plan.region.clone(),
                provider_id: self.provider.id().to_string(),
                status: status.as_str().to_string(),
                output_hash: output.as_ref().map(hash_value).unwrap_or_default(),
                receipt_hash: receipt.as_ref().map(hash_value).unwrap_or_default(),
                ipfs_cid: receipt
                    .as_ref()
                    .and_then(|r| r.get("ipfs_cid"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                timestamp: None,
            };
            if !self.sink.try_enqueue(entry) {
                Metrics::inc(&METRICS.transparency_dropped);
            }
        }
    }

    /// Any plan without a terminal row is marked `timeout`, inserting the
    /// row first for plans that never dispatched. Returns how many plans
    /// were unfinished.
    async fn mark_unfinished_timeout(&self, job_id: &str, plans: &[Plan]) -> Result<usize, DbError> {
        let mut unfinished = 0usize;
        for plan in plans {
            let existing = self.executions.find_by_plan(job_id, plan).await?;
            let row = match existing {
                Some(row) => {
                    if row.status().map(|s| s.is_terminal()).unwrap_or(false) {
                        continue;
                    }
                    row
                }
                None => match self.executions.insert_created(job_id, self.provider.id(), plan).await {
                    Ok(row) => row,
                    Err(DbError::Duplicate(_)) => continue,
                    Err(e) => return Err(e),
                },
            };
            unfinished += 1;
            if let Err(e) = self
                .executions
                .finish(row.id, ExecutionStatus::Timeout, None, None)
                .await
            {
                debug!(execution = row.id, error = %e, "Timeout persist skipped");
            } else {
                Metrics::inc(&METRICS.executions_timeout);
            }
        }
        Ok(unfinished)
    }

    /// Final reconciliation: count terminal completions against the plan
    /// total and CAS the job into its terminal status. Deadline expiry
    /// with unfinished plans forces failure; otherwise the success ratio
    /// decides, with timeout-marked plans already counting against it.
    async fn reconcile(
        &self,
        job_id: &str,
        spec: &JobSpec,
        total: usize,
        timed_out: bool,
        unfinished: usize,
    ) -> Result<JobOutcome, ExecError> {
        let rows = self.executions.list_for_job(job_id).await?;
        let completed = rows
            .iter()
            .filter(|r| r.status() == Some(ExecutionStatus::Completed))
            .count();

        let ratio = if total == 0 {
            0.0
        } else {
            completed as f64 / total as f64
        };
        let forced_failure = timed_out && unfinished > 0;
        let status = if !forced_failure && ratio >= spec.constraints.min_success_rate {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        let reason = (status == JobStatus::Failed && timed_out).then(|| "job_timeout".to_string());

        match self
            .jobs
            .transition(job_id, JobStatus::Processing, status)
            .await
        {
            Ok(()) => {
                match status {
                    JobStatus::Completed => Metrics::inc(&METRICS.jobs_completed),
                    JobStatus::Failed => Metrics::inc(&METRICS.jobs_failed),
                    _ => {}
                }
                self.emitter.emit(
                    "job.status_changed",
                    json!({
                        "id": job_id,
                        "status": status,
                        "completed": completed,
                        "total": total,
                        "reason": reason,
                    }),
                );
            }
            Err(DbError::Conflict(_)) => {
                debug!(%job_id, "Job already reconciled by another worker");
            }
            Err(e) => return Err(e.into()),
        }

        info!(%job_id, %status, completed, total, "Job reconciled");
        Ok(JobOutcome {
            job_id: job_id.to_string(),
            status,
            completed,
            total,
            reason,
        })
    }

    async fn outcome_from_rows(
        &self,
        job_id: &str,
        status: JobStatus,
        reason: Option<String>,
    ) -> Result<JobOutcome, ExecError> {
        let rows = self.executions.list_for_job(job_id).await?;
        let completed = rows
            .iter()
            .filter(|r| r.status() == Some(ExecutionStatus::Completed))
            .count();
        Ok(JobOutcome {
            job_id: job_id.to_string(),
            status,
            completed,
            total: rows.len(),
            reason,
        })
    }
}

enum PlanResult {
    Success { output: Value, receipt: Value },
    Failed { message: String },
    BreakerOpen,
    TimedOut,
    Cancelled,
}

fn breaker_key(provider_id: &str, region: &str) -> String {
    format!("{provider_id}:{region}")
}

fn hash_value(value: &Value) -> String {
    hex::encode(Sha256::digest(canonical_json(value).as_bytes()))
}

/// Plans arrive region-major; chunk them back into per-region groups
/// preserving declared order.
fn group_by_region(plans: &[Plan]) -> Vec<(String, Vec<&Plan>)> {
    let mut groups: Vec<(String, Vec<&Plan>)> = Vec::new();
    for plan in plans {
        match groups.last_mut() {
            Some((region, group)) if *region == plan.region => group.push(plan),
            _ => groups.push((plan.region.clone(), vec![plan])),
        }
    }
    groups
}

/// Spawn the worker pool: each worker drains the queue until shutdown.
pub fn spawn_workers(
    count: usize,
    executor: Arc<CrossRegionExecutor>,
    receiver: WorkReceiver,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|worker| {
            let executor = Arc::clone(&executor);
            let receiver = receiver.clone();
            let mut shutdown_rx = shutdown.clone();
            tokio::spawn(async move {
                info!(worker, "Worker started");
                loop {
                    tokio::select! {
                        changed = shutdown_rx.changed() => {
                            // A dropped sender also means the process is over.
                            if changed.is_err() || *shutdown_rx.borrow() {
                                break;
                            }
                        }
                        envelope = receiver.recv() => {
                            let Some(envelope) = envelope else { break };
                            let job_id = envelope.id.clone();
                            if let Err(e) = executor.execute(envelope, shutdown_rx.clone()).await {
                                error!(worker, %job_id, error = %e, "Job execution errored");
                            }
                        }
                    }
                }
                info!(worker, "Worker stopped");
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use beacon_db::{create_pool, schema, DbConfig, DbPool, TransparencyRepo};
    use beacon_transparency::{spawn_writer, transparency_channel, NoopEmitter, TransparencyLog};
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    enum Behavior {
        Ok,
        FailPermanent,
        FailTransientTimes(AtomicU32),
        Hang,
    }

    struct ScriptedProvider {
        behaviors: HashMap<String, Behavior>,
        calls: std::sync::Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(behaviors: Vec<(&str, Behavior)>) -> Self {
            Self {
                behaviors: behaviors
                    .into_iter()
                    .map(|(region, b)| (region.to_string(), b))
                    .collect(),
                calls: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl ProviderClient for ScriptedProvider {
        fn id(&self) -> &str {
            "provider-test"
        }

        async fn execute(&self, request: &PlanRequest, budget: Duration) -> ProviderResult {
            self.calls.lock().unwrap().push(request.region.clone());
            match self.behaviors.get(&request.region) {
                Some(Behavior::Ok) | None => ProviderResult::Success {
                    output: json!({"answer": request.region, "model": request.model_id}),
                    receipt: json!({"provider": "provider-test", "ipfs_cid": "cid-1"}),
                },
                Some(Behavior::FailPermanent) => ProviderResult::Failed {
                    class: FailureClass::Permanent,
                    message: "region rejected the container".into(),
                },
                Some(Behavior::FailTransientTimes(remaining)) => {
                    if remaining
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                        .is_ok()
                    {
                        ProviderResult::Failed {
                            class: FailureClass::Transient,
                            message: "temporarily unavailable".into(),
                        }
                    } else {
                        ProviderResult::Success {
                            output: json!({"answer": request.region}),
                            receipt: json!({"provider": "provider-test"}),
                        }
                    }
                }
                Some(Behavior::Hang) => {
                    tokio::time::sleep(budget).await;
                    ProviderResult::TimedOut
                }
            }
        }
    }

    struct Harness {
        executor: CrossRegionExecutor,
        pool: DbPool,
        provider: Arc<ScriptedProvider>,
    }

    async fn harness(provider: ScriptedProvider, config: ExecutorConfig) -> Harness {
        harness_with_breakers(
            provider,
            config,
            BreakerRegistry::new(BreakerConfig::default()),
        )
        .await
    }

    async fn harness_with_breakers(
        provider: ScriptedProvider,
        config: ExecutorConfig,
        breakers: BreakerRegistry,
    ) -> Harness {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        schema::migrate(&pool).await.unwrap();

        let log = TransparencyLog::load(
            TransparencyRepo::new(pool.clone()),
            Arc::new(NoopEmitter),
        )
        .await
        .unwrap();
        let (sink, rx) = transparency_channel(64);
        spawn_writer(Arc::new(log), rx);

        let provider = Arc::new(provider);
        let executor = CrossRegionExecutor::new(
            JobRepo::new(pool.clone()),
            ExecutionRepo::new(pool.clone()),
            Arc::clone(&provider) as Arc<dyn ProviderClient>,
            None,
            Arc::new(breakers),
            sink,
            Arc::new(NoopEmitter),
            Arc::new(crate::admin::Flags::new(false, false, false)),
            SpanRecorder::disabled(),
            config,
        );
        Harness {
            executor,
            pool,
            provider,
        }
    }

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            per_region_budget: Duration::from_secs(5),
            region_fan_out: 1,
            retry_base: Duration::from_millis(5),
            retry_max: Duration::from_millis(20),
            retry_jitter: 0.25,
            fallback_regions: HashMap::new(),
        }
    }

    async fn seed_job(
        pool: &DbPool,
        job_id: &str,
        regions: &[&str],
        models: &[&str],
        timeout_secs: u64,
        min_success_rate: f64,
    ) -> QueueEnvelope {
        let spec = json!({
            "id": job_id,
            "version": "v1",
            "benchmark": {
                "name": "latency",
                "container": {"image": "beacon/bench", "tag": "1.0"},
                "input": {"type": "inline", "data": {}, "hash": "abc"}
            },
            "constraints": {
                "regions": regions,
                "timeout": timeout_secs,
                "min_success_rate": min_success_rate
            },
            "metadata": {"models": models, "nonce": "n", "timestamp": Utc::now().to_rfc3339()}
        });
        JobRepo::new(pool.clone())
            .admit_and_enqueue(
                job_id,
                &spec.to_string(),
                "jobs.submitted",
                &json!({"id": job_id, "enqueued_at": Utc::now(), "attempts": 0}).to_string(),
            )
            .await
            .unwrap();
        QueueEnvelope {
            id: job_id.to_string(),
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }

    async fn wait_for_log_count(pool: &DbPool, expected: i64) {
        let repo = TransparencyRepo::new(pool.clone());
        for _ in 0..100 {
            if repo.count().await.unwrap() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("transparency log never reached {expected} entries");
    }

    fn idle_shutdown() -> watch::Receiver<bool> {
        // The sender is dropped; the executor treats that as "never
        // cancelled".
        watch::channel(false).1
    }

    #[tokio::test]
    async fn single_region_job_completes_with_log_entry() {
        let h = harness(ScriptedProvider::new(vec![("US", Behavior::Ok)]), fast_config()).await;
        let envelope = seed_job(&h.pool, "job-A", &["US"], &["m1"], 60, 1.0).await;

        let outcome = h.executor.execute(envelope, idle_shutdown()).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.completed, 1);
        assert_eq!(outcome.total, 1);

        let rows = ExecutionRepo::new(h.pool.clone())
            .list_for_job("job-A")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status(), Some(ExecutionStatus::Completed));
        assert_eq!(rows[0].region, "US");
        assert!(rows[0].receipt_json.is_some());

        let job = JobRepo::new(h.pool.clone()).get("job-A").await.unwrap().unwrap();
        assert_eq!(job.status(), Some(JobStatus::Completed));

        wait_for_log_count(&h.pool, 1).await;
        let entry = TransparencyRepo::new(h.pool.clone())
            .get_by_index(0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.prev_hash, "");
        assert_eq!(entry.job_id, "job-A");
    }

    #[tokio::test]
    async fn partial_failure_meets_half_success_rate() {
        let h = harness(
            ScriptedProvider::new(vec![("US", Behavior::Ok), ("EU", Behavior::FailPermanent)]),
            fast_config(),
        )
        .await;
        let envelope = seed_job(&h.pool, "job-B", &["US", "EU"], &["m1", "m2"], 120, 0.5).await;

        let outcome = h.executor.execute(envelope, idle_shutdown()).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.completed, 2);
        assert_eq!(outcome.total, 4);

        let rows = ExecutionRepo::new(h.pool.clone())
            .list_for_job("job-B")
            .await
            .unwrap();
        assert_eq!(rows.len(), 4);
        let completed = rows
            .iter()
            .filter(|r| r.status() == Some(ExecutionStatus::Completed))
            .count();
        let failed = rows
            .iter()
            .filter(|r| r.status() == Some(ExecutionStatus::Failed))
            .count();
        assert_eq!((completed, failed), (2, 2));

        // Region-major order: US entries logged before EU entries.
        wait_for_log_count(&h.pool, 4).await;
        let entries = TransparencyRepo::new(h.pool.clone()).list_all().await.unwrap();
        let regions: Vec<&str> = entries.iter().map(|e| e.region.as_str()).collect();
        assert_eq!(regions, vec!["US", "US", "EU", "EU"]);
    }

    #[tokio::test]
    async fn hung_provider_is_bounded_by_the_deadline() {
        let mut config = fast_config();
        config.per_region_budget = Duration::from_millis(100);
        let h = harness(ScriptedProvider::new(vec![("US", Behavior::Hang)]), config).await;
        // Spec timeout is large; the per-plan budget must win.
        let envelope = seed_job(&h.pool, "job-C", &["US"], &["m1"], 3_600, 1.0).await;

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            h.executor.execute(envelope, idle_shutdown()),
        )
        .await
        .expect("job was not bounded")
        .unwrap();

        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.reason.as_deref(), Some("job_timeout"));

        let rows = ExecutionRepo::new(h.pool.clone())
            .list_for_job("job-C")
            .await
            .unwrap();
        assert!(rows
            .iter()
            .all(|r| r.status() == Some(ExecutionStatus::Timeout)));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_to_success() {
        let h = harness(
            ScriptedProvider::new(vec![(
                "US",
                Behavior::FailTransientTimes(AtomicU32::new(2)),
            )]),
            fast_config(),
        )
        .await;
        let envelope = seed_job(&h.pool, "job-D", &["US"], &["m1"], 60, 1.0).await;

        let outcome = h.executor.execute(envelope, idle_shutdown()).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(h.provider.call_count(), 3);
    }

    #[tokio::test]
    async fn open_breaker_fails_the_plan_fast() {
        let breakers = BreakerRegistry::new(BreakerConfig {
            max_failures: 1,
            cooldown: Duration::from_secs(300),
            success_threshold: 1,
        });
        breakers.get_or_create("provider-test:US").on_failure();

        let h = harness_with_breakers(
            ScriptedProvider::new(vec![("US", Behavior::Ok)]),
            fast_config(),
            breakers,
        )
        .await;
        let envelope = seed_job(&h.pool, "job-E", &["US"], &["m1"], 60, 1.0).await;

        let outcome = h.executor.execute(envelope, idle_shutdown()).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Failed);
        // The provider was never called.
        assert_eq!(h.provider.call_count(), 0);

        let rows = ExecutionRepo::new(h.pool.clone())
            .list_for_job("job-E")
            .await
            .unwrap();
        assert_eq!(rows[0].status(), Some(ExecutionStatus::Failed));
        assert!(rows[0]
            .output_json
            .as_deref()
            .unwrap()
            .contains("circuit_breaker"));
    }

    #[tokio::test]
    async fn redelivery_of_a_terminal_job_is_a_noop() {
        let h = harness(ScriptedProvider::new(vec![("US", Behavior::Ok)]), fast_config()).await;
        let envelope = seed_job(&h.pool, "job-F", &["US"], &["m1"], 60, 1.0).await;

        let first = h
            .executor
            .execute(envelope.clone(), idle_shutdown())
            .await
            .unwrap();
        assert_eq!(first.status, JobStatus::Completed);
        let calls_after_first = h.provider.call_count();

        let second = h.executor.execute(envelope, idle_shutdown()).await.unwrap();
        assert_eq!(second.status, JobStatus::Completed);
        assert_eq!(h.provider.call_count(), calls_after_first);

        let rows = ExecutionRepo::new(h.pool.clone())
            .list_for_job("job-F")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_marks_remaining_plans_timeout() {
        let h = harness(ScriptedProvider::new(vec![("US", Behavior::Ok)]), fast_config()).await;
        let envelope = seed_job(&h.pool, "job-G", &["US", "EU"], &["m1"], 60, 1.0).await;

        let (tx, rx) = watch::channel(true);
        let outcome = h.executor.execute(envelope, rx).await.unwrap();
        drop(tx);

        // Nothing dispatched: every plan is timeout, ratio 0 < 1.0.
        assert_eq!(outcome.status, JobStatus::Failed);
        let rows = ExecutionRepo::new(h.pool.clone())
            .list_for_job("job-G")
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows
            .iter()
            .all(|r| r.status() == Some(ExecutionStatus::Timeout)));
    }

    #[test]
    fn group_by_region_preserves_declared_order() {
        let plans = vec![
            Plan { region: "US".into(), model_id: "m1".into(), question_id: None },
            Plan { region: "US".into(), model_id: "m2".into(), question_id: None },
            Plan { region: "EU".into(), model_id: "m1".into(), question_id: None },
        ];
        let groups = group_by_region(&plans);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "US");
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].0, "EU");
    }
}
