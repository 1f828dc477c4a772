//! Full pipeline: admission -> outbox -> queue -> worker -> transparency.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use beacon_db::{
    create_pool, schema, DbConfig, ExecutionRepo, JobRepo, KvStore, OutboxRepo, TransparencyRepo,
};
use beacon_protocol::{ExecutionStatus, JobStatus};
use beacon_runner::admin::Flags;
use beacon_runner::admission::{AdmissionConfig, AdmissionPipeline};
use beacon_runner::breaker::{BreakerConfig, BreakerRegistry};
use beacon_runner::executor::{spawn_workers, CrossRegionExecutor, ExecutorConfig};
use beacon_runner::outbox::{OutboxPublisher, OutboxPublisherConfig};
use beacon_runner::provider::{PlanRequest, ProviderClient, ProviderResult};
use beacon_runner::queue::work_queue;
use beacon_security::{sign_payload, FailureRateLimiter, TrustedKeys};
use beacon_transparency::{
    spawn_writer, transparency_channel, NoopEmitter, TransparencyLog,
};
use chrono::Utc;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

struct EchoProvider;

#[async_trait]
impl ProviderClient for EchoProvider {
    fn id(&self) -> &str {
        "echo"
    }

    async fn execute(&self, request: &PlanRequest, _budget: Duration) -> ProviderResult {
        ProviderResult::Success {
            output: json!({"region": request.region, "model": request.model_id}),
            receipt: json!({"provider": "echo", "job": request.job_id}),
        }
    }
}

#[tokio::test]
async fn signed_submission_flows_to_a_completed_job() {
    let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
    schema::migrate(&pool).await.unwrap();

    let flags = Arc::new(Flags::new(false, false, false));
    let admission = AdmissionPipeline::new(
        JobRepo::new(pool.clone()),
        KvStore::new(pool.clone()),
        TrustedKeys::default(),
        FailureRateLimiter::new(10, 10, Duration::from_secs(60)),
        Arc::clone(&flags),
        Arc::new(NoopEmitter),
        AdmissionConfig::default(),
    );

    // Admit a signed two-region spec.
    let key = SigningKey::generate(&mut OsRng);
    let mut spec = json!({
        "version": "v1",
        "benchmark": {
            "name": "latency",
            "container": {"image": "beacon/bench"},
            "input": {"type": "inline", "hash": "abc"}
        },
        "constraints": {"regions": ["US", "EU"], "timeout": 60, "min_success_rate": 1.0},
        "metadata": {"models": ["m1"], "timestamp": Utc::now().to_rfc3339(), "nonce": "n-1"}
    });
    let signature = sign_payload(&spec, &key).unwrap();
    spec["signature"] = json!(signature);
    spec["public_key"] = json!(BASE64.encode(key.verifying_key().to_bytes()));
    let job_id = admission
        .admit(&serde_json::to_vec(&spec).unwrap(), "1.2.3.4")
        .await
        .unwrap();

    // Background machinery: publisher, worker, transparency writer.
    let log = Arc::new(
        TransparencyLog::load(TransparencyRepo::new(pool.clone()), Arc::new(NoopEmitter))
            .await
            .unwrap(),
    );
    let (sink, log_rx) = transparency_channel(64);
    spawn_writer(Arc::clone(&log), log_rx);

    let (queue, receiver) = work_queue(16);
    let executor = Arc::new(CrossRegionExecutor::new(
        JobRepo::new(pool.clone()),
        ExecutionRepo::new(pool.clone()),
        Arc::new(EchoProvider),
        None,
        Arc::new(BreakerRegistry::new(BreakerConfig::default())),
        sink,
        Arc::new(NoopEmitter),
        flags,
        beacon_runner::trace::SpanRecorder::disabled(),
        ExecutorConfig::default(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = spawn_workers(1, executor, receiver, shutdown_rx.clone());

    let publisher = OutboxPublisher::new(
        OutboxRepo::new(pool.clone()),
        queue,
        OutboxPublisherConfig {
            tick: Duration::from_millis(20),
            ..OutboxPublisherConfig::default()
        },
    );
    tokio::spawn(publisher.run(shutdown_rx));

    // The job reaches completed without any manual driving.
    let jobs = JobRepo::new(pool.clone());
    let mut status = None;
    for _ in 0..200 {
        status = jobs.get(&job_id).await.unwrap().unwrap().status();
        if status == Some(JobStatus::Completed) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(status, Some(JobStatus::Completed));

    // Outbox row was published exactly once and both plans ran.
    assert!(OutboxRepo::new(pool.clone())
        .fetch_unpublished(10)
        .await
        .unwrap()
        .is_empty());

    let rows = ExecutionRepo::new(pool.clone()).list_for_job(&job_id).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows
        .iter()
        .all(|r| r.status() == Some(ExecutionStatus::Completed)));

    // Both receipts landed in the transparency log with a verified chain.
    let repo = TransparencyRepo::new(pool.clone());
    for _ in 0..200 {
        if repo.count().await.unwrap() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let entries = repo.list_all().await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].prev_hash, "");
    assert_eq!(entries[1].prev_hash, entries[0].merkle_tree_root);

    let _ = shutdown_tx.send(true);
    futures::future::join_all(workers).await;
}
