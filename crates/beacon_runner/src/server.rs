//! Composition root: wires repositories, background tasks, and the HTTP
//! surface, then runs until shutdown.
//!
//! Graceful shutdown stops accepting requests first, then cancels the
//! process watch channel and waits up to the drain deadline for in-flight
//! executions to checkpoint.

use crate::admin::{AdminAuth, AdminConfig, ConfigStore, Flags};
use crate::admission::{AdmissionConfig, AdmissionPipeline};
use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::config::RunnerConfig;
use crate::executor::{spawn_workers, CrossRegionExecutor, ExecutorConfig};
use crate::health::HealthChecker;
use crate::http::{build_router, AppState};
use crate::hub::Hub;
use crate::outbox::{OutboxPublisher, OutboxPublisherConfig};
use crate::probe::{RegionProbe, TrustingProbe};
use crate::provider::{HttpProviderClient, ProviderClient};
use crate::queue::work_queue;
use crate::trace::SpanRecorder;
use anyhow::{Context, Result};
use beacon_db::{
    create_pool, schema, DbConfig, ExecutionRepo, JobRepo, KvStore, OutboxRepo, TraceSpanRepo,
    TransparencyRepo,
};
use beacon_protocol::defaults;
use beacon_security::{FailureRateLimiter, TrustedKeys};
use beacon_transparency::{spawn_writer, transparency_channel, TransparencyLog};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

pub struct Server;

impl Server {
    /// Run the service until SIGINT/SIGTERM.
    pub async fn run(config: RunnerConfig) -> Result<()> {
        let pool = create_pool(DbConfig::sqlite(&config.db_path))
            .await
            .context("Failed to open database")?;
        schema::migrate(&pool).await.context("Failed to migrate schema")?;

        let hub = Arc::new(Hub::new(defaults::WS_CLIENT_QUEUE));

        let trusted_keys = match &config.trusted_keys_path {
            Some(path) => {
                let keys = TrustedKeys::load(path).context("Failed to load trusted keys")?;
                info!(keys = keys.len(), "Trusted-key allowlist loaded");
                keys
            }
            None => {
                warn!("No trusted-keys allowlist configured; any verified key is accepted");
                TrustedKeys::default()
            }
        };

        let flags = Arc::new(
            Flags::new(
                config.signature_bypass,
                config.probe_enabled,
                config.fallback_enabled,
            )
            .with_deployment_policy(),
        );

        // Transparency log first: the executor needs its sink.
        let log = Arc::new(
            TransparencyLog::load(TransparencyRepo::new(pool.clone()), hub.clone())
                .await
                .context("Failed to load transparency log")?,
        );
        let (sink, log_rx) = transparency_channel(defaults::TRANSPARENCY_QUEUE);
        let log_writer = spawn_writer(Arc::clone(&log), log_rx);

        let (queue, receiver) = work_queue(config.queue_capacity);
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default()));

        let admission = Arc::new(AdmissionPipeline::new(
            JobRepo::new(pool.clone()),
            KvStore::new(pool.clone()),
            trusted_keys,
            FailureRateLimiter::new(
                defaults::RATE_LIMIT_PER_IP,
                defaults::RATE_LIMIT_PER_KID,
                Duration::from_secs(defaults::RATE_LIMIT_WINDOW_SECS),
            ),
            Arc::clone(&flags),
            hub.clone(),
            AdmissionConfig::default(),
        ));

        let provider: Arc<dyn ProviderClient> = Arc::new(HttpProviderClient::new(
            config.provider_id.clone(),
            config.provider_url.clone(),
        ));
        let probe: Option<Arc<dyn RegionProbe>> = config
            .probe_enabled
            .then(|| Arc::new(TrustingProbe) as Arc<dyn RegionProbe>);

        let spans = if config.trace_spans {
            SpanRecorder::new(Some(Arc::new(TraceSpanRepo::new(pool.clone()))))
        } else {
            SpanRecorder::disabled()
        };

        let executor = Arc::new(CrossRegionExecutor::new(
            JobRepo::new(pool.clone()),
            ExecutionRepo::new(pool.clone()),
            provider,
            probe,
            Arc::clone(&breakers),
            sink,
            hub.clone(),
            Arc::clone(&flags),
            spans,
            ExecutorConfig::default(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = spawn_workers(
            config.workers,
            executor,
            receiver.clone(),
            shutdown_rx.clone(),
        );

        let publisher = OutboxPublisher::new(
            OutboxRepo::new(pool.clone()),
            queue.clone(),
            OutboxPublisherConfig::default(),
        );
        let publisher_handle = tokio::spawn(publisher.run(shutdown_rx.clone()));

        let health = Arc::new(HealthChecker::new(
            JobRepo::new(pool.clone()),
            OutboxRepo::new(pool.clone()),
            queue.clone(),
            Arc::clone(&breakers),
            defaults::OUTBOX_LAG_THRESHOLD,
        ));

        let state = AppState {
            admission,
            jobs: Arc::new(JobRepo::new(pool.clone())),
            executions: Arc::new(ExecutionRepo::new(pool.clone())),
            log,
            hub,
            health,
            breakers,
            config_store: Arc::new(ConfigStore::new(AdminConfig::default())),
            flags,
            auth: Arc::new(AdminAuth::new(
                config.admin_token.clone(),
                config.operator_token.clone(),
            )),
        };
        let router = build_router(state);

        let listener = tokio::net::TcpListener::bind(&config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
        info!(addr = %config.bind_addr, "Beacon runner listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("HTTP server error")?;

        // The server stopped accepting; now drain background work.
        info!("Shutting down, draining in-flight work");
        let _ = shutdown_tx.send(true);

        let drain = Duration::from_secs(defaults::DRAIN_DEADLINE_SECS);
        if tokio::time::timeout(drain, futures::future::join_all(workers))
            .await
            .is_err()
        {
            warn!("Drain deadline elapsed with executions still in flight");
        }
        let _ = tokio::time::timeout(drain, publisher_handle).await;
        log_writer.abort();

        info!("Shutdown complete");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
