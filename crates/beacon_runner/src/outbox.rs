//! Outbox publisher: drains unpublished rows into the work queue.
//!
//! Single supervised loop. Every tick drains one FIFO batch; enqueue
//! failures back the loop off exponentially and rows that keep failing
//! move to the dead-letter topic. Queue-depth gauges refresh on idle
//! ticks, and an idle notification gives tests a deterministic boundary
//! to await instead of sleeping.

use crate::metrics::{Metrics, METRICS};
use crate::queue::WorkQueue;
use beacon_db::OutboxRepo;
use beacon_protocol::QueueEnvelope;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct OutboxPublisherConfig {
    pub tick: Duration,
    pub batch_size: i64,
    pub max_attempts: i64,
    pub dead_letter_topic: String,
}

impl Default for OutboxPublisherConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(beacon_protocol::defaults::OUTBOX_TICK_MS),
            batch_size: beacon_protocol::defaults::OUTBOX_BATCH_SIZE,
            max_attempts: beacon_protocol::defaults::OUTBOX_MAX_ATTEMPTS,
            dead_letter_topic: beacon_protocol::defaults::DEAD_LETTER_TOPIC.to_string(),
        }
    }
}

pub struct OutboxPublisher {
    repo: OutboxRepo,
    queue: WorkQueue,
    config: OutboxPublisherConfig,
    idle: Arc<Notify>,
    consecutive_failures: u32,
}

impl OutboxPublisher {
    pub fn new(repo: OutboxRepo, queue: WorkQueue, config: OutboxPublisherConfig) -> Self {
        Self {
            repo,
            queue,
            config,
            idle: Arc::new(Notify::new()),
            consecutive_failures: 0,
        }
    }

    /// Notified after every idle tick. Tests await this instead of
    /// sleeping.
    pub fn idle_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.idle)
    }

    /// Run until cancelled. Cancellation returns after the current batch.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(tick_ms = self.config.tick.as_millis() as u64, "Outbox publisher started");
        loop {
            let delay = self.current_delay();
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender also means the process is over.
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Outbox publisher stopping");
                        return;
                    }
                }
                _ = tokio::time::sleep(delay) => {
                    self.tick().await;
                }
            }
        }
    }

    fn current_delay(&self) -> Duration {
        if self.consecutive_failures == 0 {
            return self.config.tick;
        }
        // Exponential backoff on enqueue failures, capped at 16 ticks.
        let factor = 1u32 << self.consecutive_failures.min(4);
        self.config.tick * factor
    }

    /// One tick: drain a batch, or refresh gauges when idle.
    pub async fn tick(&mut self) {
        let batch = match self.repo.fetch_unpublished(self.config.batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "Outbox fetch failed");
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                return;
            }
        };

        if batch.is_empty() {
            self.refresh_gauges().await;
            self.consecutive_failures = 0;
            self.idle.notify_waiters();
            return;
        }

        let mut had_failure = false;
        for row in batch {
            let envelope: QueueEnvelope = match serde_json::from_str(&row.payload_json) {
                Ok(envelope) => envelope,
                Err(e) => {
                    // Poison payload: no retry will ever help.
                    warn!(id = row.id, error = %e, "Unparseable outbox payload");
                    let _ = self
                        .repo
                        .record_failure(row.id, &format!("unparseable payload: {e}"))
                        .await;
                    if self
                        .repo
                        .dead_letter(row.id, &self.config.dead_letter_topic)
                        .await
                        .is_ok()
                    {
                        Metrics::inc(&METRICS.outbox_dead_letter);
                    }
                    continue;
                }
            };

            match self.queue.try_enqueue(envelope) {
                Ok(()) => {
                    if let Err(e) = self.repo.mark_published(row.id).await {
                        // The envelope is already in the queue; the row
                        // will be re-published and dedup happens at the
                        // executor. At-least-once, not exactly-once.
                        error!(id = row.id, error = %e, "Failed to mark outbox row published");
                    } else {
                        Metrics::inc(&METRICS.outbox_published);
                        debug!(id = row.id, "Outbox row published");
                    }
                }
                Err(e) => {
                    had_failure = true;
                    let attempts = match self.repo.record_failure(row.id, &e.to_string()).await {
                        Ok(attempts) => attempts,
                        Err(db_err) => {
                            error!(id = row.id, error = %db_err, "Failed to record outbox failure");
                            continue;
                        }
                    };
                    if attempts >= self.config.max_attempts {
                        if self
                            .repo
                            .dead_letter(row.id, &self.config.dead_letter_topic)
                            .await
                            .is_ok()
                        {
                            Metrics::inc(&METRICS.outbox_dead_letter);
                        }
                    }
                }
            }
        }

        if had_failure {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        } else {
            self.consecutive_failures = 0;
        }
    }

    async fn refresh_gauges(&self) {
        match self.repo.stats().await {
            Ok(stats) => {
                Metrics::set_gauge(&METRICS.outbox_unpublished, stats.unpublished);
                Metrics::set_gauge(&METRICS.outbox_oldest_age_secs, stats.oldest_age_secs);
            }
            Err(e) => debug!(error = %e, "Outbox stats query failed"),
        }
    }
}
