//! Liveness and readiness probes.
//!
//! Liveness has no dependencies. Readiness aggregates the database ping,
//! the queue ping, outbox lag, and circuit-breaker states: ready iff all
//! green, degraded when any breaker is half-open or the outbox lags,
//! down when an essential is open or unreachable.

use crate::breaker::{BreakerRegistry, BreakerState};
use crate::queue::WorkQueue;
use beacon_db::{JobRepo, OutboxRepo};
use beacon_protocol::http_types::{HealthReport, HealthState, ProbeReport};
use std::sync::Arc;

pub struct HealthChecker {
    jobs: JobRepo,
    outbox: OutboxRepo,
    queue: WorkQueue,
    breakers: Arc<BreakerRegistry>,
    outbox_lag_threshold: i64,
}

impl HealthChecker {
    pub fn new(
        jobs: JobRepo,
        outbox: OutboxRepo,
        queue: WorkQueue,
        breakers: Arc<BreakerRegistry>,
        outbox_lag_threshold: i64,
    ) -> Self {
        Self {
            jobs,
            outbox,
            queue,
            breakers,
            outbox_lag_threshold,
        }
    }

    pub async fn readiness(&self) -> HealthReport {
        let mut probes = Vec::with_capacity(4);

        probes.push(match self.jobs.ping().await {
            Ok(()) => ProbeReport {
                name: "database".into(),
                state: HealthState::Ready,
                detail: None,
            },
            Err(e) => ProbeReport {
                name: "database".into(),
                state: HealthState::Down,
                detail: Some(e.to_string()),
            },
        });

        probes.push(match self.queue.ping() {
            Ok(()) => ProbeReport {
                name: "queue".into(),
                state: HealthState::Ready,
                detail: None,
            },
            Err(e) => ProbeReport {
                name: "queue".into(),
                state: HealthState::Down,
                detail: Some(e.to_string()),
            },
        });

        probes.push(match self.outbox.stats().await {
            Ok(stats) if stats.unpublished > self.outbox_lag_threshold => ProbeReport {
                name: "outbox".into(),
                state: HealthState::Degraded,
                detail: Some(format!("{} rows unpublished", stats.unpublished)),
            },
            Ok(_) => ProbeReport {
                name: "outbox".into(),
                state: HealthState::Ready,
                detail: None,
            },
            Err(e) => ProbeReport {
                name: "outbox".into(),
                state: HealthState::Down,
                detail: Some(e.to_string()),
            },
        });

        let breaker_states = self.breakers.snapshot();
        let worst = breaker_states
            .iter()
            .map(|(_, state)| *state)
            .max_by_key(|state| state.as_gauge());
        probes.push(match worst {
            Some(BreakerState::Open) => ProbeReport {
                name: "breakers".into(),
                state: HealthState::Down,
                detail: Some(describe_breakers(&breaker_states, BreakerState::Open)),
            },
            Some(BreakerState::HalfOpen) => ProbeReport {
                name: "breakers".into(),
                state: HealthState::Degraded,
                detail: Some(describe_breakers(&breaker_states, BreakerState::HalfOpen)),
            },
            _ => ProbeReport {
                name: "breakers".into(),
                state: HealthState::Ready,
                detail: None,
            },
        });

        let status = probes
            .iter()
            .map(|p| p.state)
            .max_by_key(|state| match state {
                HealthState::Ready => 0,
                HealthState::Degraded => 1,
                HealthState::Down => 2,
            })
            .unwrap_or(HealthState::Ready);

        HealthReport { status, probes }
    }
}

fn describe_breakers(states: &[(String, BreakerState)], wanted: BreakerState) -> String {
    let keys: Vec<&str> = states
        .iter()
        .filter(|(_, state)| *state == wanted)
        .map(|(key, _)| key.as_str())
        .collect();
    format!("{}: {}", wanted.as_str(), keys.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::queue::work_queue;
    use beacon_db::{create_pool, schema, DbConfig};
    use std::time::Duration;

    async fn checker(breakers: BreakerRegistry) -> (HealthChecker, crate::queue::WorkReceiver) {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        schema::migrate(&pool).await.unwrap();
        let (queue, receiver) = work_queue(8);
        (
            HealthChecker::new(
                JobRepo::new(pool.clone()),
                OutboxRepo::new(pool),
                queue,
                Arc::new(breakers),
                4,
            ),
            receiver,
        )
    }

    fn breaker_config() -> BreakerConfig {
        BreakerConfig {
            max_failures: 1,
            cooldown: Duration::from_millis(10),
            success_threshold: 1,
        }
    }

    #[tokio::test]
    async fn all_green_is_ready() {
        let (checker, _rx) = checker(BreakerRegistry::new(breaker_config())).await;
        let report = checker.readiness().await;
        assert_eq!(report.status, HealthState::Ready);
        assert_eq!(report.probes.len(), 4);
    }

    #[tokio::test]
    async fn open_breaker_is_down() {
        let registry = BreakerRegistry::new(breaker_config());
        registry.get_or_create("provider:US").on_failure();
        let (checker, _rx) = checker(registry).await;

        let report = checker.readiness().await;
        assert_eq!(report.status, HealthState::Down);
    }

    #[tokio::test]
    async fn half_open_breaker_is_degraded() {
        let registry = BreakerRegistry::new(breaker_config());
        let breaker = registry.get_or_create("provider:US");
        breaker.on_failure();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.allow()); // moves to half-open

        let (checker, _rx) = checker(registry).await;
        let report = checker.readiness().await;
        assert_eq!(report.status, HealthState::Degraded);
    }

    #[tokio::test]
    async fn outbox_lag_degrades_readiness() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        schema::migrate(&pool).await.unwrap();
        let repo = OutboxRepo::new(pool.clone());
        for i in 0..6 {
            repo.insert("jobs", &format!("{{\"id\":\"{i}\"}}")).await.unwrap();
        }

        let (queue, _rx) = work_queue(8);
        let checker = HealthChecker::new(
            JobRepo::new(pool.clone()),
            OutboxRepo::new(pool),
            queue,
            Arc::new(BreakerRegistry::new(breaker_config())),
            4,
        );
        let report = checker.readiness().await;
        assert_eq!(report.status, HealthState::Degraded);
    }

    #[tokio::test]
    async fn closed_queue_is_down() {
        let (checker, rx) = checker(BreakerRegistry::new(breaker_config())).await;
        drop(rx);
        let report = checker.readiness().await;
        assert_eq!(report.status, HealthState::Down);
    }
}
