//! Runner metrics.
//!
//! Plain atomics, single writer per counter, exported in Prometheus
//! exposition format from the `/metrics` handler. No metrics framework.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Global metrics instance.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    // Admission
    pub jobs_admitted: AtomicU64,
    pub jobs_rejected_validation: AtomicU64,
    pub jobs_rejected_signature: AtomicU64,
    pub jobs_rejected_replay: AtomicU64,
    pub jobs_rejected_rate_limited: AtomicU64,

    // Outbox
    pub outbox_unpublished: AtomicI64,
    pub outbox_oldest_age_secs: AtomicI64,
    pub outbox_published: AtomicU64,
    pub outbox_dead_letter: AtomicU64,

    // Executor
    pub executions_completed: AtomicU64,
    pub executions_failed: AtomicU64,
    pub executions_timeout: AtomicU64,
    pub provider_retries: AtomicU64,
    pub jobs_completed: AtomicU64,
    pub jobs_failed: AtomicU64,

    // Region probe
    pub probe_attempts: AtomicU64,
    pub probe_verified: AtomicU64,

    // Transparency
    pub transparency_appended: AtomicU64,
    pub transparency_dropped: AtomicU64,

    // WebSocket hub
    pub ws_clients: AtomicI64,
    pub ws_dropped: AtomicU64,

    // HTTP
    pub http_requests: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            jobs_admitted: AtomicU64::new(0),
            jobs_rejected_validation: AtomicU64::new(0),
            jobs_rejected_signature: AtomicU64::new(0),
            jobs_rejected_replay: AtomicU64::new(0),
            jobs_rejected_rate_limited: AtomicU64::new(0),
            outbox_unpublished: AtomicI64::new(0),
            outbox_oldest_age_secs: AtomicI64::new(0),
            outbox_published: AtomicU64::new(0),
            outbox_dead_letter: AtomicU64::new(0),
            executions_completed: AtomicU64::new(0),
            executions_failed: AtomicU64::new(0),
            executions_timeout: AtomicU64::new(0),
            provider_retries: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            probe_attempts: AtomicU64::new(0),
            probe_verified: AtomicU64::new(0),
            transparency_appended: AtomicU64::new(0),
            transparency_dropped: AtomicU64::new(0),
            ws_clients: AtomicI64::new(0),
            ws_dropped: AtomicU64::new(0),
            http_requests: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_gauge(gauge: &AtomicI64, value: i64) {
        gauge.store(value, Ordering::Relaxed);
    }

    /// Format as Prometheus exposition. `extra` carries dynamic series the
    /// static block cannot hold (per-key breaker states).
    pub fn prometheus_format(&self, extra: &str) -> String {
        let mut out = String::with_capacity(4096);

        let counters: &[(&str, &str, u64)] = &[
            (
                "beacon_jobs_admitted_total",
                "Jobs accepted by admission control",
                self.jobs_admitted.load(Ordering::Relaxed),
            ),
            (
                "beacon_jobs_rejected_validation_total",
                "Submissions rejected for structural validation",
                self.jobs_rejected_validation.load(Ordering::Relaxed),
            ),
            (
                "beacon_jobs_rejected_signature_total",
                "Submissions rejected for signature failures",
                self.jobs_rejected_signature.load(Ordering::Relaxed),
            ),
            (
                "beacon_jobs_rejected_replay_total",
                "Submissions rejected as replays",
                self.jobs_rejected_replay.load(Ordering::Relaxed),
            ),
            (
                "beacon_jobs_rejected_rate_limited_total",
                "Submissions rejected by the failure rate limiter",
                self.jobs_rejected_rate_limited.load(Ordering::Relaxed),
            ),
            (
                "beacon_outbox_published_total",
                "Outbox rows published to the work queue",
                self.outbox_published.load(Ordering::Relaxed),
            ),
            (
                "beacon_outbox_dead_letter_total",
                "Outbox rows moved to the dead-letter topic",
                self.outbox_dead_letter.load(Ordering::Relaxed),
            ),
            (
                "beacon_executions_completed_total",
                "Executions that reached completed",
                self.executions_completed.load(Ordering::Relaxed),
            ),
            (
                "beacon_executions_failed_total",
                "Executions that reached failed",
                self.executions_failed.load(Ordering::Relaxed),
            ),
            (
                "beacon_executions_timeout_total",
                "Executions that reached timeout",
                self.executions_timeout.load(Ordering::Relaxed),
            ),
            (
                "beacon_provider_retries_total",
                "Transient provider errors retried",
                self.provider_retries.load(Ordering::Relaxed),
            ),
            (
                "beacon_jobs_completed_total",
                "Jobs reconciled as completed",
                self.jobs_completed.load(Ordering::Relaxed),
            ),
            (
                "beacon_jobs_failed_total",
                "Jobs reconciled as failed",
                self.jobs_failed.load(Ordering::Relaxed),
            ),
            (
                "beacon_probe_attempts_total",
                "Preflight region probes attempted",
                self.probe_attempts.load(Ordering::Relaxed),
            ),
            (
                "beacon_probe_verified_total",
                "Preflight region probes that verified the claimed region",
                self.probe_verified.load(Ordering::Relaxed),
            ),
            (
                "beacon_transparency_appended_total",
                "Entries appended to the transparency log",
                self.transparency_appended.load(Ordering::Relaxed),
            ),
            (
                "beacon_transparency_dropped_total",
                "Entries dropped by the full transparency queue",
                self.transparency_dropped.load(Ordering::Relaxed),
            ),
            (
                "beacon_ws_dropped_total",
                "WebSocket clients dropped for slow consumption",
                self.ws_dropped.load(Ordering::Relaxed),
            ),
            (
                "beacon_http_requests_total",
                "HTTP requests handled",
                self.http_requests.load(Ordering::Relaxed),
            ),
        ];
        for (name, help, value) in counters {
            push_series(&mut out, name, help, "counter", *value as i64);
        }

        let gauges: &[(&str, &str, i64)] = &[
            (
                "beacon_outbox_unpublished",
                "Unpublished outbox rows",
                self.outbox_unpublished.load(Ordering::Relaxed),
            ),
            (
                "beacon_outbox_oldest_age_seconds",
                "Age of the oldest unpublished outbox row",
                self.outbox_oldest_age_secs.load(Ordering::Relaxed),
            ),
            (
                "beacon_ws_clients",
                "Connected WebSocket clients",
                self.ws_clients.load(Ordering::Relaxed),
            ),
        ];
        for (name, help, value) in gauges {
            push_series(&mut out, name, help, "gauge", *value);
        }

        out.push_str(extra);
        out
    }
}

fn push_series(out: &mut String, name: &str, help: &str, kind: &str, value: i64) {
    out.push_str(&format!(
        "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n\n"
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_includes_counters_and_gauges() {
        let metrics = Metrics::new();
        Metrics::inc(&metrics.jobs_admitted);
        Metrics::inc(&metrics.jobs_admitted);
        Metrics::set_gauge(&metrics.outbox_unpublished, 7);

        let out = metrics.prometheus_format("");
        assert!(out.contains("beacon_jobs_admitted_total 2"));
        assert!(out.contains("# TYPE beacon_outbox_unpublished gauge"));
        assert!(out.contains("beacon_outbox_unpublished 7"));
    }

    #[test]
    fn extra_series_are_appended() {
        let metrics = Metrics::new();
        let out = metrics.prometheus_format("beacon_breaker_state{key=\"p:US\"} 0\n");
        assert!(out.ends_with("beacon_breaker_state{key=\"p:US\"} 0\n"));
    }
}
