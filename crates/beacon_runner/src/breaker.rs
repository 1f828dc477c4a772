//! Circuit breakers protecting external endpoints.
//!
//! Three states: closed -> open -> half-open -> closed. N consecutive
//! failures open; the cooldown elapsing moves to half-open; M consecutive
//! half-open successes re-close; any half-open failure re-opens. Which
//! error kinds count is the caller's choice via
//! `ErrorKind::trips_breaker`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    /// Numeric gauge value for the metrics exposition.
    pub fn as_gauge(&self) -> i64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::HalfOpen => 1,
            BreakerState::Open => 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub max_failures: u32,
    pub cooldown: Duration,
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: beacon_protocol::defaults::BREAKER_MAX_FAILURES,
            cooldown: Duration::from_secs(beacon_protocol::defaults::BREAKER_COOLDOWN_SECS),
            success_threshold: beacon_protocol::defaults::BREAKER_SUCCESS_THRESHOLD,
        }
    }
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

/// One breaker guarding one external endpoint. State is its own; nothing
/// is shared across breakers.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
            }),
        }
    }

    /// Whether a call may proceed right now. Moves open -> half-open when
    /// the cooldown has elapsed.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| now.duration_since(at))
                    .unwrap_or_default();
                if elapsed >= self.config.cooldown {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            BreakerState::Closed => inner.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn on_failure(&self) {
        self.on_failure_at(Instant::now());
    }

    pub fn on_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.max_failures {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .state
    }
}

/// Keyed registry; the lock is held only for get-or-create and snapshots.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, std::sync::Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, key: &str) -> std::sync::Arc<CircuitBreaker> {
        let mut map = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(key.to_string())
            .or_insert_with(|| std::sync::Arc::new(CircuitBreaker::new(self.config)))
            .clone()
    }

    pub fn snapshot(&self) -> Vec<(String, BreakerState)> {
        let map = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let mut states: Vec<(String, BreakerState)> = map
            .iter()
            .map(|(key, breaker)| (key.clone(), breaker.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Per-key gauge series for the metrics exposition.
    pub fn prometheus_series(&self) -> String {
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return String::new();
        }
        let mut out = String::from(
            "# HELP beacon_breaker_state Circuit breaker state (0 closed, 1 half-open, 2 open)\n# TYPE beacon_breaker_state gauge\n",
        );
        for (key, state) in snapshot {
            out.push_str(&format!(
                "beacon_breaker_state{{key=\"{key}\"}} {}\n",
                state.as_gauge()
            ));
        }
        out.push('\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            max_failures: 3,
            cooldown: Duration::from_secs(30),
            success_threshold: 2,
        }
    }

    #[test]
    fn consecutive_failures_open_the_breaker() {
        let breaker = CircuitBreaker::new(config());
        let t0 = Instant::now();

        breaker.on_failure_at(t0);
        breaker.on_failure_at(t0);
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.on_failure_at(t0);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_at(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let breaker = CircuitBreaker::new(config());
        breaker.on_failure();
        breaker.on_failure();
        breaker.on_success();
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn cooldown_half_opens_then_successes_close() {
        let breaker = CircuitBreaker::new(config());
        let t0 = Instant::now();
        for _ in 0..3 {
            breaker.on_failure_at(t0);
        }

        assert!(!breaker.allow_at(t0 + Duration::from_secs(29)));
        assert!(breaker.allow_at(t0 + Duration::from_secs(30)));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.on_success();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.on_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(config());
        let t0 = Instant::now();
        for _ in 0..3 {
            breaker.on_failure_at(t0);
        }
        assert!(breaker.allow_at(t0 + Duration::from_secs(31)));

        let reopened_at = t0 + Duration::from_secs(32);
        breaker.on_failure_at(reopened_at);
        assert_eq!(breaker.state(), BreakerState::Open);
        // The cooldown restarts from the re-open.
        assert!(!breaker.allow_at(reopened_at + Duration::from_secs(29)));
        assert!(breaker.allow_at(reopened_at + Duration::from_secs(30)));
    }

    #[test]
    fn registry_returns_the_same_breaker_per_key() {
        let registry = BreakerRegistry::new(config());
        let a = registry.get_or_create("provider:US");
        let b = registry.get_or_create("provider:US");
        let c = registry.get_or_create("provider:EU");

        a.on_failure();
        a.on_failure();
        a.on_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(c.state(), BreakerState::Closed);

        let series = registry.prometheus_series();
        assert!(series.contains("beacon_breaker_state{key=\"provider:US\"} 2"));
        assert!(series.contains("beacon_breaker_state{key=\"provider:EU\"} 0"));
    }
}
