//! Sliding-window rate limiting for signature failures.
//!
//! Counters are kept per IP and per key id. Once a bucket exceeds its
//! threshold, further submissions from that bucket fail fast without a
//! verification attempt. Time is passed in explicitly so tests can drive
//! the window deterministically.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Count of events per key inside a rolling window.
pub struct SlidingWindow {
    limit: u32,
    window: Duration,
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindow {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, key: &str) {
        self.record_at(key, Instant::now());
    }

    pub fn blocked(&self, key: &str) -> bool {
        self.blocked_at(key, Instant::now())
    }

    pub fn record_at(&self, key: &str, now: Instant) {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(key.to_string()).or_default();
        Self::prune(bucket, now, self.window);
        bucket.push_back(now);
    }

    pub fn blocked_at(&self, key: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let Some(bucket) = buckets.get_mut(key) else {
            return false;
        };
        Self::prune(bucket, now, self.window);
        bucket.len() >= self.limit as usize
    }

    fn prune(bucket: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(front) = bucket.front() {
            if now.duration_since(*front) >= window {
                bucket.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Paired per-IP and per-kid windows guarding the admission path.
pub struct FailureRateLimiter {
    per_ip: SlidingWindow,
    per_kid: SlidingWindow,
}

impl FailureRateLimiter {
    pub fn new(ip_limit: u32, kid_limit: u32, window: Duration) -> Self {
        Self {
            per_ip: SlidingWindow::new(ip_limit, window),
            per_kid: SlidingWindow::new(kid_limit, window),
        }
    }

    /// True when either bucket is over its threshold.
    pub fn blocked(&self, ip: &str, kid: &str) -> bool {
        self.blocked_at(ip, kid, Instant::now())
    }

    /// Record one signature failure against both buckets.
    pub fn record_failure(&self, ip: &str, kid: &str) {
        self.record_failure_at(ip, kid, Instant::now());
    }

    pub fn blocked_at(&self, ip: &str, kid: &str, now: Instant) -> bool {
        self.per_ip.blocked_at(ip, now) || self.per_kid.blocked_at(kid, now)
    }

    pub fn record_failure_at(&self, ip: &str, kid: &str, now: Instant) {
        self.per_ip.record_at(ip, now);
        self.per_kid.record_at(kid, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_blocks_at_limit() {
        let window = SlidingWindow::new(3, Duration::from_secs(60));
        let t0 = Instant::now();

        for i in 0..3 {
            assert!(!window.blocked_at("ip-1", t0));
            window.record_at("ip-1", t0 + Duration::from_secs(i));
        }
        assert!(window.blocked_at("ip-1", t0 + Duration::from_secs(3)));
        assert!(!window.blocked_at("ip-2", t0 + Duration::from_secs(3)));
    }

    #[test]
    fn old_events_slide_out() {
        let window = SlidingWindow::new(2, Duration::from_secs(10));
        let t0 = Instant::now();

        window.record_at("k", t0);
        window.record_at("k", t0 + Duration::from_secs(1));
        assert!(window.blocked_at("k", t0 + Duration::from_secs(5)));

        // First event falls outside the window.
        assert!(!window.blocked_at("k", t0 + Duration::from_secs(10)));
    }

    #[test]
    fn limiter_trips_on_either_bucket() {
        let limiter = FailureRateLimiter::new(10, 2, Duration::from_secs(60));
        let t0 = Instant::now();

        limiter.record_failure_at("1.2.3.4", "kid-a", t0);
        limiter.record_failure_at("5.6.7.8", "kid-a", t0);

        // kid bucket is full even though neither IP bucket is.
        assert!(limiter.blocked_at("9.9.9.9", "kid-a", t0 + Duration::from_secs(1)));
        assert!(!limiter.blocked_at("9.9.9.9", "kid-b", t0 + Duration::from_secs(1)));
    }
}
