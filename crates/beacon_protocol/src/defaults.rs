//! Tunable defaults. Deployment parameters, not contract.

/// Job timeout applied when the spec does not set one (seconds).
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 3_600;

/// Per-region execution budget used to bound hung jobs (seconds).
pub const PER_REGION_BUDGET_SECS: u64 = 15 * 60;

/// Concurrent plan calls inside one region. Raise only when the provider
/// tolerates it.
pub const REGION_FAN_OUT: usize = 1;

/// Outbox publisher tick interval (milliseconds).
pub const OUTBOX_TICK_MS: u64 = 2_000;

/// Outbox rows drained per tick.
pub const OUTBOX_BATCH_SIZE: i64 = 32;

/// Attempts before an outbox row is dead-lettered.
pub const OUTBOX_MAX_ATTEMPTS: i64 = 5;

/// Dead-letter topic suffix.
pub const DEAD_LETTER_TOPIC: &str = "jobs.dead_letter";

/// Primary outbox topic for admitted jobs.
pub const JOBS_TOPIC: &str = "jobs.submitted";

/// Signature failures allowed per IP per window.
pub const RATE_LIMIT_PER_IP: u32 = 10;

/// Signature failures allowed per key id per window.
pub const RATE_LIMIT_PER_KID: u32 = 5;

/// Sliding rate-limit window (seconds).
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Maximum age of `metadata.timestamp`, and the nonce TTL (seconds).
pub const MAX_TIMESTAMP_AGE_SECS: i64 = 600;

/// Allowed clock skew for `metadata.timestamp` (seconds).
pub const TIMESTAMP_SKEW_SECS: i64 = 120;

/// Per-request handler timeout (seconds).
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Shutdown drain deadline for in-flight executions (seconds).
pub const DRAIN_DEADLINE_SECS: u64 = 30;

/// Consecutive failures that open a circuit breaker.
pub const BREAKER_MAX_FAILURES: u32 = 5;

/// Open-state cooldown before probing half-open (seconds).
pub const BREAKER_COOLDOWN_SECS: u64 = 30;

/// Half-open successes required to close a breaker.
pub const BREAKER_SUCCESS_THRESHOLD: u32 = 2;

/// Provider retry backoff base (milliseconds).
pub const RETRY_BASE_MS: u64 = 250;

/// Provider retry backoff ceiling (milliseconds).
pub const RETRY_MAX_MS: u64 = 10_000;

/// Jitter fraction applied to provider retry backoff.
pub const RETRY_JITTER: f64 = 0.25;

/// Per-client WebSocket queue depth before the client is dropped.
pub const WS_CLIENT_QUEUE: usize = 64;

/// Transparency ingest queue depth before entries degrade to drops.
pub const TRANSPARENCY_QUEUE: usize = 1_024;

/// Outbox lag (unpublished rows) above which readiness degrades.
pub const OUTBOX_LAG_THRESHOLD: i64 = 256;
