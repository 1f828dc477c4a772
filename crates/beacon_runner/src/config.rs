//! Runner process configuration.

use clap::Parser;
use std::path::PathBuf;

/// Beacon runner service.
#[derive(Debug, Clone, Parser)]
#[command(name = "beacon-runner", about = "Benchmark-integrity runner service")]
pub struct RunnerConfig {
    /// HTTP bind address.
    #[arg(long, env = "BEACON_BIND_ADDR", default_value = "127.0.0.1:8080")]
    pub bind_addr: String,

    /// SQLite database path.
    #[arg(long, env = "BEACON_DB_PATH", default_value = "beacon.db")]
    pub db_path: String,

    /// Provider identifier recorded on executions.
    #[arg(long, env = "BEACON_PROVIDER_ID", default_value = "default-provider")]
    pub provider_id: String,

    /// Base URL of the region-aware provider API.
    #[arg(long, env = "BEACON_PROVIDER_URL", default_value = "http://127.0.0.1:9090")]
    pub provider_url: String,

    /// Trusted-keys allowlist (JSON array). Omit to trust any verified key.
    #[arg(long, env = "BEACON_TRUSTED_KEYS")]
    pub trusted_keys_path: Option<PathBuf>,

    /// Allow submissions from keys outside the allowlist. Forced off when
    /// CI or a production environment marker is set.
    #[arg(long, env = "RUNNER_SIG_BYPASS", default_value_t = false)]
    pub signature_bypass: bool,

    /// Worker tasks executing jobs.
    #[arg(long, env = "BEACON_WORKERS", default_value_t = 1)]
    pub workers: usize,

    /// Work queue capacity.
    #[arg(long, env = "BEACON_QUEUE_CAPACITY", default_value_t = 1_024)]
    pub queue_capacity: usize,

    /// Bearer token granting admin (read+write) on /admin.
    #[arg(long, env = "BEACON_ADMIN_TOKEN")]
    pub admin_token: Option<String>,

    /// Bearer token granting operator (read-only) on /admin.
    #[arg(long, env = "BEACON_OPERATOR_TOKEN")]
    pub operator_token: Option<String>,

    /// Enable the preflight region probe.
    #[arg(long, env = "BEACON_PROBE_ENABLED", default_value_t = false)]
    pub probe_enabled: bool,

    /// Enable fallback-region routing when a breaker is open.
    #[arg(long, env = "BEACON_FALLBACK_ENABLED", default_value_t = false)]
    pub fallback_enabled: bool,

    /// Persist trace spans to the database.
    #[arg(long, env = "BEACON_TRACE_SPANS", default_value_t = false)]
    pub trace_spans: bool,

    /// Verbose console logging.
    #[arg(long, short = 'v', default_value_t = false)]
    pub verbose: bool,
}

impl RunnerConfig {
    /// Defaults for tests and embedding.
    pub fn for_tests() -> Self {
        Self::parse_from(["beacon-runner"])
    }
}
