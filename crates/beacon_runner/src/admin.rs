//! Admin configuration and flags.
//!
//! A closed schema of known keys: unknown keys are ignored, every nested
//! group has a sanitizer with per-field range checks. Admin endpoints are
//! gated by Bearer tokens mapped to roles.

use beacon_protocol::defaults;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tracing::info;

/// Runtime-mutable feature flags.
///
/// The deployment policy is captured once at startup: when the `CI` or
/// production environment marker is present, signature bypass stays off
/// no matter what the flag says.
pub struct Flags {
    pub signature_bypass: AtomicBool,
    pub probe_enabled: AtomicBool,
    pub fallback_enabled: AtomicBool,
    bypass_forbidden: bool,
}

impl Flags {
    pub fn new(signature_bypass: bool, probe_enabled: bool, fallback_enabled: bool) -> Self {
        Self {
            signature_bypass: AtomicBool::new(signature_bypass),
            probe_enabled: AtomicBool::new(probe_enabled),
            fallback_enabled: AtomicBool::new(fallback_enabled),
            bypass_forbidden: false,
        }
    }

    /// Apply the deployment policy from the process environment.
    pub fn with_deployment_policy(mut self) -> Self {
        self.bypass_forbidden = beacon_security::keys::deployment_forbids_bypass(
            std::env::var("CI").ok().as_deref(),
            std::env::var("BEACON_ENV").ok().as_deref(),
        );
        if self.bypass_forbidden && self.signature_bypass.load(Ordering::Relaxed) {
            info!("signature bypass disabled by deployment environment");
        }
        self
    }

    /// Effective bypass state.
    pub fn signature_bypass(&self) -> bool {
        !self.bypass_forbidden && self.signature_bypass.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Value {
        serde_json::json!({
            "signature_bypass": self.signature_bypass.load(Ordering::Relaxed),
            "probe_enabled": self.probe_enabled.load(Ordering::Relaxed),
            "fallback_enabled": self.fallback_enabled.load(Ordering::Relaxed),
        })
    }

    /// Apply a partial update. Unknown keys are ignored.
    pub fn apply(&self, update: &Value) {
        let Some(obj) = update.as_object() else {
            return;
        };
        if let Some(v) = obj.get("signature_bypass").and_then(Value::as_bool) {
            self.signature_bypass.store(v, Ordering::Relaxed);
            info!(signature_bypass = v, "Flag updated");
        }
        if let Some(v) = obj.get("probe_enabled").and_then(Value::as_bool) {
            self.probe_enabled.store(v, Ordering::Relaxed);
        }
        if let Some(v) = obj.get("fallback_enabled").and_then(Value::as_bool) {
            self.fallback_enabled.store(v, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboxSettings {
    pub tick_ms: u64,
    pub batch_size: i64,
    pub max_attempts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorSettings {
    pub per_region_budget_secs: u64,
    pub region_fan_out: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitSettings {
    pub per_ip: u32,
    pub per_kid: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerSettings {
    pub max_failures: u32,
    pub cooldown_secs: u64,
    pub success_threshold: u32,
}

/// The full admin-visible configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdminConfig {
    pub outbox: OutboxSettings,
    pub executor: ExecutorSettings,
    pub rate_limit: RateLimitSettings,
    pub breaker: BreakerSettings,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            outbox: OutboxSettings {
                tick_ms: defaults::OUTBOX_TICK_MS,
                batch_size: defaults::OUTBOX_BATCH_SIZE,
                max_attempts: defaults::OUTBOX_MAX_ATTEMPTS,
            },
            executor: ExecutorSettings {
                per_region_budget_secs: defaults::PER_REGION_BUDGET_SECS,
                region_fan_out: defaults::REGION_FAN_OUT,
            },
            rate_limit: RateLimitSettings {
                per_ip: defaults::RATE_LIMIT_PER_IP,
                per_kid: defaults::RATE_LIMIT_PER_KID,
                window_secs: defaults::RATE_LIMIT_WINDOW_SECS,
            },
            breaker: BreakerSettings {
                max_failures: defaults::BREAKER_MAX_FAILURES,
                cooldown_secs: defaults::BREAKER_COOLDOWN_SECS,
                success_threshold: defaults::BREAKER_SUCCESS_THRESHOLD,
            },
        }
    }
}

/// Shared, sanitized admin config store.
pub struct ConfigStore {
    config: RwLock<AdminConfig>,
}

impl ConfigStore {
    pub fn new(config: AdminConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    pub fn snapshot(&self) -> AdminConfig {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Merge a partial update. Each group has its own sanitizer; values
    /// out of range are rejected wholesale with a field path.
    pub fn apply(&self, update: &Value) -> Result<AdminConfig, String> {
        let mut config = self.snapshot();
        let Some(obj) = update.as_object() else {
            return Err("config update must be a JSON object".to_string());
        };

        if let Some(group) = obj.get("outbox") {
            sanitize_outbox(&mut config.outbox, group)?;
        }
        if let Some(group) = obj.get("executor") {
            sanitize_executor(&mut config.executor, group)?;
        }
        if let Some(group) = obj.get("rate_limit") {
            sanitize_rate_limit(&mut config.rate_limit, group)?;
        }
        if let Some(group) = obj.get("breaker") {
            sanitize_breaker(&mut config.breaker, group)?;
        }

        let mut stored = self.config.write().unwrap_or_else(|e| e.into_inner());
        *stored = config.clone();
        info!("Admin config updated");
        Ok(config)
    }
}

fn get_u64(group: &Value, field: &str, min: u64, max: u64) -> Result<Option<u64>, String> {
    match group.get(field) {
        None => Ok(None),
        Some(v) => {
            let value = v
                .as_u64()
                .ok_or_else(|| format!("{field} must be an integer"))?;
            if value < min || value > max {
                return Err(format!("{field} must be in [{min}, {max}]"));
            }
            Ok(Some(value))
        }
    }
}

fn sanitize_outbox(settings: &mut OutboxSettings, group: &Value) -> Result<(), String> {
    if let Some(v) = get_u64(group, "tick_ms", 100, 60_000)? {
        settings.tick_ms = v;
    }
    if let Some(v) = get_u64(group, "batch_size", 1, 1_000)? {
        settings.batch_size = v as i64;
    }
    if let Some(v) = get_u64(group, "max_attempts", 1, 100)? {
        settings.max_attempts = v as i64;
    }
    Ok(())
}

fn sanitize_executor(settings: &mut ExecutorSettings, group: &Value) -> Result<(), String> {
    if let Some(v) = get_u64(group, "per_region_budget_secs", 1, 24 * 3_600)? {
        settings.per_region_budget_secs = v;
    }
    if let Some(v) = get_u64(group, "region_fan_out", 1, 64)? {
        settings.region_fan_out = v as usize;
    }
    Ok(())
}

fn sanitize_rate_limit(settings: &mut RateLimitSettings, group: &Value) -> Result<(), String> {
    if let Some(v) = get_u64(group, "per_ip", 1, 10_000)? {
        settings.per_ip = v as u32;
    }
    if let Some(v) = get_u64(group, "per_kid", 1, 10_000)? {
        settings.per_kid = v as u32;
    }
    if let Some(v) = get_u64(group, "window_secs", 1, 3_600)? {
        settings.window_secs = v;
    }
    Ok(())
}

fn sanitize_breaker(settings: &mut BreakerSettings, group: &Value) -> Result<(), String> {
    if let Some(v) = get_u64(group, "max_failures", 1, 1_000)? {
        settings.max_failures = v as u32;
    }
    if let Some(v) = get_u64(group, "cooldown_secs", 1, 3_600)? {
        settings.cooldown_secs = v;
    }
    if let Some(v) = get_u64(group, "success_threshold", 1, 100)? {
        settings.success_threshold = v as u32;
    }
    Ok(())
}

/// Access roles on the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Operator,
    Viewer,
}

impl Role {
    pub fn can_read_admin(&self) -> bool {
        matches!(self, Role::Admin | Role::Operator)
    }

    pub fn can_write_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

/// Bearer-token role mapping.
pub struct AdminAuth {
    admin_token: Option<String>,
    operator_token: Option<String>,
}

impl AdminAuth {
    pub fn new(admin_token: Option<String>, operator_token: Option<String>) -> Self {
        Self {
            admin_token,
            operator_token,
        }
    }

    pub fn role_for(&self, bearer: Option<&str>) -> Role {
        match bearer {
            Some(token) if Some(token) == self.admin_token.as_deref() => Role::Admin,
            Some(token) if Some(token) == self.operator_token.as_deref() => Role::Operator,
            _ => Role::Viewer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_keys_are_ignored() {
        let store = ConfigStore::new(AdminConfig::default());
        let updated = store
            .apply(&json!({"outbox": {"tick_ms": 500, "bogus": 1}, "nonsense": {}}))
            .unwrap();
        assert_eq!(updated.outbox.tick_ms, 500);
        assert_eq!(updated.outbox.batch_size, defaults::OUTBOX_BATCH_SIZE);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let store = ConfigStore::new(AdminConfig::default());
        let err = store.apply(&json!({"outbox": {"tick_ms": 1}})).unwrap_err();
        assert!(err.contains("tick_ms"));
        // The stored config is untouched on rejection.
        assert_eq!(store.snapshot().outbox.tick_ms, defaults::OUTBOX_TICK_MS);
    }

    #[test]
    fn wrong_types_are_rejected() {
        let store = ConfigStore::new(AdminConfig::default());
        assert!(store
            .apply(&json!({"breaker": {"max_failures": "five"}}))
            .is_err());
    }

    #[test]
    fn flags_apply_partial_updates() {
        let flags = Flags::new(false, true, false);
        flags.apply(&json!({"probe_enabled": false, "unknown": true}));
        assert!(!flags.probe_enabled.load(Ordering::Relaxed));
        assert!(!flags.signature_bypass.load(Ordering::Relaxed));
    }

    #[test]
    fn roles_map_from_tokens() {
        let auth = AdminAuth::new(Some("adm".into()), Some("op".into()));
        assert_eq!(auth.role_for(Some("adm")), Role::Admin);
        assert_eq!(auth.role_for(Some("op")), Role::Operator);
        assert_eq!(auth.role_for(Some("wrong")), Role::Viewer);
        assert_eq!(auth.role_for(None), Role::Viewer);

        assert!(Role::Admin.can_write_admin());
        assert!(Role::Operator.can_read_admin());
        assert!(!Role::Operator.can_write_admin());
        assert!(!Role::Viewer.can_read_admin());
    }
}
