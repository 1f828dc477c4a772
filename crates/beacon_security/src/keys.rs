//! Trusted-key allowlist and the signature-bypass policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

/// One allowlisted submitter key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedKeyEntry {
    pub kid: String,
    /// Base64 Ed25519 public key.
    pub public_key: String,
    /// `active` or `revoked`.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
}

/// Outcome of a trust lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyTrust {
    /// Key is allowlisted and currently valid.
    Trusted { kid: String },
    /// Key is not in the allowlist at all.
    Unknown,
    /// Key is listed but revoked or outside its validity window.
    Rejected { kid: String, reason: String },
}

/// In-memory allowlist, indexed by public key.
#[derive(Debug, Clone, Default)]
pub struct TrustedKeys {
    by_public_key: HashMap<String, TrustedKeyEntry>,
}

impl TrustedKeys {
    pub fn new(entries: Vec<TrustedKeyEntry>) -> Self {
        let mut by_public_key = HashMap::with_capacity(entries.len());
        for entry in entries {
            if by_public_key
                .insert(entry.public_key.clone(), entry.clone())
                .is_some()
            {
                warn!(kid = %entry.kid, "duplicate trusted key entry, later entry wins");
            }
        }
        Self { by_public_key }
    }

    /// Load the allowlist from a JSON file containing an array of entries.
    pub fn load(path: &Path) -> Result<Self, TrustedKeysError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TrustedKeysError::Io(path.display().to_string(), e))?;
        let entries: Vec<TrustedKeyEntry> = serde_json::from_str(&raw)?;
        Ok(Self::new(entries))
    }

    pub fn is_empty(&self) -> bool {
        self.by_public_key.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_public_key.len()
    }

    /// Check a submitter public key against the allowlist at `now`.
    pub fn check(&self, public_key_b64: &str, now: DateTime<Utc>) -> KeyTrust {
        let Some(entry) = self.by_public_key.get(public_key_b64) else {
            return KeyTrust::Unknown;
        };

        if entry.status != "active" {
            return KeyTrust::Rejected {
                kid: entry.kid.clone(),
                reason: format!("key status is '{}'", entry.status),
            };
        }
        if let Some(not_before) = entry.not_before {
            if now < not_before {
                return KeyTrust::Rejected {
                    kid: entry.kid.clone(),
                    reason: "key is not yet valid".to_string(),
                };
            }
        }
        if let Some(not_after) = entry.not_after {
            if now > not_after {
                return KeyTrust::Rejected {
                    kid: entry.kid.clone(),
                    reason: "key has expired".to_string(),
                };
            }
        }

        KeyTrust::Trusted {
            kid: entry.kid.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TrustedKeysError {
    #[error("failed to read trusted keys file {0}: {1}")]
    Io(String, #[source] std::io::Error),

    #[error("trusted keys file is malformed: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Whether the deployment environment forbids signature bypass outright.
///
/// Bypass is refused when `CI` is set to a truthy value or when the
/// environment marker names production, regardless of configuration.
pub fn deployment_forbids_bypass(ci: Option<&str>, env_marker: Option<&str>) -> bool {
    let ci_set = ci.map(|v| {
        let v = v.trim().to_ascii_lowercase();
        !v.is_empty() && v != "0" && v != "false"
    });
    if ci_set == Some(true) {
        return true;
    }
    matches!(
        env_marker.map(|v| v.trim().to_ascii_lowercase()),
        Some(ref v) if v == "production" || v == "prod"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(kid: &str, status: &str) -> TrustedKeyEntry {
        TrustedKeyEntry {
            kid: kid.to_string(),
            public_key: format!("pk-{kid}"),
            status: status.to_string(),
            not_before: None,
            not_after: None,
        }
    }

    fn at(year: i32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn active_key_is_trusted() {
        let keys = TrustedKeys::new(vec![entry("alice", "active")]);
        assert_eq!(
            keys.check("pk-alice", at(2026)),
            KeyTrust::Trusted {
                kid: "alice".to_string()
            }
        );
    }

    #[test]
    fn unknown_and_revoked_keys() {
        let keys = TrustedKeys::new(vec![entry("bob", "revoked")]);
        assert_eq!(keys.check("pk-nobody", at(2026)), KeyTrust::Unknown);
        assert!(matches!(
            keys.check("pk-bob", at(2026)),
            KeyTrust::Rejected { kid, .. } if kid == "bob"
        ));
    }

    #[test]
    fn validity_window_is_enforced() {
        let mut e = entry("carol", "active");
        e.not_before = Some(at(2025));
        e.not_after = Some(at(2027));
        let keys = TrustedKeys::new(vec![e]);

        assert!(matches!(keys.check("pk-carol", at(2024)), KeyTrust::Rejected { .. }));
        assert!(matches!(keys.check("pk-carol", at(2026)), KeyTrust::Trusted { .. }));
        assert!(matches!(keys.check("pk-carol", at(2028)), KeyTrust::Rejected { .. }));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        std::fs::write(
            &path,
            r#"[{"kid": "k1", "public_key": "pk1", "status": "active"}]"#,
        )
        .unwrap();

        let keys = TrustedKeys::load(&path).unwrap();
        assert_eq!(keys.len(), 1);
        assert!(matches!(keys.check("pk1", at(2026)), KeyTrust::Trusted { .. }));
    }

    #[test]
    fn bypass_refused_in_ci_and_production() {
        assert!(deployment_forbids_bypass(Some("true"), None));
        assert!(deployment_forbids_bypass(Some("1"), None));
        assert!(!deployment_forbids_bypass(Some("false"), None));
        assert!(!deployment_forbids_bypass(Some("0"), Some("staging")));
        assert!(deployment_forbids_bypass(None, Some("production")));
        assert!(deployment_forbids_bypass(None, Some("Prod")));
        assert!(!deployment_forbids_bypass(None, Some("dev")));
        assert!(!deployment_forbids_bypass(None, None));
    }
}
