//! Preflight region verification.
//!
//! Best-effort comparison of the provider's claimed region against a
//! client-side observation. Probe errors never fail a plan; they only
//! skip persistence of the verification fields.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct RegionObservation {
    pub region_observed: String,
    pub verified: bool,
    pub method: String,
    pub evidence_ref: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no probe endpoint configured for region {0}")]
    UnknownRegion(String),

    #[error("probe request failed: {0}")]
    Request(String),
}

#[async_trait]
pub trait RegionProbe: Send + Sync {
    async fn observe(&self, region_claimed: &str) -> Result<RegionObservation, ProbeError>;
}

/// RTT-based probe: ping the claimed region's endpoint and accept the
/// claim when the round trip fits the configured ceiling. Coarse, but it
/// catches a provider serving "EU" from another continent.
pub struct RttRegionProbe {
    endpoints: HashMap<String, String>,
    max_rtt: Duration,
    client: reqwest::Client,
}

impl RttRegionProbe {
    pub fn new(endpoints: HashMap<String, String>, max_rtt: Duration) -> Self {
        Self {
            endpoints,
            max_rtt,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl RegionProbe for RttRegionProbe {
    async fn observe(&self, region_claimed: &str) -> Result<RegionObservation, ProbeError> {
        let endpoint = self
            .endpoints
            .get(region_claimed)
            .ok_or_else(|| ProbeError::UnknownRegion(region_claimed.to_string()))?;

        let started = Instant::now();
        self.client
            .get(endpoint)
            .timeout(self.max_rtt * 2)
            .send()
            .await
            .map_err(|e| ProbeError::Request(e.to_string()))?;
        let rtt = started.elapsed();

        let verified = rtt <= self.max_rtt;
        Ok(RegionObservation {
            region_observed: if verified {
                region_claimed.to_string()
            } else {
                "unknown".to_string()
            },
            verified,
            method: "rtt".to_string(),
            evidence_ref: Some(format!("rtt_ms={}", rtt.as_millis())),
        })
    }
}

/// Probe that accepts every claim. Useful where no vantage points exist.
pub struct TrustingProbe;

#[async_trait]
impl RegionProbe for TrustingProbe {
    async fn observe(&self, region_claimed: &str) -> Result<RegionObservation, ProbeError> {
        Ok(RegionObservation {
            region_observed: region_claimed.to_string(),
            verified: true,
            method: "none".to_string(),
            evidence_ref: None,
        })
    }
}
