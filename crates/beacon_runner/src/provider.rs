//! Region-aware provider client.
//!
//! The executor talks to third-party compute through this trait. The HTTP
//! implementation posts a plan to the provider's regional endpoint and
//! classifies the response; tests substitute scripted fakes.

use async_trait::async_trait;
use beacon_protocol::Benchmark;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// One plan's worth of work, as sent to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub job_id: String,
    pub region: String,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_id: Option<String>,
    pub benchmark: Benchmark,
}

/// Transient failures are retried within the plan budget; permanent ones
/// are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
}

#[derive(Debug, Clone)]
pub enum ProviderResult {
    Success { output: Value, receipt: Value },
    Failed { class: FailureClass, message: String },
    TimedOut,
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn id(&self) -> &str;

    /// Execute one plan within `budget`. Implementations return rather
    /// than panic; the executor owns retry and persistence.
    async fn execute(&self, request: &PlanRequest, budget: Duration) -> ProviderResult;
}

/// HTTP provider client: `POST {base_url}/regions/{region}/execute`.
pub struct HttpProviderClient {
    provider_id: String,
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    output: Value,
    receipt: Value,
}

impl HttpProviderClient {
    pub fn new(provider_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    fn id(&self) -> &str {
        &self.provider_id
    }

    async fn execute(&self, request: &PlanRequest, budget: Duration) -> ProviderResult {
        let url = format!(
            "{}/regions/{}/execute",
            self.base_url.trim_end_matches('/'),
            request.region
        );

        let response = self
            .client
            .post(&url)
            .timeout(budget)
            .json(request)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return ProviderResult::TimedOut,
            Err(e) => {
                // Connection-level failures are worth retrying.
                return ProviderResult::Failed {
                    class: FailureClass::Transient,
                    message: e.to_string(),
                };
            }
        };

        let status = response.status();
        if status.is_success() {
            return match response.json::<ProviderResponse>().await {
                Ok(body) => ProviderResult::Success {
                    output: body.output,
                    receipt: body.receipt,
                },
                Err(e) => ProviderResult::Failed {
                    class: FailureClass::Permanent,
                    message: format!("provider returned unparseable body: {e}"),
                },
            };
        }

        let class = classify_status(status.as_u16());
        let message = format!("provider returned {status}");
        ProviderResult::Failed { class, message }
    }
}

/// 408, 429, and 5xx are transient; other 4xx are permanent.
pub fn classify_status(status: u16) -> FailureClass {
    match status {
        408 | 429 => FailureClass::Transient,
        s if s >= 500 => FailureClass::Transient,
        _ => FailureClass::Permanent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(500), FailureClass::Transient);
        assert_eq!(classify_status(503), FailureClass::Transient);
        assert_eq!(classify_status(429), FailureClass::Transient);
        assert_eq!(classify_status(408), FailureClass::Transient);
        assert_eq!(classify_status(400), FailureClass::Permanent);
        assert_eq!(classify_status(404), FailureClass::Permanent);
        assert_eq!(classify_status(422), FailureClass::Permanent);
    }

    #[test]
    fn plan_request_omits_absent_question() {
        let request = PlanRequest {
            job_id: "job-A".into(),
            region: "US".into(),
            model_id: "m1".into(),
            question_id: None,
            benchmark: serde_json::from_value(serde_json::json!({
                "name": "latency",
                "container": {"image": "beacon/bench"},
                "input": {"type": "inline", "hash": "h"}
            }))
            .unwrap(),
        };
        let raw = serde_json::to_value(&request).unwrap();
        assert!(raw.get("question_id").is_none());
        assert_eq!(raw["region"], "US");
    }
}
