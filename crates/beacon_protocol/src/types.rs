//! Job specification, plan expansion, and the status machines.
//!
//! A `JobSpec` is immutable once admitted. Model and question lists arrive
//! in two wire shapes (bare strings or objects), so both decode through
//! untagged wire enums and are normalized strictly after signature
//! verification — normalization never feeds back into the signed bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Client-supplied benchmark job specification.
///
/// The tuple covered by `signature` is the canonical JSON of this document
/// with the top-level `id`, `signature`, and `public_key` fields removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Stable identifier. Assigned by the server when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Spec format version, e.g. `v1`.
    pub version: String,
    pub benchmark: Benchmark,
    pub constraints: Constraints,
    /// Open metadata map. Carries `models`, `timestamp`, `nonce`, and
    /// `wallet_auth` when present.
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    /// Models may also be declared at the top level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<ModelWire>>,
    /// Benchmark questions. Required and non-empty for v1 bias benchmarks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub questions: Option<Vec<QuestionWire>>,
    /// Base64 Ed25519 signature over the canonical payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Base64 Ed25519 public key of the submitter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Benchmark {
    pub name: String,
    pub container: ContainerSpec,
    pub input: InputSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Content hash of the input. Required at admission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constraints {
    /// Regions the job must run in, in declared order.
    pub regions: Vec<String>,
    #[serde(default = "default_min_regions")]
    pub min_regions: u32,
    /// Overall job timeout in seconds.
    #[serde(rename = "timeout", default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Fraction of plans that must complete for the job to count as
    /// completed, in `[0.0, 1.0]`.
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
}

fn default_min_regions() -> u32 {
    1
}

fn default_timeout_secs() -> u64 {
    crate::defaults::DEFAULT_JOB_TIMEOUT_SECS
}

fn default_min_success_rate() -> f64 {
    1.0
}

impl JobSpec {
    /// True when the bias-detection rule applies: `v1` specs whose benchmark
    /// name contains "bias" (case-insensitive) must carry questions.
    pub fn requires_questions(&self) -> bool {
        self.version == "v1" && self.benchmark.name.to_lowercase().contains("bias")
    }

    /// String metadata value, if present and a string.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Client-supplied submission timestamp (`metadata.timestamp`, RFC 3339).
    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.metadata_str("timestamp")
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }

    /// Client-supplied replay nonce (`metadata.nonce`).
    pub fn nonce(&self) -> Option<&str> {
        self.metadata_str("nonce")
    }

    /// Resolve the model list in declared order.
    ///
    /// Top-level `models` wins; otherwise `metadata.models` is decoded from
    /// either wire shape. A spec with no models at all runs against the
    /// single implicit `default` model. Each resolved model carries the
    /// constraint region set.
    pub fn resolve_models(&self) -> Result<Vec<Model>, ModelDecodeError> {
        let wires: Vec<ModelWire> = if let Some(models) = &self.models {
            models.clone()
        } else if let Some(raw) = self.metadata.get("models") {
            serde_json::from_value(raw.clone()).map_err(|_| ModelDecodeError)?
        } else {
            vec![ModelWire::Id("default".to_string())]
        };

        let mut models = Vec::with_capacity(wires.len());
        for wire in wires {
            let model = wire.into_model(&self.constraints.regions);
            if model.id.is_empty() {
                return Err(ModelDecodeError);
            }
            models.push(model);
        }
        Ok(models)
    }

    /// Resolve the question list in declared order. Bare strings get
    /// positional ids (`q1`, `q2`, ...).
    pub fn resolve_questions(&self) -> Vec<Question> {
        let Some(wires) = &self.questions else {
            return Vec::new();
        };
        wires
            .iter()
            .enumerate()
            .map(|(idx, wire)| wire.to_question(idx))
            .collect()
    }

    /// Expand the cross product regions x models x questions into plans.
    ///
    /// Order is deterministic and region-major: all plans for the first
    /// region precede any plan for the second, and within a region models
    /// and questions keep their declared order.
    pub fn expand_plans(&self, models: &[Model], questions: &[Question]) -> Vec<Plan> {
        let mut plans = Vec::new();
        for region in &self.constraints.regions {
            for model in models {
                if questions.is_empty() {
                    plans.push(Plan {
                        region: region.clone(),
                        model_id: model.id.clone(),
                        question_id: None,
                    });
                } else {
                    for question in questions {
                        plans.push(Plan {
                            region: region.clone(),
                            model_id: model.id.clone(),
                            question_id: Some(question.id.clone()),
                        });
                    }
                }
            }
        }
        plans
    }
}

/// Wire form of a model reference: either `"gpt-x"` or `{"id": "gpt-x"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelWire {
    Id(String),
    Full {
        id: String,
        #[serde(default)]
        name: Option<String>,
    },
}

impl ModelWire {
    fn into_model(self, regions: &[String]) -> Model {
        match self {
            ModelWire::Id(id) => Model {
                name: id.clone(),
                id,
                regions: regions.to_vec(),
            },
            ModelWire::Full { id, name } => Model {
                name: name.unwrap_or_else(|| id.clone()),
                id,
                regions: regions.to_vec(),
            },
        }
    }
}

/// Normalized model, uniform regardless of wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub regions: Vec<String>,
}

/// Wire form of a question: either a bare prompt string or an object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuestionWire {
    Text(String),
    Full {
        id: String,
        #[serde(default)]
        text: Option<String>,
    },
}

impl QuestionWire {
    fn to_question(&self, idx: usize) -> Question {
        match self {
            QuestionWire::Text(text) => Question {
                id: format!("q{}", idx + 1),
                text: text.clone(),
            },
            QuestionWire::Full { id, text } => Question {
                id: id.clone(),
                text: text.clone().unwrap_or_default(),
            },
        }
    }
}

/// Normalized benchmark question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub text: String,
}

/// One (region, model, question) slice of a job, scheduled as one execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Plan {
    pub region: String,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_id: Option<String>,
}

/// Job lifecycle. Transitions never go backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Queued => matches!(next, JobStatus::Processing | JobStatus::Failed),
            JobStatus::Processing => matches!(next, JobStatus::Completed | JobStatus::Failed),
            JobStatus::Completed | JobStatus::Failed => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(StatusParseError(other.to_string())),
        }
    }
}

/// Per-plan execution lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Created,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Created => "created",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Timeout
        )
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        match self {
            ExecutionStatus::Created => !matches!(next, ExecutionStatus::Created),
            ExecutionStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ExecutionStatus::Created),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "timeout" => Ok(ExecutionStatus::Timeout),
            other => Err(StatusParseError(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown status: {0}")]
pub struct StatusParseError(pub String);

#[derive(Debug, thiserror::Error)]
#[error("model list is malformed")]
pub struct ModelDecodeError;

/// Wire format for the work queue: a pointer to the persisted job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEnvelope {
    pub id: String,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
}
