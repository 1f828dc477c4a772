//! Shared domain types for the Beacon runner.
//!
//! A benchmark job arrives as a signed `JobSpec`, fans out into one `Plan`
//! per (region, model, question) slice, and every finished plan leaves an
//! execution receipt behind. This crate holds the vocabulary every other
//! crate speaks: the spec and its nested documents, the status machines,
//! plan expansion, the queue envelope, the canonical JSON form that
//! signatures cover, and the error taxonomy surfaced over HTTP.

pub mod canonical;
pub mod defaults;
pub mod error;
pub mod http_types;
pub mod types;

pub use canonical::{canonical_json, signed_payload, CanonicalError};
pub use error::{ApiError, ErrorKind};
pub use types::{
    Benchmark,
    Constraints,
    ContainerSpec,
    ExecutionStatus,
    InputSpec,
    JobSpec,
    JobStatus,
    Model,
    ModelWire,
    Plan,
    Question,
    QuestionWire,
    QueueEnvelope,
};

pub use http_types::{
    CrossRegionResults,
    DiffAnalysis,
    ErrorResponse,
    ExecutionView,
    HealthReport,
    HealthState,
    JobDetail,
    JobSummary,
    ListExecutionsResponse,
    ListJobsResponse,
    ProbeReport,
    ProofResponse,
    RegionOutcome,
    SubmitJobResponse,
    TransparencyRootResponse,
};
