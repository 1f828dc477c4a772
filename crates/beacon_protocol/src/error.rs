//! Error taxonomy shared across the runner.
//!
//! Components classify failures into kinds, not concrete types: the kind
//! decides the HTTP status, whether a retry can help, and whether the
//! failure counts against a circuit breaker.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Stable error kinds. Wire values are the snake_case names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Signature,
    Replay,
    RateLimited,
    NotFound,
    Conflict,
    ExternalService,
    Database,
    Auth,
    CircuitBreaker,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Signature => "signature",
            ErrorKind::Replay => "replay",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::ExternalService => "external_service",
            ErrorKind::Database => "database",
            ErrorKind::Auth => "auth",
            ErrorKind::CircuitBreaker => "circuit_breaker",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }

    /// Canonical HTTP status for this kind when surfaced to a client.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Validation | ErrorKind::Signature | ErrorKind::Replay => 400,
            ErrorKind::Auth => 401,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::RateLimited => 429,
            ErrorKind::ExternalService | ErrorKind::CircuitBreaker => 502,
            ErrorKind::Timeout => 504,
            ErrorKind::Database | ErrorKind::Internal => 500,
        }
    }

    /// Whether retrying the same operation can succeed. Replay and
    /// rate-limit rejections are authoritative.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ExternalService | ErrorKind::Database | ErrorKind::Timeout
        )
    }

    /// Whether a failure of this kind counts against a circuit breaker.
    /// Client mistakes and missing resources never trip a breaker.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            ErrorKind::ExternalService | ErrorKind::Timeout | ErrorKind::Internal
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire shape of every error surfaced to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            details: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn signature(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Signature, message)
    }

    pub fn replay(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Replay, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ApiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_expected_statuses() {
        assert_eq!(ErrorKind::Validation.http_status(), 400);
        assert_eq!(ErrorKind::Replay.http_status(), 400);
        assert_eq!(ErrorKind::Auth.http_status(), 401);
        assert_eq!(ErrorKind::NotFound.http_status(), 404);
        assert_eq!(ErrorKind::RateLimited.http_status(), 429);
        assert_eq!(ErrorKind::CircuitBreaker.http_status(), 502);
        assert_eq!(ErrorKind::Timeout.http_status(), 504);
    }

    #[test]
    fn retry_classes() {
        assert!(ErrorKind::ExternalService.is_retryable());
        assert!(ErrorKind::Database.is_retryable());
        assert!(!ErrorKind::Replay.is_retryable());
        assert!(!ErrorKind::RateLimited.is_retryable());
    }

    #[test]
    fn breaker_predicate_excludes_client_errors() {
        assert!(ErrorKind::ExternalService.trips_breaker());
        assert!(ErrorKind::Timeout.trips_breaker());
        assert!(!ErrorKind::Validation.trips_breaker());
        assert!(!ErrorKind::NotFound.trips_breaker());
    }

    #[test]
    fn wire_shape_uses_type_field() {
        let err = ApiError::replay("replay detected").with_code("BEACON-REPLAY");
        let raw = serde_json::to_value(&err).unwrap();
        assert_eq!(raw["type"], "replay");
        assert_eq!(raw["message"], "replay detected");
        assert_eq!(raw["code"], "BEACON-REPLAY");
        assert!(raw.get("details").is_none());
    }
}
