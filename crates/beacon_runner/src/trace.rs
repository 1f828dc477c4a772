//! Explicit trace context threaded through component boundaries.
//!
//! Span persistence is optional and never blocks the operation being
//! traced: finished spans go to the repo on a detached task.

use beacon_db::{TraceSpan, TraceSpanRepo};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Identifies one request or job flow across components.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub trace_id: String,
    pub parent_id: Option<String>,
}

impl TraceContext {
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            parent_id: None,
        }
    }

    pub fn with_trace_id(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            parent_id: None,
        }
    }

    pub fn child(&self, span_id: impl Into<String>) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            parent_id: Some(span_id.into()),
        }
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Optional span recorder. `None` disables persistence entirely.
#[derive(Clone)]
pub struct SpanRecorder {
    repo: Option<Arc<TraceSpanRepo>>,
}

impl SpanRecorder {
    pub fn new(repo: Option<Arc<TraceSpanRepo>>) -> Self {
        Self { repo }
    }

    pub fn disabled() -> Self {
        Self { repo: None }
    }

    /// Record a finished span without awaiting the write.
    pub fn record(
        &self,
        ctx: &TraceContext,
        name: &str,
        started_at: DateTime<Utc>,
        attrs: Option<serde_json::Value>,
    ) {
        let Some(repo) = self.repo.clone() else {
            return;
        };
        let span = TraceSpan {
            trace_id: ctx.trace_id.clone(),
            parent_id: ctx.parent_id.clone(),
            name: name.to_string(),
            started_at,
            ended_at: Some(Utc::now()),
            attrs_json: attrs.map(|v| v.to_string()),
        };
        tokio::spawn(async move {
            repo.record_best_effort(&span).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_inherits_trace_id() {
        let root = TraceContext::with_trace_id("t-1");
        let child = root.child("span-1");
        assert_eq!(child.trace_id, "t-1");
        assert_eq!(child.parent_id.as_deref(), Some("span-1"));
    }

    #[test]
    fn disabled_recorder_is_a_noop() {
        let recorder = SpanRecorder::disabled();
        // No runtime needed: the disabled path must not spawn.
        recorder.record(&TraceContext::new(), "noop", Utc::now(), None);
    }
}
