//! Structured pipeline events.
//!
//! Reports carry a flat list of these records so a run can be audited
//! after the fact without scraping log output.

use serde::{Deserialize, Serialize};

pub const OUTCOME_PASS: &str = "pass";
pub const OUTCOME_FAIL: &str = "fail";
pub const OUTCOME_SKIP: &str = "skip";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub trace_id: String,
    /// Job or candidate the event is about.
    pub decision_id: String,
    pub component: String,
    pub event: String,
    pub outcome: String,
    pub error_code: Option<String>,
}

impl PipelineEvent {
    pub fn pass(trace_id: &str, decision_id: &str, component: &str, event: &str) -> Self {
        Self::with_outcome(trace_id, decision_id, component, event, OUTCOME_PASS, None)
    }

    pub fn skip(trace_id: &str, decision_id: &str, component: &str, event: &str) -> Self {
        Self::with_outcome(trace_id, decision_id, component, event, OUTCOME_SKIP, None)
    }

    pub fn fail(
        trace_id: &str,
        decision_id: &str,
        component: &str,
        event: &str,
        error_code: &str,
    ) -> Self {
        Self::with_outcome(
            trace_id,
            decision_id,
            component,
            event,
            OUTCOME_FAIL,
            Some(error_code),
        )
    }

    fn with_outcome(
        trace_id: &str,
        decision_id: &str,
        component: &str,
        event: &str,
        outcome: &str,
        error_code: Option<&str>,
    ) -> Self {
        Self {
            trace_id: trace_id.to_string(),
            decision_id: decision_id.to_string(),
            component: component.to_string(),
            event: event.to_string(),
            outcome: outcome.to_string(),
            error_code: error_code.map(str::to_string),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.outcome == OUTCOME_FAIL
    }
}

/// Trace id of the form `<prefix>-<UTC timestamp>`.
pub fn stamp_trace_id(prefix: &str) -> String {
    format!("{prefix}-{}", chrono::Utc::now().format("%Y%m%dT%H%M%SZ"))
}
