//! ---
//! fl_section: "02-resilience-fault-tolerance"
//! fl_subsection: "module"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Recovery and failure events emitted per scenario."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::scenario::Severity;

/// Deadline compliance of a scenario, kept apart from raw mechanism success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    RecoveredOnTime,
    RecoveredLate,
    Failed,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::RecoveredOnTime => "recovered_on_time",
            Classification::RecoveredLate => "recovered_late",
            Classification::Failed => "failed",
        }
    }

    pub fn recovered(&self) -> bool {
        !matches!(self, Classification::Failed)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emitted when a mechanism brought the component back, on time or late.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryEvent {
    pub scenario_name: String,
    pub component_id: String,
    pub mechanism: String,
    pub recovery_time_ms: u64,
    pub classification: Classification,
    pub escalated: bool,
    pub timestamp: DateTime<Utc>,
}

/// Emitted when recovery failed or a queued item was dropped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureEvent {
    pub scenario_name: String,
    pub component_id: String,
    pub error_kind: String,
    pub message: String,
    pub recovery_time_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl FailureEvent {
    pub fn new(
        scenario_name: impl Into<String>,
        component_id: impl Into<String>,
        error_kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            scenario_name: scenario_name.into(),
            component_id: component_id.into(),
            error_kind: error_kind.into(),
            message: message.into(),
            recovery_time_ms: None,
            timestamp: Utc::now(),
        }
    }
}

/// Receives failures raised outside a scenario's own report, such as
/// queued work dropped after its retries ran out.
pub trait FailureSink: Send + Sync + fmt::Debug {
    fn record_failure(&self, event: FailureEvent);
}

/// The single user-visible verdict for one scenario run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestResult {
    pub test_name: String,
    pub success: bool,
    pub message: String,
    pub severity: Severity,
    pub classification: Classification,
    pub timestamp: DateTime<Utc>,
}

