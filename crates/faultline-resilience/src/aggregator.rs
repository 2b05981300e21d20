//! ---
//! fl_section: "03-observability"
//! fl_subsection: "module"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Availability and recovery-time roll-ups plus the release gate."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use faultline_common::time::ratio;
use faultline_common::GateConfig;
use parking_lot::Mutex;
use serde::Serialize;

use crate::component::Component;
use crate::events::{Classification, FailureEvent, FailureSink, RecoveryEvent, TestResult};
use crate::orchestrator::ScenarioReport;
use crate::scenario::Severity;

/// Request-level counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Metrics {
    pub total_requests: u64,
    /// Recovered on the first call without escalation.
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub recovered_requests: u64,
    pub average_recovery_time_ms: f64,
    pub availability_score: f64,
}

impl Metrics {
    /// `(successful + recovered) / total`, or 0 when nothing was recorded.
    pub fn availability(&self) -> f64 {
        ratio(
            self.successful_requests + self.recovered_requests,
            self.total_requests,
        )
    }
}

/// Aggregate view handed to reporters and the release gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub availability_score: f64,
    pub critical_failure_count: usize,
    pub average_recovery_time_ms: f64,
    pub late_recoveries: usize,
    pub escalations: usize,
    pub metrics: Metrics,
    pub components: Vec<Component>,
    pub results: Vec<TestResult>,
    pub recovery_events: Vec<RecoveryEvent>,
    pub failure_events: Vec<FailureEvent>,
}

#[derive(Debug, Default)]
struct AggregatorState {
    metrics: Metrics,
    recovery_time_total_ms: u64,
    recoveries: u64,
    late_recoveries: usize,
    escalations: usize,
    results: Vec<TestResult>,
    recovery_events: Vec<RecoveryEvent>,
    failure_events: Vec<FailureEvent>,
}

/// Thread-safe accumulator of scenario outcomes.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    state: Mutex<AggregatorState>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, report: &ScenarioReport) {
        let mut state = self.state.lock();
        state.metrics.total_requests += 1;
        match report.classification {
            Classification::Failed => state.metrics.failed_requests += 1,
            Classification::RecoveredOnTime | Classification::RecoveredLate => {
                if report.outcome.attempts <= 1 && !report.outcome.escalated {
                    state.metrics.successful_requests += 1;
                } else {
                    state.metrics.recovered_requests += 1;
                }
                state.recovery_time_total_ms += report.recovery_time_ms();
                state.recoveries += 1;
                state.metrics.average_recovery_time_ms =
                    state.recovery_time_total_ms as f64 / state.recoveries as f64;
            }
        }
        if report.classification == Classification::RecoveredLate {
            state.late_recoveries += 1;
        }
        if report.outcome.escalated {
            state.escalations += 1;
        }
        state.metrics.availability_score = state.metrics.availability();

        state.results.push(report.result.clone());
        if let Some(event) = &report.recovery_event {
            state.recovery_events.push(event.clone());
        }
        if let Some(event) = &report.failure_event {
            state.failure_events.push(event.clone());
        }
    }

    /// Record a failure that did not come from a scenario run, e.g. dropped queue work.
    pub fn record_failure_event(&self, event: FailureEvent) {
        self.state.lock().failure_events.push(event);
    }

    pub fn metrics(&self) -> Metrics {
        self.state.lock().metrics.clone()
    }

    pub fn summarize(&self, components: Vec<Component>) -> TestSummary {
        let state = self.state.lock();
        let total = state.results.len();
        let passed = state.results.iter().filter(|r| r.success).count();
        let critical_failure_count = state
            .results
            .iter()
            .filter(|r| !r.success && r.severity == Severity::Critical)
            .count();
        TestSummary {
            total,
            passed,
            failed: total - passed,
            success_rate: ratio(passed as u64, total as u64),
            availability_score: state.metrics.availability(),
            critical_failure_count,
            average_recovery_time_ms: state.metrics.average_recovery_time_ms,
            late_recoveries: state.late_recoveries,
            escalations: state.escalations,
            metrics: state.metrics.clone(),
            components,
            results: state.results.clone(),
            recovery_events: state.recovery_events.clone(),
            failure_events: state.failure_events.clone(),
        }
    }

    pub fn reset(&self) {
        *self.state.lock() = AggregatorState::default();
    }
}

impl FailureSink for MetricsAggregator {
    fn record_failure(&self, event: FailureEvent) {
        self.record_failure_event(event);
    }
}

/// Result of checking a summary against the release thresholds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateVerdict {
    pub passed: bool,
    pub violations: Vec<String>,
}

impl GateVerdict {
    /// Process exit status for CI: 0 when passed, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.passed {
            0
        } else {
            1
        }
    }
}

/// Thresholds a run must meet to be releasable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReleaseGate {
    pub min_availability: f64,
    pub min_success_rate: f64,
    pub max_critical_failures: usize,
}

impl ReleaseGate {
    pub fn from_config(config: &GateConfig) -> Self {
        Self {
            min_availability: config.min_availability,
            min_success_rate: config.min_success_rate,
            max_critical_failures: config.max_critical_failures,
        }
    }

    pub fn evaluate(&self, summary: &TestSummary) -> GateVerdict {
        let mut violations = Vec::new();
        if summary.critical_failure_count > self.max_critical_failures {
            violations.push(format!(
                "{} critical failures (max {})",
                summary.critical_failure_count, self.max_critical_failures
            ));
        }
        if summary.availability_score < self.min_availability {
            violations.push(format!(
                "availability {:.3} below {:.3}",
                summary.availability_score, self.min_availability
            ));
        }
        if summary.success_rate < self.min_success_rate {
            violations.push(format!(
                "success rate {:.3} below {:.3}",
                summary.success_rate, self.min_success_rate
            ));
        }
        GateVerdict {
            passed: violations.is_empty(),
            violations,
        }
    }
}

impl Default for ReleaseGate {
    fn default() -> Self {
        Self::from_config(&GateConfig::default())
    }
}
