//! ---
//! fl_section: "02-resilience-fault-tolerance"
//! fl_subsection: "module"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Declarative fault scenarios and catalogs."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

use crate::error::{ResilienceError, Result};

/// Failure class induced by a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    ConnectionRefused,
    RateLimited,
    ServiceUnavailable,
    InvalidResponse,
    AuthenticationFailed,
    ResourceExhausted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::ConnectionRefused => "connection_refused",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::InvalidResponse => "invalid_response",
            ErrorKind::AuthenticationFailed => "authentication_failed",
            ErrorKind::ResourceExhausted => "resource_exhausted",
        }
    }

    /// Persistent kinds skip retries and go straight to fallback or degradation.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            ErrorKind::InvalidResponse | ErrorKind::AuthenticationFailed
        )
    }

    /// The error an injected operation reports for this kind.
    pub fn to_error(&self, component: &str) -> ResilienceError {
        let message = format!("{} injected into {}", self.as_str(), component);
        if self.is_transient() {
            ResilienceError::Transient(message)
        } else {
            ResilienceError::Persistent(message)
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recovery mechanism a scenario expects to be exercised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MechanismKind {
    ExponentialBackoff,
    CircuitBreaker,
    Fallback,
    GracefulDegradation,
    QueueAndRetry,
    EmergencyMode,
}

impl MechanismKind {
    pub const ALL: [MechanismKind; 6] = [
        MechanismKind::ExponentialBackoff,
        MechanismKind::CircuitBreaker,
        MechanismKind::Fallback,
        MechanismKind::GracefulDegradation,
        MechanismKind::QueueAndRetry,
        MechanismKind::EmergencyMode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MechanismKind::ExponentialBackoff => "exponential_backoff",
            MechanismKind::CircuitBreaker => "circuit_breaker",
            MechanismKind::Fallback => "fallback",
            MechanismKind::GracefulDegradation => "graceful_degradation",
            MechanismKind::QueueAndRetry => "queue_and_retry",
            MechanismKind::EmergencyMode => "emergency_mode",
        }
    }
}

impl fmt::Display for MechanismKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single deliberately injected failure and the recovery expected from it.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultScenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub error_kind: ErrorKind,
    pub target_component_id: String,
    /// Probability in percent (0-100) that each call to the target fails.
    pub induced_failure_rate: f64,
    pub expected_recovery_mechanism: MechanismKind,
    #[serde(rename = "recovery_deadline_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub recovery_deadline: Duration,
    pub severity: Severity,
    /// Overrides the engine-wide simulated outage window.
    #[serde(default, rename = "failure_window_ms")]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub failure_window: Option<Duration>,
    /// Simulated latency of each call to the target.
    #[serde(default, rename = "latency_ms")]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub latency: Option<Duration>,
}

impl FaultScenario {
    pub fn new(
        name: impl Into<String>,
        target_component_id: impl Into<String>,
        error_kind: ErrorKind,
        expected_recovery_mechanism: MechanismKind,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            error_kind,
            target_component_id: target_component_id.into(),
            induced_failure_rate: 100.0,
            expected_recovery_mechanism,
            recovery_deadline: Duration::from_secs(1),
            severity: Severity::Medium,
            failure_window: None,
            latency: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.induced_failure_rate = rate;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.recovery_deadline = deadline;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = Some(window);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ResilienceError::configuration("scenario name must not be blank"));
        }
        if !(0.0..=100.0).contains(&self.induced_failure_rate) {
            return Err(ResilienceError::configuration(format!(
                "scenario '{}' induced_failure_rate must be within [0, 100]",
                self.name
            )));
        }
        if self.recovery_deadline.is_zero() {
            return Err(ResilienceError::configuration(format!(
                "scenario '{}' recovery_deadline_ms must be greater than zero",
                self.name
            )));
        }
        Ok(())
    }
}

/// Named scenarios available to the harness, loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioCatalog {
    #[serde(default)]
    pub scenarios: Vec<FaultScenario>,
}

impl ScenarioCatalog {
    pub fn new(scenarios: Vec<FaultScenario>) -> Result<Self> {
        let catalog = Self { scenarios };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Load a catalog from disk.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("unable to read scenario catalog {}", path.as_ref().display())
        })?;
        contents.parse::<Self>()
    }

    /// Merge several catalog files in order.
    pub fn from_files<P: AsRef<Path>>(paths: &[P]) -> anyhow::Result<Self> {
        let mut scenarios = Vec::new();
        for path in paths {
            scenarios.extend(Self::from_file(path)?.scenarios);
        }
        Ok(Self::new(scenarios)?)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for scenario in &self.scenarios {
            scenario.validate()?;
            if !names.insert(scenario.name.as_str()) {
                return Err(ResilienceError::configuration(format!(
                    "scenario '{}' defined more than once",
                    scenario.name
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&FaultScenario> {
        self.scenarios.iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    /// One scenario per dependency of the default verification pipeline.
    pub fn default_pipeline() -> Self {
        let scenarios = vec![
            FaultScenario::new(
                "inference_timeout",
                "ai_inference",
                ErrorKind::Timeout,
                MechanismKind::ExponentialBackoff,
            )
            .with_description("Inference calls time out intermittently")
            .with_failure_rate(50.0)
            .with_deadline(Duration::from_secs(2))
            .with_severity(Severity::High),
            FaultScenario::new(
                "remote_execution_outage",
                "remote_execution",
                ErrorKind::ServiceUnavailable,
                MechanismKind::CircuitBreaker,
            )
            .with_description("Remote execution backend returns 503s")
            .with_failure_rate(30.0)
            .with_deadline(Duration::from_secs(5))
            .with_severity(Severity::High),
            FaultScenario::new(
                "notification_dispatch_failure",
                "notification_dispatch",
                ErrorKind::ConnectionRefused,
                MechanismKind::QueueAndRetry,
            )
            .with_description("Mail relay refuses connections")
            .with_failure_rate(40.0)
            .with_deadline(Duration::from_secs(3))
            .with_severity(Severity::Medium),
            FaultScenario::new(
                "data_store_write_failure",
                "data_store",
                ErrorKind::InvalidResponse,
                MechanismKind::Fallback,
            )
            .with_description("Spreadsheet store rejects writes")
            .with_deadline(Duration::from_millis(500))
            .with_severity(Severity::Medium),
            FaultScenario::new(
                "network_probe_loss",
                "network_probe",
                ErrorKind::Timeout,
                MechanismKind::GracefulDegradation,
            )
            .with_description("Connectivity probe loses packets under load")
            .with_failure_rate(60.0)
            .with_severity(Severity::Low),
            FaultScenario::new(
                "resource_exhaustion",
                "resource_check",
                ErrorKind::ResourceExhausted,
                MechanismKind::EmergencyMode,
            )
            .with_description("Host runs out of memory and disk")
            .with_severity(Severity::Critical),
        ];
        Self { scenarios }
    }
}

impl std::str::FromStr for ScenarioCatalog {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        let catalog = toml::from_str::<Self>(input).map_err(anyhow::Error::new)?;
        catalog.validate()?;
        Ok(catalog)
    }
}

/// Ordered failures across distinct components, ending in emergency mode.
#[derive(Debug, Clone, PartialEq)]
pub struct CascadeSequence {
    pub steps: Vec<FaultScenario>,
    pub inter_failure_delay: Duration,
}

impl CascadeSequence {
    pub fn new(steps: Vec<FaultScenario>, inter_failure_delay: Duration) -> Result<Self> {
        let sequence = Self {
            steps,
            inter_failure_delay,
        };
        sequence.validate()?;
        Ok(sequence)
    }

    fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(ResilienceError::configuration(
                "cascade sequence needs at least one step",
            ));
        }
        let mut targets = HashSet::new();
        for step in &self.steps {
            step.validate()?;
            if !targets.insert(step.target_component_id.as_str()) {
                return Err(ResilienceError::configuration(format!(
                    "cascade targets component '{}' more than once",
                    step.target_component_id
                )));
            }
        }
        Ok(())
    }

    /// Components in failure order.
    pub fn targets(&self) -> Vec<&str> {
        self.steps
            .iter()
            .map(|step| step.target_component_id.as_str())
            .collect()
    }
}
