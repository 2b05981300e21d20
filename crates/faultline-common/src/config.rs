//! ---
//! fl_section: "01-core-functionality"
//! fl_subsection: "module"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Engine configuration loading and validation."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

/// Dependencies exercised by the default verification pipeline.
pub const DEFAULT_COMPONENTS: [&str; 6] = [
    "ai_inference",
    "remote_execution",
    "notification_dispatch",
    "data_store",
    "network_probe",
    "resource_check",
];

fn default_components() -> Vec<String> {
    DEFAULT_COMPONENTS.iter().map(|id| (*id).to_owned()).collect()
}

fn default_seed() -> u64 {
    0xFA17
}

fn default_failure_window() -> Duration {
    Duration::from_millis(10)
}

fn default_hard_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_escalate_to_fallback() -> bool {
    true
}

fn default_mechanisms() -> Vec<RecoveryMechanismConfig> {
    vec![
        RecoveryMechanismConfig::ExponentialBackoff(BackoffConfig::default()),
        RecoveryMechanismConfig::CircuitBreaker(BreakerConfig::default()),
        RecoveryMechanismConfig::Fallback(FallbackConfig::default()),
        RecoveryMechanismConfig::GracefulDegradation(DegradationConfig::default()),
        RecoveryMechanismConfig::QueueAndRetry(QueueConfig::default()),
    ]
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Primary configuration object for a resilience engine instance.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Ordered dependency identifiers registered at engine start.
    #[serde(default = "default_components")]
    pub components: Vec<String>,
    /// Seed for the fault source driving injected failures.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Simulated outage window between fault injection and recovery.
    #[serde(default = "default_failure_window", rename = "failure_window_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub failure_window: Duration,
    /// Safety-net timeout applied around every mechanism invocation.
    #[serde(default = "default_hard_timeout", rename = "hard_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub hard_timeout: Duration,
    /// Serve a fallback response when a mechanism gives up.
    #[serde(default = "default_escalate_to_fallback")]
    pub escalate_to_fallback: bool,
    /// Scenario catalog files loaded by the harness.
    #[serde(default)]
    pub scenario_files: Vec<PathBuf>,
    /// Recovery mechanism policies, at most one per kind.
    #[serde(default = "default_mechanisms")]
    pub mechanisms: Vec<RecoveryMechanismConfig>,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`EngineConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedEngineConfig {
    pub config: EngineConfig,
    pub source: PathBuf,
}

impl EngineConfig {
    pub const ENV_CONFIG_PATH: &str = "FAULTLINE_CONFIG";

    /// Load configuration from disk, respecting the `FAULTLINE_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedEngineConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedEngineConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedEngineConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Parse and validate a configuration file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<EngineConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Return the configured policy for a mechanism kind label, if any.
    pub fn mechanism(&self, kind: &str) -> Option<&RecoveryMechanismConfig> {
        self.mechanisms.iter().find(|m| m.kind() == kind)
    }

    /// Breaker settings used for every registered component.
    pub fn breaker(&self) -> BreakerConfig {
        match self.mechanism("circuit_breaker") {
            Some(RecoveryMechanismConfig::CircuitBreaker(cfg)) => *cfg,
            _ => BreakerConfig::default(),
        }
    }

    /// Fallback settings, also used when escalating a failed mechanism.
    pub fn fallback(&self) -> FallbackConfig {
        match self.mechanism("fallback") {
            Some(RecoveryMechanismConfig::Fallback(cfg)) => *cfg,
            _ => FallbackConfig::default(),
        }
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.components.is_empty(),
            "configuration must register at least one component"
        );
        let mut seen = HashSet::new();
        for id in &self.components {
            ensure!(!id.trim().is_empty(), "component ids must not be blank");
            ensure!(seen.insert(id.as_str()), "component '{}' registered twice", id);
        }
        ensure!(
            !self.hard_timeout.is_zero(),
            "hard_timeout_ms must be greater than zero"
        );

        let mut kinds = HashSet::new();
        for mechanism in &self.mechanisms {
            ensure!(
                kinds.insert(mechanism.kind()),
                "mechanism '{}' configured more than once",
                mechanism.kind()
            );
            mechanism.validate()?;
        }
        self.gate.validate()?;
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            components: default_components(),
            seed: default_seed(),
            failure_window: default_failure_window(),
            hard_timeout: default_hard_timeout(),
            escalate_to_fallback: default_escalate_to_fallback(),
            scenario_files: Vec::new(),
            mechanisms: default_mechanisms(),
            gate: GateConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl std::str::FromStr for EngineConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: EngineConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Policy for one recovery mechanism, tagged by `type` in TOML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecoveryMechanismConfig {
    ExponentialBackoff(BackoffConfig),
    CircuitBreaker(BreakerConfig),
    Fallback(FallbackConfig),
    GracefulDegradation(DegradationConfig),
    QueueAndRetry(QueueConfig),
}

impl RecoveryMechanismConfig {
    /// Stable label matching the serde tag.
    pub fn kind(&self) -> &'static str {
        match self {
            RecoveryMechanismConfig::ExponentialBackoff(_) => "exponential_backoff",
            RecoveryMechanismConfig::CircuitBreaker(_) => "circuit_breaker",
            RecoveryMechanismConfig::Fallback(_) => "fallback",
            RecoveryMechanismConfig::GracefulDegradation(_) => "graceful_degradation",
            RecoveryMechanismConfig::QueueAndRetry(_) => "queue_and_retry",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            RecoveryMechanismConfig::ExponentialBackoff(cfg) => cfg.validate(),
            RecoveryMechanismConfig::CircuitBreaker(cfg) => cfg.validate(),
            RecoveryMechanismConfig::Fallback(cfg) => cfg.validate(),
            RecoveryMechanismConfig::GracefulDegradation(cfg) => cfg.validate(),
            RecoveryMechanismConfig::QueueAndRetry(cfg) => cfg.validate(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackoffConfig {
    pub max_retries: u32,
    #[serde(rename = "base_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
    /// Consecutive successful invocations required to declare recovery.
    #[serde(default = "one")]
    pub success_threshold: u32,
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_retries >= 1, "exponential_backoff.max_retries must be at least 1");
        ensure!(
            self.base_delay <= self.max_delay,
            "exponential_backoff.base_delay_ms must not exceed max_delay_ms"
        );
        ensure!(
            self.success_threshold >= 1,
            "exponential_backoff.success_threshold must be at least 1"
        );
        Ok(())
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            success_threshold: 1,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    #[serde(rename = "open_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub open_timeout: Duration,
    #[serde(default = "one")]
    pub half_open_trial_count: u32,
    #[serde(default = "one")]
    pub success_threshold: u32,
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.failure_threshold >= 1,
            "circuit_breaker.failure_threshold must be at least 1"
        );
        ensure!(
            self.half_open_trial_count >= 1,
            "circuit_breaker.half_open_trial_count must be at least 1"
        );
        ensure!(
            self.success_threshold >= 1,
            "circuit_breaker.success_threshold must be at least 1"
        );
        Ok(())
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(1),
            half_open_trial_count: 1,
            success_threshold: 2,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FallbackConfig {
    /// Quality of the degraded response relative to the primary (0-1).
    pub quality_level: f64,
    /// Minimum rolling fallback success ratio (0-1).
    pub availability_target: f64,
    #[serde(default = "default_latency_budget", rename = "latency_budget_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub latency_budget: Duration,
}

fn default_latency_budget() -> Duration {
    Duration::from_millis(100)
}

impl FallbackConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            (0.0..=1.0).contains(&self.quality_level),
            "fallback.quality_level must be within [0, 1]"
        );
        ensure!(
            (0.0..=1.0).contains(&self.availability_target),
            "fallback.availability_target must be within [0, 1]"
        );
        ensure!(
            !self.latency_budget.is_zero(),
            "fallback.latency_budget_ms must be greater than zero"
        );
        Ok(())
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            quality_level: 0.6,
            availability_target: 0.95,
            latency_budget: default_latency_budget(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DegradationConfig {
    /// Level names ordered richest to minimal; the last one is the emergency tier.
    pub levels: Vec<String>,
    /// Features ordered most to least essential.
    #[serde(default)]
    pub feature_priority: Vec<String>,
    pub acceptance_threshold: f64,
}

impl DegradationConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.levels.is_empty(),
            "graceful_degradation.levels must not be empty"
        );
        let mut seen = HashSet::new();
        for level in &self.levels {
            ensure!(
                seen.insert(level.as_str()),
                "graceful_degradation level '{}' listed twice",
                level
            );
        }
        ensure!(
            (0.0..=1.0).contains(&self.acceptance_threshold),
            "graceful_degradation.acceptance_threshold must be within [0, 1]"
        );
        Ok(())
    }
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            levels: ["full", "reduced", "essential", "emergency"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            feature_priority: ["scoring", "persistence", "notifications", "reports"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            acceptance_threshold: 0.7,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueConfig {
    pub capacity: usize,
    #[serde(rename = "retry_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_interval: Duration,
    #[serde(rename = "max_age_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_age: Duration,
    pub max_retries_per_item: u32,
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.capacity >= 1, "queue_and_retry.capacity must be at least 1");
        ensure!(
            self.max_retries_per_item >= 1,
            "queue_and_retry.max_retries_per_item must be at least 1"
        );
        ensure!(
            !self.retry_interval.is_zero(),
            "queue_and_retry.retry_interval_ms must be greater than zero"
        );
        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            retry_interval: Duration::from_millis(50),
            max_age: Duration::from_secs(5),
            max_retries_per_item: 3,
        }
    }
}

fn one() -> u32 {
    1
}

/// Thresholds applied by CI when deciding the process exit status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GateConfig {
    #[serde(default = "default_min_availability")]
    pub min_availability: f64,
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
    #[serde(default)]
    pub max_critical_failures: usize,
}

fn default_min_availability() -> f64 {
    0.95
}

fn default_min_success_rate() -> f64 {
    0.80
}

impl GateConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            (0.0..=1.0).contains(&self.min_availability),
            "gate.min_availability must be within [0, 1]"
        );
        ensure!(
            (0.0..=1.0).contains(&self.min_success_rate),
            "gate.min_success_rate must be within [0, 1]"
        );
        Ok(())
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_availability: default_min_availability(),
            min_success_rate: default_min_success_rate(),
            max_critical_failures: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}
