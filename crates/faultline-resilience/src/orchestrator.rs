//! ---
//! fl_section: "02-resilience-fault-tolerance"
//! fl_subsection: "module"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Maps fault scenarios to recovery mechanisms and classifies the result."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use faultline_common::time::duration_to_millis;
use faultline_common::{
    BackoffConfig, DegradationConfig, EngineConfig, QueueConfig, RecoveryMechanismConfig,
};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{error, info, warn};

use crate::aggregator::MetricsAggregator;
use crate::component::{ComponentRegistry, HealthStatus};
use crate::degradation::DegradationSelector;
use crate::error::{ResilienceError, Result};
use crate::events::{Classification, FailureEvent, RecoveryEvent, TestResult};
use crate::fallback::FallbackProvider;
use crate::fault::FaultInjector;
use crate::metrics::ResilienceMetrics;
use crate::operation::Operation;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::scenario::{FaultScenario, MechanismKind, Severity};
use crate::strategy::{
    BackoffStrategy, CircuitBreakerStrategy, DegradationStrategy, EmergencyStrategy,
    FallbackStrategy, QueueStrategy, RecoveryContext, RecoveryOutcome, RecoveryStrategy,
    StrategyMap, DEFAULT_PROBE_SAMPLES, DEFAULT_TRIAL_CYCLES,
};

/// Everything known about one scenario run.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioReport {
    pub scenario_name: String,
    pub component_id: String,
    pub mechanism: MechanismKind,
    pub severity: Severity,
    pub classification: Classification,
    /// Time from mechanism start to resolution, excluding the failure window.
    pub recovery_time: Duration,
    pub outcome: RecoveryOutcome,
    /// `DeadlineExceeded` for late recoveries, the mechanism error for failures.
    pub error: Option<ResilienceError>,
    pub result: TestResult,
    pub recovery_event: Option<RecoveryEvent>,
    pub failure_event: Option<FailureEvent>,
}

impl ScenarioReport {
    pub fn recovered(&self) -> bool {
        self.classification.recovered()
    }

    pub fn recovery_time_ms(&self) -> u64 {
        duration_to_millis(self.recovery_time)
    }
}

/// Runs fault scenarios against registered components.
#[derive(Debug)]
pub struct RecoveryOrchestrator {
    registry: Arc<ComponentRegistry>,
    injector: Arc<FaultInjector>,
    aggregator: Arc<MetricsAggregator>,
    fallback: Arc<FallbackProvider>,
    strategies: StrategyMap,
    operations: Mutex<IndexMap<String, Arc<dyn Operation>>>,
    metrics: Option<ResilienceMetrics>,
    failure_window: Duration,
    hard_timeout: Duration,
    escalate_to_fallback: bool,
}

impl RecoveryOrchestrator {
    /// Build the orchestrator and one strategy per mechanism from `config`.
    pub fn from_config(
        config: &EngineConfig,
        registry: Arc<ComponentRegistry>,
        injector: Arc<FaultInjector>,
        aggregator: Arc<MetricsAggregator>,
        metrics: Option<ResilienceMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        let backoff = match config.mechanism("exponential_backoff") {
            Some(RecoveryMechanismConfig::ExponentialBackoff(cfg)) => *cfg,
            _ => BackoffConfig::default(),
        };
        let degradation = match config.mechanism("graceful_degradation") {
            Some(RecoveryMechanismConfig::GracefulDegradation(cfg)) => cfg.clone(),
            _ => DegradationConfig::default(),
        };
        let queue = match config.mechanism("queue_and_retry") {
            Some(RecoveryMechanismConfig::QueueAndRetry(cfg)) => *cfg,
            _ => QueueConfig::default(),
        };
        let breaker = config.breaker();
        let worst_case = breaker.open_timeout * (DEFAULT_TRIAL_CYCLES + 1);
        if worst_case > config.hard_timeout {
            warn!(
                target: "faultline::resilience::orchestrator",
                open_timeout_ms = duration_to_millis(breaker.open_timeout),
                hard_timeout_ms = duration_to_millis(config.hard_timeout),
                "circuit breaker trial cycles may outlast the hard timeout",
            );
        }

        let fallback = Arc::new(FallbackProvider::new(config.fallback())?);
        let selector = Arc::new(DegradationSelector::new(&degradation, metrics.clone())?);

        let mut strategies = StrategyMap::new();
        strategies.insert(Arc::new(BackoffStrategy::new(RetryExecutor::new(
            RetryPolicy::from_config(&backoff)?,
        ))));
        strategies.insert(Arc::new(CircuitBreakerStrategy::default()));
        strategies.insert(Arc::new(FallbackStrategy::new(fallback.clone())));
        strategies.insert(Arc::new(DegradationStrategy::new(
            selector,
            DEFAULT_PROBE_SAMPLES,
        )));
        strategies.insert(Arc::new(
            QueueStrategy::new(queue, metrics.clone())?.with_sink(aggregator.clone()),
        ));
        strategies.insert(Arc::new(EmergencyStrategy));

        Ok(Self {
            registry,
            injector,
            aggregator,
            fallback,
            strategies,
            operations: Mutex::new(IndexMap::new()),
            metrics,
            failure_window: config.failure_window,
            hard_timeout: config.hard_timeout,
            escalate_to_fallback: config.escalate_to_fallback,
        })
    }

    /// Replace the strategy registered for `strategy.kind()`.
    pub fn with_strategy(mut self, strategy: Arc<dyn RecoveryStrategy>) -> Self {
        self.strategies.insert(strategy);
        self
    }

    /// Route calls for `component_id` to a real dependency instead of the injected stub.
    pub fn bind_operation(&self, component_id: &str, operation: Arc<dyn Operation>) {
        self.operations
            .lock()
            .insert(component_id.to_owned(), operation);
    }

    pub fn operation(&self, component_id: &str) -> Arc<dyn Operation> {
        if let Some(operation) = self.operations.lock().get(component_id) {
            return operation.clone();
        }
        self.injector.operation(component_id)
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn fallback(&self) -> &Arc<FallbackProvider> {
        &self.fallback
    }

    pub fn hard_timeout(&self) -> Duration {
        self.hard_timeout
    }

    /// Inject the scenario's fault, wait out the outage window, run the mapped
    /// mechanism under the hard timeout and classify the result.
    ///
    /// The fault stays layered on the target until this run ends, even when
    /// other runs on the same component finish first.
    ///
    /// Never fails: every error is folded into the returned report.
    pub async fn run_scenario(&self, scenario: &FaultScenario) -> ScenarioReport {
        let component = scenario.target_component_id.as_str();
        if let Err(err) = scenario.validate() {
            return self.rejected(scenario, err);
        }
        if let Err(err) = self.registry.mark_failed(component) {
            return self.rejected(scenario, err);
        }
        let injection = match self.injector.apply(scenario) {
            Ok(injection) => injection,
            Err(err) => return self.rejected(scenario, err),
        };
        if let Err(err) = self.registry.note_recovery_attempt(component) {
            return self.rejected(scenario, err);
        }

        let window = scenario.failure_window.unwrap_or(self.failure_window);
        if !window.is_zero() {
            sleep(window).await;
        }

        let started = Instant::now();
        let mut outcome = self.invoke_mechanism(scenario).await;
        if !outcome.success && outcome.escalatable {
            self.escalate(scenario, &mut outcome).await;
        }
        let recovery_time = started.elapsed();
        drop(injection);
        self.finish(scenario, outcome, recovery_time)
    }

    async fn invoke_mechanism(&self, scenario: &FaultScenario) -> RecoveryOutcome {
        let kind = scenario.expected_recovery_mechanism;
        let Some(strategy) = self.strategies.get(kind) else {
            return RecoveryOutcome::failure(
                kind,
                0,
                ResilienceError::configuration(format!("no strategy registered for {kind}")),
                false,
            );
        };
        let context = RecoveryContext {
            registry: self.registry.clone(),
            operation: self.operation(&scenario.target_component_id),
        };
        match timeout(self.hard_timeout, strategy.attempt_recovery(scenario, &context)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(
                    target: "faultline::resilience::orchestrator",
                    scenario = %scenario.name,
                    mechanism = %kind,
                    timeout_ms = duration_to_millis(self.hard_timeout),
                    "mechanism exceeded hard timeout",
                );
                RecoveryOutcome::failure(kind, 0, ResilienceError::Timeout(self.hard_timeout), false)
            }
        }
    }

    async fn escalate(&self, scenario: &FaultScenario, outcome: &mut RecoveryOutcome) {
        if !self.escalate_to_fallback
            || matches!(
                outcome.mechanism,
                MechanismKind::Fallback | MechanismKind::EmergencyMode
            )
        {
            return;
        }
        match self.fallback.provide(scenario).await {
            Ok(result) => {
                if let Err(err) = self
                    .registry
                    .set_status(&scenario.target_component_id, HealthStatus::Degraded)
                {
                    warn!(target: "faultline::resilience::orchestrator", error = %err, "failed to mark component degraded");
                }
                info!(
                    target: "faultline::resilience::orchestrator",
                    scenario = %scenario.name,
                    mechanism = %outcome.mechanism,
                    "mechanism gave up; escalated to fallback",
                );
                outcome.success = true;
                outcome.escalated = true;
                outcome.quality = result.quality_level;
                outcome.detail = format!(
                    "{}; escalated to {} fallback",
                    outcome.detail, result.fallback_type
                );
            }
            Err(err) => {
                warn!(
                    target: "faultline::resilience::orchestrator",
                    scenario = %scenario.name,
                    error = %err,
                    "fallback escalation failed",
                );
            }
        }
    }

    fn finish(
        &self,
        scenario: &FaultScenario,
        outcome: RecoveryOutcome,
        recovery_time: Duration,
    ) -> ScenarioReport {
        let deadline = scenario.recovery_deadline;
        let classification = match (outcome.success, recovery_time <= deadline) {
            (true, true) => Classification::RecoveredOnTime,
            (true, false) => Classification::RecoveredLate,
            (false, _) => Classification::Failed,
        };
        let recovery_time_ms = duration_to_millis(recovery_time);
        let mechanism = scenario.expected_recovery_mechanism;
        let now = Utc::now();

        let (error, severity, message) = match classification {
            Classification::RecoveredOnTime => {
                info!(
                    target: "faultline::resilience::orchestrator",
                    scenario = %scenario.name,
                    component = %scenario.target_component_id,
                    mechanism = %mechanism,
                    elapsed_ms = recovery_time_ms,
                    escalated = outcome.escalated,
                    "recovered within deadline",
                );
                (
                    None,
                    scenario.severity,
                    format!("recovered in {recovery_time_ms}ms: {}", outcome.detail),
                )
            }
            Classification::RecoveredLate => {
                warn!(
                    target: "faultline::resilience::orchestrator",
                    scenario = %scenario.name,
                    component = %scenario.target_component_id,
                    mechanism = %mechanism,
                    elapsed_ms = recovery_time_ms,
                    deadline_ms = duration_to_millis(deadline),
                    "recovered past deadline",
                );
                let err = ResilienceError::DeadlineExceeded {
                    elapsed: recovery_time,
                    deadline,
                };
                let message = err.to_string();
                (Some(err), Severity::Medium, message)
            }
            Classification::Failed => {
                error!(
                    target: "faultline::resilience::orchestrator",
                    scenario = %scenario.name,
                    component = %scenario.target_component_id,
                    mechanism = %mechanism,
                    elapsed_ms = recovery_time_ms,
                    error = %outcome.detail,
                    "recovery failed",
                );
                (
                    outcome.error.clone(),
                    scenario.severity,
                    format!("recovery failed: {}", outcome.detail),
                )
            }
        };

        let recovery_event = classification.recovered().then(|| RecoveryEvent {
            scenario_name: scenario.name.clone(),
            component_id: scenario.target_component_id.clone(),
            mechanism: mechanism.as_str().to_owned(),
            recovery_time_ms,
            classification,
            escalated: outcome.escalated,
            timestamp: now,
        });
        let failure_event = (!classification.recovered()).then(|| FailureEvent {
            scenario_name: scenario.name.clone(),
            component_id: scenario.target_component_id.clone(),
            error_kind: outcome.error_kind().to_owned(),
            message: outcome.detail.clone(),
            recovery_time_ms: Some(recovery_time_ms),
            timestamp: now,
        });

        if let Some(metrics) = &self.metrics {
            metrics.observe_scenario(mechanism.as_str(), classification, recovery_time);
        }

        let report = ScenarioReport {
            scenario_name: scenario.name.clone(),
            component_id: scenario.target_component_id.clone(),
            mechanism,
            severity: scenario.severity,
            classification,
            recovery_time,
            result: TestResult {
                test_name: scenario.name.clone(),
                success: classification == Classification::RecoveredOnTime,
                message,
                severity,
                classification,
                timestamp: now,
            },
            outcome,
            error,
            recovery_event,
            failure_event,
        };
        self.aggregator.record(&report);
        report
    }

    /// Report for a scenario that could not be started at all.
    fn rejected(&self, scenario: &FaultScenario, err: ResilienceError) -> ScenarioReport {
        warn!(
            target: "faultline::resilience::orchestrator",
            scenario = %scenario.name,
            component = %scenario.target_component_id,
            error = %err,
            "scenario rejected",
        );
        let outcome = RecoveryOutcome::failure(scenario.expected_recovery_mechanism, 0, err, false);
        self.finish(scenario, outcome, Duration::ZERO)
    }

    /// Report for a scenario whose task panicked before producing a result.
    pub fn aborted(&self, scenario: &FaultScenario, reason: impl Into<String>) -> ScenarioReport {
        let outcome = RecoveryOutcome::failure(
            scenario.expected_recovery_mechanism,
            0,
            ResilienceError::Persistent(reason.into()),
            false,
        );
        self.finish(scenario, outcome, Duration::ZERO)
    }

    /// Clear strategy and fallback state between independent runs.
    pub fn reset(&self) {
        self.strategies.reset();
        self.fallback.reset();
        self.injector.clear_all();
    }
}
