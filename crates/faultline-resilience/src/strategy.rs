//! ---
//! fl_section: "02-resilience-fault-tolerance"
//! fl_subsection: "module"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Recovery strategies dispatched by mechanism kind."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use faultline_common::QueueConfig;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::sleep;
use tracing::{error, info};

use crate::circuit_breaker::CircuitState;
use crate::component::{ComponentRegistry, HealthStatus};
use crate::degradation::{DegradationSelector, OperationProbe};
use crate::error::{ResilienceError, Result};
use crate::events::FailureSink;
use crate::fallback::FallbackProvider;
use crate::metrics::ResilienceMetrics;
use crate::operation::{Operation, OperationContext};
use crate::queue::{QueueItem, RetryQueue, Settlement};
use crate::retry::{CallGate, GatePermit, RetryExecutor, RetryOutcome};
use crate::scenario::{FaultScenario, MechanismKind};

/// Quality reported by emergency mode: the safe mode is assumed to hold.
pub const EMERGENCY_SAFETY_MARGIN: f64 = 0.95;

/// Open-timeout cycles the circuit breaker strategy waits through before giving up.
pub const DEFAULT_TRIAL_CYCLES: u32 = 3;

/// Samples taken per tier by the degradation probe.
pub const DEFAULT_PROBE_SAMPLES: u32 = 10;

/// What a strategy needs to act on one component.
#[derive(Debug, Clone)]
pub struct RecoveryContext {
    pub registry: Arc<ComponentRegistry>,
    pub operation: Arc<dyn Operation>,
}

impl RecoveryContext {
    fn operation_context(&self, scenario: &FaultScenario) -> OperationContext {
        OperationContext::new(&scenario.target_component_id, &scenario.name)
    }
}

/// Resolution of a single mechanism invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryOutcome {
    pub mechanism: MechanismKind,
    pub success: bool,
    pub attempts: u32,
    /// Relative quality of the service left running (1.0 = full service).
    pub quality: f64,
    pub detail: String,
    pub error: Option<ResilienceError>,
    /// The mechanism ran out of attempts or hit a non-retryable error.
    pub escalatable: bool,
    /// A fallback response was served after this mechanism gave up.
    pub escalated: bool,
}

impl RecoveryOutcome {
    pub fn success(
        mechanism: MechanismKind,
        attempts: u32,
        quality: f64,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            mechanism,
            success: true,
            attempts,
            quality,
            detail: detail.into(),
            error: None,
            escalatable: false,
            escalated: false,
        }
    }

    pub fn failure(
        mechanism: MechanismKind,
        attempts: u32,
        error: ResilienceError,
        escalatable: bool,
    ) -> Self {
        Self {
            mechanism,
            success: false,
            attempts,
            quality: 0.0,
            detail: error.to_string(),
            error: Some(error),
            escalatable,
            escalated: false,
        }
    }

    pub fn error_kind(&self) -> &'static str {
        self.error.as_ref().map_or("none", ResilienceError::kind)
    }
}

/// A recovery mechanism the orchestrator can dispatch a scenario to.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync + fmt::Debug {
    fn kind(&self) -> MechanismKind;

    async fn attempt_recovery(
        &self,
        scenario: &FaultScenario,
        context: &RecoveryContext,
    ) -> RecoveryOutcome;

    /// Drop per-run state between independent runs.
    fn reset(&self) {}
}

/// Retry the dependency with exponential backoff through its circuit breaker.
#[derive(Debug)]
pub struct BackoffStrategy {
    executor: RetryExecutor,
}

impl BackoffStrategy {
    pub fn new(executor: RetryExecutor) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl RecoveryStrategy for BackoffStrategy {
    fn kind(&self) -> MechanismKind {
        MechanismKind::ExponentialBackoff
    }

    async fn attempt_recovery(
        &self,
        scenario: &FaultScenario,
        context: &RecoveryContext,
    ) -> RecoveryOutcome {
        let gate = match context.registry.gate(&scenario.target_component_id) {
            Ok(gate) => gate,
            Err(err) => return RecoveryOutcome::failure(self.kind(), 0, err, false),
        };
        let outcome = self
            .executor
            .execute(
                context.operation.as_ref(),
                &context.operation_context(scenario),
                Some(&gate as &dyn CallGate),
            )
            .await;
        match outcome {
            RetryOutcome::Success { attempts, .. } => RecoveryOutcome::success(
                self.kind(),
                attempts,
                1.0,
                format!("recovered after {attempts} attempts"),
            ),
            RetryOutcome::Failure(failure) => {
                let error = failure.last_error.unwrap_or_else(|| {
                    ResilienceError::Transient(format!(
                        "{} did not recover",
                        scenario.target_component_id
                    ))
                });
                RecoveryOutcome::failure(
                    self.kind(),
                    failure.attempts,
                    error,
                    failure.exhausted || failure.non_retryable,
                )
            }
        }
    }
}

/// Drive calls through the component's breaker until it settles closed.
#[derive(Debug)]
pub struct CircuitBreakerStrategy {
    max_trial_cycles: u32,
}

impl CircuitBreakerStrategy {
    pub fn new(max_trial_cycles: u32) -> Self {
        Self {
            max_trial_cycles: max_trial_cycles.max(1),
        }
    }
}

impl Default for CircuitBreakerStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_TRIAL_CYCLES)
    }
}

#[async_trait]
impl RecoveryStrategy for CircuitBreakerStrategy {
    fn kind(&self) -> MechanismKind {
        MechanismKind::CircuitBreaker
    }

    async fn attempt_recovery(
        &self,
        scenario: &FaultScenario,
        context: &RecoveryContext,
    ) -> RecoveryOutcome {
        let component = scenario.target_component_id.as_str();
        let (gate, breaker) = match (
            context.registry.gate(component),
            context.registry.breaker(component),
        ) {
            (Ok(gate), Ok(breaker)) => (gate, breaker),
            (Err(err), _) | (_, Err(err)) => {
                return RecoveryOutcome::failure(self.kind(), 0, err, false)
            }
        };
        let op_context = context.operation_context(scenario);
        let mut calls = 0;
        let mut open_cycles = 0;

        loop {
            let Some(permit) = GatePermit::acquire(&gate) else {
                if breaker.state() == CircuitState::Open {
                    open_cycles += 1;
                    if open_cycles > self.max_trial_cycles {
                        return RecoveryOutcome::failure(
                            self.kind(),
                            calls,
                            ResilienceError::CircuitOpen(component.to_owned()),
                            true,
                        );
                    }
                }
                // Half-open slots held by concurrent runs are polled briefly.
                let wait = breaker.remaining_open().max(Duration::from_millis(1));
                sleep(wait).await;
                continue;
            };

            calls += 1;
            let result = context
                .operation
                .invoke(&op_context.with_attempt(calls))
                .await;
            permit.record(result.is_ok());
            match result {
                Ok(()) if breaker.state() == CircuitState::Closed => {
                    return RecoveryOutcome::success(
                        self.kind(),
                        calls,
                        1.0,
                        format!("circuit closed after {calls} calls"),
                    );
                }
                Ok(()) => {}
                Err(err) if !err.is_retryable() => {
                    return RecoveryOutcome::failure(self.kind(), calls, err, true);
                }
                Err(_) => {}
            }
        }
    }
}

/// Serve a degraded response instead of the dependency.
#[derive(Debug)]
pub struct FallbackStrategy {
    provider: Arc<FallbackProvider>,
}

impl FallbackStrategy {
    pub fn new(provider: Arc<FallbackProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl RecoveryStrategy for FallbackStrategy {
    fn kind(&self) -> MechanismKind {
        MechanismKind::Fallback
    }

    async fn attempt_recovery(
        &self,
        scenario: &FaultScenario,
        context: &RecoveryContext,
    ) -> RecoveryOutcome {
        match self.provider.provide(scenario).await {
            Ok(result) => {
                if let Err(err) = context
                    .registry
                    .set_status(&scenario.target_component_id, HealthStatus::Degraded)
                {
                    return RecoveryOutcome::failure(self.kind(), 1, err, false);
                }
                RecoveryOutcome::success(
                    self.kind(),
                    1,
                    result.quality_level,
                    format!("served {} fallback", result.fallback_type),
                )
            }
            Err(err) => RecoveryOutcome::failure(self.kind(), 1, err, false),
        }
    }

    fn reset(&self) {
        self.provider.reset();
    }
}

/// Shed features until the dependency performs acceptably.
#[derive(Debug)]
pub struct DegradationStrategy {
    selector: Arc<DegradationSelector>,
    samples: u32,
}

impl DegradationStrategy {
    pub fn new(selector: Arc<DegradationSelector>, samples: u32) -> Self {
        Self { selector, samples }
    }
}

#[async_trait]
impl RecoveryStrategy for DegradationStrategy {
    fn kind(&self) -> MechanismKind {
        MechanismKind::GracefulDegradation
    }

    async fn attempt_recovery(
        &self,
        scenario: &FaultScenario,
        context: &RecoveryContext,
    ) -> RecoveryOutcome {
        let probe = OperationProbe::new(
            context.operation.clone(),
            context.operation_context(scenario),
            self.samples,
            &self.selector,
        );
        let selection = self.selector.select(&probe).await;
        let levels = self.selector.levels().len() as u32;
        if !selection.accepted {
            return RecoveryOutcome::failure(
                self.kind(),
                levels,
                ResilienceError::Persistent(format!(
                    "no degradation level reached the acceptance threshold (last score {:.2})",
                    selection.score
                )),
                true,
            );
        }
        let status = if selection.level.index == 0 {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        if let Err(err) = context
            .registry
            .set_status(&scenario.target_component_id, status)
        {
            return RecoveryOutcome::failure(self.kind(), selection.level.index as u32 + 1, err, false);
        }
        let total = self.selector.total_features();
        let quality = if total == 0 {
            1.0 - selection.level.index as f64 / f64::from(levels)
        } else {
            selection.level.features.len() as f64 / total as f64
        };
        RecoveryOutcome::success(
            self.kind(),
            selection.level.index as u32 + 1,
            quality,
            format!("running at level {}", selection.level),
        )
    }

    fn reset(&self) {
        self.selector.reset();
    }
}

/// Defer the failed work onto a per-component retry queue and drain it.
#[derive(Debug)]
pub struct QueueStrategy {
    config: QueueConfig,
    metrics: Option<ResilienceMetrics>,
    sink: Option<Arc<dyn FailureSink>>,
    queues: Mutex<IndexMap<String, Arc<RetryQueue>>>,
}

impl QueueStrategy {
    pub fn new(config: QueueConfig, metrics: Option<ResilienceMetrics>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            metrics,
            sink: None,
            queues: Mutex::new(IndexMap::new()),
        })
    }

    /// Forward items dropped by any queue this strategy creates to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn FailureSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// The queue holding deferred work for `component_id`.
    pub fn queue(&self, component_id: &str) -> Result<Arc<RetryQueue>> {
        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get(component_id) {
            return Ok(queue.clone());
        }
        let mut queue = RetryQueue::new(self.config, self.metrics.clone())?;
        if let Some(sink) = &self.sink {
            queue = queue.with_sink(sink.clone());
        }
        let queue = Arc::new(queue);
        queues.insert(component_id.to_owned(), queue.clone());
        Ok(queue)
    }
}

#[async_trait]
impl RecoveryStrategy for QueueStrategy {
    fn kind(&self) -> MechanismKind {
        MechanismKind::QueueAndRetry
    }

    async fn attempt_recovery(
        &self,
        scenario: &FaultScenario,
        context: &RecoveryContext,
    ) -> RecoveryOutcome {
        let component = scenario.target_component_id.as_str();
        let queue = match self.queue(component) {
            Ok(queue) => queue,
            Err(err) => return RecoveryOutcome::failure(self.kind(), 0, err, false),
        };
        let item = QueueItem::new(json!({
            "scenario": scenario.name,
            "component": component,
            "error_kind": scenario.error_kind.as_str(),
        }));
        let id = match queue.enqueue(item) {
            Ok(id) => id,
            Err(err) => return RecoveryOutcome::failure(self.kind(), 0, err, false),
        };
        let op_context = context.operation_context(scenario);

        // Another run draining the same queue may still hold our item.
        let settlement = loop {
            queue.drain(context.operation.as_ref(), &op_context).await;
            if let Some(settlement) = queue.take_settled(&id) {
                break settlement;
            }
            sleep(self.config.retry_interval).await;
        };

        match settlement {
            Settlement::Completed { attempts } => {
                if let Err(err) = context.registry.apply_outcome(component, true) {
                    return RecoveryOutcome::failure(self.kind(), attempts, err, false);
                }
                RecoveryOutcome::success(
                    self.kind(),
                    attempts,
                    1.0,
                    format!("queued work delivered after {attempts} attempts"),
                )
            }
            Settlement::Dropped(event) => RecoveryOutcome::failure(
                self.kind(),
                self.config.max_retries_per_item,
                ResilienceError::Transient(event.message),
                true,
            ),
        }
    }

    fn reset(&self) {
        for queue in self.queues.lock().values() {
            queue.clear();
        }
    }
}

/// Last-resort safe mode: every registered component enters `Emergency`.
#[derive(Debug, Default)]
pub struct EmergencyStrategy;

#[async_trait]
impl RecoveryStrategy for EmergencyStrategy {
    fn kind(&self) -> MechanismKind {
        MechanismKind::EmergencyMode
    }

    async fn attempt_recovery(
        &self,
        scenario: &FaultScenario,
        context: &RecoveryContext,
    ) -> RecoveryOutcome {
        let components = context.registry.set_all(HealthStatus::Emergency);
        error!(
            target: "faultline::resilience::strategy",
            scenario = %scenario.name,
            trigger = %scenario.target_component_id,
            components = components.len(),
            "emergency mode engaged",
        );
        RecoveryOutcome::success(
            self.kind(),
            1,
            EMERGENCY_SAFETY_MARGIN,
            format!("{} components in emergency mode", components.len()),
        )
    }
}

/// Strategy objects keyed by the mechanism they implement.
#[derive(Debug, Default)]
pub struct StrategyMap {
    strategies: IndexMap<MechanismKind, Arc<dyn RecoveryStrategy>>,
}

impl StrategyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `strategy` under its own kind, replacing any previous one.
    pub fn insert(&mut self, strategy: Arc<dyn RecoveryStrategy>) {
        let kind = strategy.kind();
        if self.strategies.insert(kind, strategy).is_some() {
            info!(target: "faultline::resilience::strategy", mechanism = %kind, "strategy replaced");
        }
    }

    pub fn get(&self, kind: MechanismKind) -> Option<Arc<dyn RecoveryStrategy>> {
        self.strategies.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<MechanismKind> {
        self.strategies.keys().copied().collect()
    }

    pub fn reset(&self) {
        for strategy in self.strategies.values() {
            strategy.reset();
        }
    }
}
