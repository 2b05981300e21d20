//! ---
//! fl_section: "02-resilience-fault-tolerance"
//! fl_subsection: "module"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Per-run engine context wiring registry, orchestrator and runner."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::sync::Arc;

use faultline_common::EngineConfig;
use tracing::info;

use crate::aggregator::{GateVerdict, MetricsAggregator, ReleaseGate, TestSummary};
use crate::component::ComponentRegistry;
use crate::error::Result;
use crate::fault::{FaultInjector, FaultSource, SeededFaultSource};
use crate::metrics::ResilienceMetrics;
use crate::orchestrator::RecoveryOrchestrator;
use crate::runner::ScenarioRunner;
use crate::scenario::ScenarioCatalog;
use crate::strategy::RecoveryStrategy;

/// Isolated resilience context; several engines can coexist in one process.
#[derive(Debug)]
pub struct ResilienceEngine {
    config: EngineConfig,
    registry: Arc<ComponentRegistry>,
    aggregator: Arc<MetricsAggregator>,
    injector: Arc<FaultInjector>,
    orchestrator: Arc<RecoveryOrchestrator>,
    runner: ScenarioRunner,
    gate: ReleaseGate,
    metrics: Option<ResilienceMetrics>,
}

impl ResilienceEngine {
    pub fn new(
        config: EngineConfig,
        fault_source: Arc<dyn FaultSource>,
        metrics: Option<ResilienceMetrics>,
    ) -> Result<Self> {
        Self::with_strategies(config, fault_source, metrics, Vec::new())
    }

    /// Like [`ResilienceEngine::new`], replacing the built-in strategy of each
    /// given strategy's kind.
    pub fn with_strategies(
        config: EngineConfig,
        fault_source: Arc<dyn FaultSource>,
        metrics: Option<ResilienceMetrics>,
        strategies: Vec<Arc<dyn RecoveryStrategy>>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(ComponentRegistry::new(config.breaker(), metrics.clone())?);
        for id in &config.components {
            registry.register(id)?;
        }
        let aggregator = Arc::new(MetricsAggregator::new());
        let injector = Arc::new(FaultInjector::new(fault_source.clone(), metrics.clone()));
        let orchestrator = strategies.into_iter().fold(
            RecoveryOrchestrator::from_config(
                &config,
                registry.clone(),
                injector.clone(),
                aggregator.clone(),
                metrics.clone(),
            )?,
            RecoveryOrchestrator::with_strategy,
        );
        let orchestrator = Arc::new(orchestrator);
        let runner = ScenarioRunner::new(orchestrator.clone(), fault_source);
        let gate = ReleaseGate::from_config(&config.gate);
        info!(
            target: "faultline::resilience::engine",
            components = config.components.len(),
            seed = config.seed,
            "resilience engine ready",
        );
        Ok(Self {
            config,
            registry,
            aggregator,
            injector,
            orchestrator,
            runner,
            gate,
            metrics,
        })
    }

    /// Engine with a [`SeededFaultSource`] seeded from the configuration and no metrics.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let source = Arc::new(SeededFaultSource::new(config.seed));
        Self::new(config, source, None)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn aggregator(&self) -> &Arc<MetricsAggregator> {
        &self.aggregator
    }

    pub fn injector(&self) -> &Arc<FaultInjector> {
        &self.injector
    }

    pub fn orchestrator(&self) -> &Arc<RecoveryOrchestrator> {
        &self.orchestrator
    }

    pub fn runner(&self) -> &ScenarioRunner {
        &self.runner
    }

    pub fn metrics(&self) -> Option<&ResilienceMetrics> {
        self.metrics.as_ref()
    }

    /// Scenarios from the configured files, or the default pipeline when none are set.
    pub fn load_catalog(&self) -> anyhow::Result<ScenarioCatalog> {
        if self.config.scenario_files.is_empty() {
            return Ok(ScenarioCatalog::default_pipeline());
        }
        ScenarioCatalog::from_files(self.config.scenario_files.as_slice())
    }

    /// Restore every component to Healthy/Closed and clear recorded results.
    pub fn reset(&self) {
        self.registry.reset();
        self.aggregator.reset();
        self.orchestrator.reset();
        info!(target: "faultline::resilience::engine", "engine state reset");
    }

    pub fn summary(&self) -> TestSummary {
        self.aggregator.summarize(self.registry.snapshot())
    }

    pub fn verdict(&self) -> GateVerdict {
        self.gate.evaluate(&self.summary())
    }
}
