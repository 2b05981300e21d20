//! ---
//! fl_section: "02-resilience-fault-tolerance"
//! fl_subsection: "module"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Prometheus instrumentation for recovery mechanisms."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use faultline_metrics::SharedRegistry;
use prometheus::{self, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

use crate::circuit_breaker::CircuitState;
use crate::events::Classification;

/// Metrics published by the resilience subsystem.
#[derive(Clone)]
pub struct ResilienceMetrics {
    registry: SharedRegistry,
    scenarios_total: IntCounterVec,
    recovery_seconds: HistogramVec,
    circuit_transitions_total: IntCounterVec,
    fault_injections_total: IntCounterVec,
    queue_rejections_total: IntCounter,
    degradation_level_total: IntCounterVec,
}

impl ResilienceMetrics {
    /// Register the resilience metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let scenarios_total = IntCounterVec::new(
            Opts::new(
                "faultline_scenarios_total",
                "Fault scenarios executed, by recovery mechanism and deadline classification",
            ),
            &["mechanism", "classification"],
        )?;
        registry.register(Box::new(scenarios_total.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "faultline_recovery_seconds",
            "Time spent inside a recovery mechanism before it resolved",
        )
        .buckets(prometheus::exponential_buckets(0.001, 2.0, 16)?);
        let recovery_seconds = HistogramVec::new(histogram_opts, &["mechanism"])?;
        registry.register(Box::new(recovery_seconds.clone()))?;

        let circuit_transitions_total = IntCounterVec::new(
            Opts::new(
                "faultline_circuit_transitions_total",
                "Circuit breaker state transitions per component",
            ),
            &["component", "state"],
        )?;
        registry.register(Box::new(circuit_transitions_total.clone()))?;

        let fault_injections_total = IntCounterVec::new(
            Opts::new(
                "faultline_fault_injections_total",
                "Faults injected into dependencies by the harness",
            ),
            &["component"],
        )?;
        registry.register(Box::new(fault_injections_total.clone()))?;

        let queue_rejections_total = IntCounter::with_opts(Opts::new(
            "faultline_queue_rejections_total",
            "Items rejected because the retry queue was full",
        ))?;
        registry.register(Box::new(queue_rejections_total.clone()))?;

        let degradation_level_total = IntCounterVec::new(
            Opts::new(
                "faultline_degradation_level_total",
                "Functional tiers selected by graceful degradation",
            ),
            &["level"],
        )?;
        registry.register(Box::new(degradation_level_total.clone()))?;

        Ok(Self {
            registry,
            scenarios_total,
            recovery_seconds,
            circuit_transitions_total,
            fault_injections_total,
            queue_rejections_total,
            degradation_level_total,
        })
    }

    /// Expose the underlying shared registry for convenience.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn observe_scenario(
        &self,
        mechanism: &str,
        classification: Classification,
        recovery_time: Duration,
    ) {
        self.scenarios_total
            .with_label_values(&[mechanism, classification.as_str()])
            .inc();
        self.recovery_seconds
            .with_label_values(&[mechanism])
            .observe(recovery_time.as_secs_f64());
    }

    pub fn record_circuit_transition(&self, component: &str, state: CircuitState) {
        self.circuit_transitions_total
            .with_label_values(&[component, state.as_str()])
            .inc();
    }

    pub fn inc_fault_injection(&self, component: &str) {
        self.fault_injections_total
            .with_label_values(&[component])
            .inc();
    }

    pub fn inc_queue_rejection(&self) {
        self.queue_rejections_total.inc();
    }

    pub fn record_degradation(&self, level: &str) {
        self.degradation_level_total
            .with_label_values(&[level])
            .inc();
    }
}

impl std::fmt::Debug for ResilienceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceMetrics").finish_non_exhaustive()
    }
}
