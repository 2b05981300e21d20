//! ---
//! fl_section: "02-resilience-fault-tolerance"
//! fl_subsection: "module"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Resilience policy engine and fault-injection verification harness."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
//! Recovery mechanisms (circuit breaker, backoff retry, fallback, graceful
//! degradation, retry queue, emergency mode) and the harness that injects
//! failures into a pipeline of dependencies to verify they converge.

pub mod aggregator;
pub mod circuit_breaker;
pub mod component;
pub mod degradation;
pub mod engine;
pub mod error;
pub mod events;
pub mod fallback;
pub mod fault;
pub mod metrics;
pub mod operation;
pub mod orchestrator;
pub mod queue;
pub mod retry;
pub mod runner;
pub mod scenario;
pub mod strategy;

pub use aggregator::{GateVerdict, Metrics, MetricsAggregator, ReleaseGate, TestSummary};
pub use circuit_breaker::{Admission, CircuitBreaker, CircuitState};
pub use component::{Component, ComponentRegistry, HealthStatus};
pub use degradation::{DegradationLevel, DegradationSelector, LevelSelection, LoadProbe};
pub use engine::ResilienceEngine;
pub use error::{ResilienceError, Result};
pub use events::{Classification, FailureEvent, FailureSink, RecoveryEvent, TestResult};
pub use fallback::{FallbackProvider, FallbackResult};
pub use fault::{FaultInjector, FaultSource, InjectedOperation, InjectionGuard, SeededFaultSource};
pub use metrics::ResilienceMetrics;
pub use operation::{FnOperation, Operation, OperationContext};
pub use orchestrator::{RecoveryOrchestrator, ScenarioReport};
pub use queue::{QueueItem, RetryQueue};
pub use retry::{CallGate, GatePermit, RetryExecutor, RetryOutcome, RetryPolicy};
pub use runner::{CascadeReport, ScenarioRunner, SoakReport};
pub use scenario::{
    CascadeSequence, ErrorKind, FaultScenario, MechanismKind, ScenarioCatalog, Severity,
};
pub use strategy::{RecoveryContext, RecoveryOutcome, RecoveryStrategy};

/// Crate prelude collecting the most commonly used builders.
pub mod prelude {
    pub use super::engine::ResilienceEngine;
    pub use super::fault::{FaultSource, SeededFaultSource};
    pub use super::metrics::ResilienceMetrics;
    pub use super::operation::{Operation, OperationContext};
    pub use super::runner::ScenarioRunner;
    pub use super::scenario::{CascadeSequence, FaultScenario, MechanismKind, ScenarioCatalog};
}
