//! ---
//! fl_section: "02-resilience-fault-tolerance"
//! fl_subsection: "module"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Seedable fault source and injected operation stubs."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::error::{ResilienceError, Result};
use crate::metrics::ResilienceMetrics;
use crate::operation::{Operation, OperationContext};
use crate::scenario::{ErrorKind, FaultScenario};

/// Seed used when the configuration does not provide one.
pub const DEFAULT_SEED: u64 = 0xFA17;

/// Source of the probabilistic outcomes consumed by injected stubs and the soak runner.
pub trait FaultSource: Send + Sync + fmt::Debug {
    /// Whether a call fails given a failure rate in percent.
    fn should_fail(&self, rate_percent: f64) -> bool;
    /// Uniform index in `0..len`; returns 0 when `len` is 0.
    fn pick(&self, len: usize) -> usize;
    /// Uniform sample in `[0, 1)`.
    fn sample_unit(&self) -> f64;
}

/// [`FaultSource`] backed by a seeded `StdRng` for reproducible runs.
#[derive(Debug)]
pub struct SeededFaultSource {
    seed: u64,
    rng: Mutex<StdRng>,
}

impl SeededFaultSource {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl Default for SeededFaultSource {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}

impl FaultSource for SeededFaultSource {
    fn should_fail(&self, rate_percent: f64) -> bool {
        if rate_percent <= 0.0 {
            return false;
        }
        if rate_percent >= 100.0 {
            return true;
        }
        self.rng.lock().gen_range(0.0..100.0) < rate_percent
    }

    fn pick(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        self.rng.lock().gen_range(0..len)
    }

    fn sample_unit(&self) -> f64 {
        self.rng.lock().gen::<f64>()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Injection {
    rate: f64,
    kind: Option<ErrorKind>,
    latency: Option<Duration>,
}

/// Faults active on one stub: a manual layer plus one layer per running scenario.
#[derive(Debug, Default)]
struct Injections {
    manual: Injection,
    scoped: IndexMap<u64, Injection>,
    next_token: u64,
}

impl Injections {
    fn layers(&self) -> impl Iterator<Item = &Injection> {
        std::iter::once(&self.manual).chain(self.scoped.values())
    }
}

/// Stub dependency whose calls fail at an adjustable rate.
///
/// Every active fault layer fails a call independently, so overlapping
/// scenarios on one component compound instead of overwriting each other.
#[derive(Debug)]
pub struct InjectedOperation {
    component_id: String,
    source: Arc<dyn FaultSource>,
    injections: Mutex<Injections>,
    calls: AtomicU64,
    failures: AtomicU64,
    metrics: Option<ResilienceMetrics>,
}

impl InjectedOperation {
    fn new(
        component_id: &str,
        source: Arc<dyn FaultSource>,
        metrics: Option<ResilienceMetrics>,
    ) -> Self {
        Self {
            component_id: component_id.to_owned(),
            source,
            injections: Mutex::new(Injections::default()),
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    /// Highest induced failure rate among the active faults, in percent.
    pub fn failure_rate(&self) -> f64 {
        self.injections
            .lock()
            .layers()
            .filter(|layer| layer.kind.is_some())
            .map(|layer| layer.rate)
            .fold(0.0, f64::max)
    }

    /// Scenario faults currently layered on this stub.
    pub fn active_scenarios(&self) -> usize {
        self.injections.lock().scoped.len()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn push_layer(&self, injection: Injection) -> u64 {
        let mut injections = self.injections.lock();
        let token = injections.next_token;
        injections.next_token += 1;
        injections.scoped.insert(token, injection);
        token
    }
}

#[async_trait]
impl Operation for InjectedOperation {
    fn name(&self) -> &str {
        &self.component_id
    }

    async fn invoke(&self, context: &OperationContext) -> Result<()> {
        let layers: Vec<Injection> = self.injections.lock().layers().copied().collect();
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(latency) = layers.iter().filter_map(|layer| layer.latency).max() {
            sleep(latency).await;
        }
        let failed = layers.iter().find_map(|layer| {
            let kind = layer.kind?;
            self.source.should_fail(layer.rate).then_some(kind)
        });
        let Some(kind) = failed else {
            return Ok(());
        };
        self.failures.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.inc_fault_injection(&self.component_id);
        }
        debug!(
            target: "faultline::resilience::fault",
            component = %self.component_id,
            scenario = %context.scenario,
            attempt = context.attempt,
            kind = %kind,
            "injected failure",
        );
        Err(kind.to_error(&self.component_id))
    }
}

/// A scenario's fault on one component, lifted when the guard is dropped.
#[derive(Debug)]
#[must_use = "the fault is lifted as soon as the guard is dropped"]
pub struct InjectionGuard {
    operation: Arc<InjectedOperation>,
    token: u64,
    scenario: String,
}

impl InjectionGuard {
    pub fn component_id(&self) -> &str {
        self.operation.component_id()
    }
}

impl Drop for InjectionGuard {
    fn drop(&mut self) {
        self.operation
            .injections
            .lock()
            .scoped
            .shift_remove(&self.token);
        debug!(
            target: "faultline::resilience::fault",
            component = %self.operation.component_id,
            scenario = %self.scenario,
            "scenario fault lifted",
        );
    }
}

/// Owns one [`InjectedOperation`] per component.
#[derive(Debug)]
pub struct FaultInjector {
    source: Arc<dyn FaultSource>,
    metrics: Option<ResilienceMetrics>,
    operations: Mutex<IndexMap<String, Arc<InjectedOperation>>>,
}

impl FaultInjector {
    pub fn new(source: Arc<dyn FaultSource>, metrics: Option<ResilienceMetrics>) -> Self {
        Self {
            source,
            metrics,
            operations: Mutex::new(IndexMap::new()),
        }
    }

    pub fn source(&self) -> Arc<dyn FaultSource> {
        self.source.clone()
    }

    /// The stub for `component_id`, created healthy on first use.
    pub fn operation(&self, component_id: &str) -> Arc<InjectedOperation> {
        let mut operations = self.operations.lock();
        operations
            .entry(component_id.to_owned())
            .or_insert_with(|| {
                Arc::new(InjectedOperation::new(
                    component_id,
                    self.source.clone(),
                    self.metrics.clone(),
                ))
            })
            .clone()
    }

    /// Make calls to `component_id` fail with `kind` at `rate_percent` until
    /// [`FaultInjector::clear`].
    pub fn inject(&self, component_id: &str, rate_percent: f64, kind: ErrorKind) -> Result<()> {
        check_rate(component_id, rate_percent)?;
        let operation = self.operation(component_id);
        let mut injections = operation.injections.lock();
        injections.manual.rate = rate_percent;
        injections.manual.kind = Some(kind);
        info!(
            target: "faultline::resilience::fault",
            component = component_id,
            rate = rate_percent,
            kind = %kind,
            "fault injected",
        );
        Ok(())
    }

    /// Layer a scenario's rate, kind and latency onto its target for as long
    /// as the returned guard lives.
    pub fn apply(&self, scenario: &FaultScenario) -> Result<InjectionGuard> {
        let component_id = scenario.target_component_id.as_str();
        check_rate(component_id, scenario.induced_failure_rate)?;
        let operation = self.operation(component_id);
        let token = operation.push_layer(Injection {
            rate: scenario.induced_failure_rate,
            kind: Some(scenario.error_kind),
            latency: scenario.latency,
        });
        info!(
            target: "faultline::resilience::fault",
            component = component_id,
            scenario = %scenario.name,
            rate = scenario.induced_failure_rate,
            kind = %scenario.error_kind,
            active = operation.active_scenarios(),
            "scenario fault injected",
        );
        Ok(InjectionGuard {
            operation,
            token,
            scenario: scenario.name.clone(),
        })
    }

    /// Simulated latency on the manual layer.
    pub fn set_latency(&self, component_id: &str, latency: Option<Duration>) {
        self.operation(component_id).injections.lock().manual.latency = latency;
    }

    /// Stop the manual fault on `component_id`. Scenario faults stay until
    /// their guards drop.
    pub fn clear(&self, component_id: &str) {
        if let Some(operation) = self.operations.lock().get(component_id) {
            operation.injections.lock().manual = Injection::default();
        }
    }

    pub fn clear_all(&self) {
        for operation in self.operations.lock().values() {
            operation.injections.lock().manual = Injection::default();
        }
    }
}

fn check_rate(component_id: &str, rate_percent: f64) -> Result<()> {
    if (0.0..=100.0).contains(&rate_percent) {
        return Ok(());
    }
    Err(ResilienceError::configuration(format!(
        "failure rate {rate_percent} for {component_id} must be within [0, 100]"
    )))
}
