//! ---
//! fl_section: "02-resilience-fault-tolerance"
//! fl_subsection: "module"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Single, concurrent, cascading and soak scenario drivers."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use faultline_common::time::ratio;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::component::Component;
use crate::fault::FaultSource;
use crate::orchestrator::{RecoveryOrchestrator, ScenarioReport};
use crate::scenario::{CascadeSequence, ErrorKind, FaultScenario, MechanismKind, ScenarioCatalog, Severity};

/// Outcome of a cascading run.
#[derive(Debug, Clone)]
pub struct CascadeReport {
    pub steps: Vec<ScenarioReport>,
    pub emergency: ScenarioReport,
    /// Every component ended in a serving state (possibly degraded or emergency).
    pub converged: bool,
    pub components: Vec<Component>,
}

/// Outcome of a soak run.
#[derive(Debug, Clone)]
pub struct SoakReport {
    pub iterations: usize,
    pub recoveries: usize,
    /// `recoveries / iterations`, 0 when nothing ran.
    pub stability_score: f64,
    pub elapsed: Duration,
    pub reports: Vec<ScenarioReport>,
}

/// Drives scenarios through a [`RecoveryOrchestrator`].
#[derive(Debug, Clone)]
pub struct ScenarioRunner {
    orchestrator: Arc<RecoveryOrchestrator>,
    source: Arc<dyn FaultSource>,
}

impl ScenarioRunner {
    pub fn new(orchestrator: Arc<RecoveryOrchestrator>, source: Arc<dyn FaultSource>) -> Self {
        Self {
            orchestrator,
            source,
        }
    }

    pub fn orchestrator(&self) -> &Arc<RecoveryOrchestrator> {
        &self.orchestrator
    }

    pub async fn run_single(&self, scenario: &FaultScenario) -> ScenarioReport {
        self.orchestrator.run_scenario(scenario).await
    }

    /// Run every scenario as its own task and wait for all of them.
    pub async fn run_concurrent(&self, scenarios: Vec<FaultScenario>) -> Vec<ScenarioReport> {
        let handles: Vec<_> = scenarios
            .into_iter()
            .map(|scenario| {
                let handle = self.spawn(scenario.clone());
                (scenario, handle)
            })
            .collect();
        self.collect(handles).await
    }

    /// Fail each step's component in order, `inter_failure_delay` apart, then
    /// engage emergency mode and check that the system settled.
    pub async fn run_cascading(&self, sequence: &CascadeSequence) -> CascadeReport {
        let mut steps = Vec::with_capacity(sequence.steps.len());
        for (index, step) in sequence.steps.iter().enumerate() {
            if index > 0 && !sequence.inter_failure_delay.is_zero() {
                sleep(sequence.inter_failure_delay).await;
            }
            info!(
                target: "faultline::resilience::runner",
                step = index + 1,
                scenario = %step.name,
                component = %step.target_component_id,
                "cascade step",
            );
            steps.push(self.orchestrator.run_scenario(step).await);
        }

        if !sequence.inter_failure_delay.is_zero() {
            sleep(sequence.inter_failure_delay).await;
        }
        let emergency = self.orchestrator.run_scenario(&emergency_step(sequence)).await;

        let components = self.orchestrator.registry().snapshot();
        let converged = components.iter().all(|c| c.health_status.is_stable());
        if converged {
            info!(
                target: "faultline::resilience::runner",
                components = components.len(),
                "cascade converged",
            );
        } else {
            error!(
                target: "faultline::resilience::runner",
                "cascade left components failed",
            );
        }
        CascadeReport {
            steps,
            emergency,
            converged,
            components,
        }
    }

    /// Start a randomly picked catalog scenario every `tick` until `duration`
    /// elapses, then wait for the runs already in flight.
    pub async fn run_soak(
        &self,
        catalog: &ScenarioCatalog,
        duration: Duration,
        tick: Duration,
    ) -> SoakReport {
        let started = Instant::now();
        if catalog.is_empty() || tick.is_zero() {
            warn!(
                target: "faultline::resilience::runner",
                "soak run skipped: empty catalog or zero interval",
            );
            return SoakReport {
                iterations: 0,
                recoveries: 0,
                stability_score: 0.0,
                elapsed: Duration::ZERO,
                reports: Vec::new(),
            };
        }

        let deadline = started + duration;
        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut handles = Vec::new();
        loop {
            ticker.tick().await;
            if Instant::now() >= deadline {
                break;
            }
            let scenario = catalog.scenarios[self.source.pick(catalog.len())].clone();
            let handle = self.spawn(scenario.clone());
            handles.push((scenario, handle));
        }

        info!(
            target: "faultline::resilience::runner",
            in_flight = handles.len(),
            "soak deadline reached; draining in-flight runs",
        );
        let reports = self.collect(handles).await;
        let recoveries = reports.iter().filter(|r| r.recovered()).count();
        let stability_score = ratio(recoveries as u64, reports.len() as u64);
        info!(
            target: "faultline::resilience::runner",
            iterations = reports.len(),
            recoveries,
            stability_score,
            "soak run complete",
        );
        SoakReport {
            iterations: reports.len(),
            recoveries,
            stability_score,
            elapsed: started.elapsed(),
            reports,
        }
    }

    fn spawn(&self, scenario: FaultScenario) -> JoinHandle<ScenarioReport> {
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_scenario(&scenario).await })
    }

    async fn collect(
        &self,
        handles: Vec<(FaultScenario, JoinHandle<ScenarioReport>)>,
    ) -> Vec<ScenarioReport> {
        let (scenarios, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        join_all(handles)
            .await
            .into_iter()
            .zip(scenarios)
            .map(|(joined, scenario)| match joined {
                Ok(report) => report,
                Err(err) => {
                    error!(
                        target: "faultline::resilience::runner",
                        scenario = %scenario.name,
                        error = %err,
                        "scenario task aborted",
                    );
                    self.orchestrator
                        .aborted(&scenario, format!("scenario task aborted: {err}"))
                }
            })
            .collect()
    }
}

fn emergency_step(sequence: &CascadeSequence) -> FaultScenario {
    let deadline = sequence
        .steps
        .iter()
        .map(|step| step.recovery_deadline)
        .max()
        .unwrap_or(Duration::from_secs(1));
    let target = sequence
        .steps
        .last()
        .map(|step| step.target_component_id.clone())
        .unwrap_or_default();
    FaultScenario::new(
        "cascade_emergency",
        target,
        ErrorKind::ResourceExhausted,
        MechanismKind::EmergencyMode,
    )
    .with_description("Cascade culminates in last-resort safe mode")
    .with_deadline(deadline)
    .with_severity(Severity::Critical)
    .with_failure_window(Duration::ZERO)
}
