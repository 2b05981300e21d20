//! ---
//! fl_section: "02-resilience-fault-tolerance"
//! fl_subsection: "tests"
//! fl_type: "test"
//! fl_scope: "code"
//! fl_description: "End-to-end fault injection scenarios against a resilience engine."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use faultline_common::{BreakerConfig, EngineConfig, QueueConfig, RecoveryMechanismConfig};
use faultline_metrics::new_registry;
use faultline_resilience::{
    CascadeSequence, CircuitState, Classification, ComponentRegistry, ErrorKind, FaultScenario,
    HealthStatus, MechanismKind, OperationContext, QueueItem, RecoveryContext, RecoveryOutcome, RecoveryStrategy,
    ResilienceEngine, ResilienceError, ResilienceMetrics, RetryQueue, ScenarioCatalog,
    SeededFaultSource, Severity,
};
use serde_json::json;
use tokio::time::{sleep, Instant};

fn engine_config() -> EngineConfig {
    EngineConfig {
        failure_window: Duration::ZERO,
        ..EngineConfig::default()
    }
}

#[derive(Debug)]
struct DelayedRecovery(Duration);

#[async_trait]
impl RecoveryStrategy for DelayedRecovery {
    fn kind(&self) -> MechanismKind {
        MechanismKind::GracefulDegradation
    }

    async fn attempt_recovery(
        &self,
        _scenario: &FaultScenario,
        _context: &RecoveryContext,
    ) -> RecoveryOutcome {
        sleep(self.0).await;
        RecoveryOutcome::success(self.kind(), 1, 1.0, "recovered slowly")
    }
}

/// Calls the dependency once after a pause and reports what it answered.
#[derive(Debug)]
struct CallAfter(Duration);

#[async_trait]
impl RecoveryStrategy for CallAfter {
    fn kind(&self) -> MechanismKind {
        MechanismKind::GracefulDegradation
    }

    async fn attempt_recovery(
        &self,
        scenario: &FaultScenario,
        context: &RecoveryContext,
    ) -> RecoveryOutcome {
        sleep(self.0).await;
        let ctx = OperationContext::new(&scenario.target_component_id, &scenario.name);
        match context.operation.invoke(&ctx).await {
            Ok(()) => RecoveryOutcome::success(self.kind(), 1, 1.0, "dependency answered"),
            Err(err) => RecoveryOutcome::failure(self.kind(), 1, err, false),
        }
    }
}

#[derive(Debug)]
struct InstantFallback;

#[async_trait]
impl RecoveryStrategy for InstantFallback {
    fn kind(&self) -> MechanismKind {
        MechanismKind::Fallback
    }

    async fn attempt_recovery(
        &self,
        _scenario: &FaultScenario,
        _context: &RecoveryContext,
    ) -> RecoveryOutcome {
        RecoveryOutcome::success(self.kind(), 0, 0.5, "served cached response")
    }
}

#[tokio::test(start_paused = true)]
async fn breaker_opens_after_five_failures_and_rejects_sixth_call() {
    let registry = ComponentRegistry::new(
        BreakerConfig {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(1),
            half_open_trial_count: 1,
            success_threshold: 2,
        },
        None,
    )
    .unwrap();
    registry.register("remote_execution").unwrap();
    for _ in 0..5 {
        registry.apply_outcome("remote_execution", false).unwrap();
    }
    let breaker = registry.breaker("remote_execution").unwrap();
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(!breaker.should_allow());

    tokio::time::advance(Duration::from_millis(999)).await;
    assert!(!breaker.should_allow());
    tokio::time::advance(Duration::from_millis(1)).await;
    assert!(breaker.should_allow());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
}

#[test]
fn queue_with_capacity_two_rejects_third_item() {
    let queue = RetryQueue::new(
        QueueConfig {
            capacity: 2,
            ..QueueConfig::default()
        },
        None,
    )
    .unwrap();
    queue.enqueue(QueueItem::new(json!({"to": "a@example.com"}))).unwrap();
    queue.enqueue(QueueItem::new(json!({"to": "b@example.com"}))).unwrap();
    let rejected = queue.enqueue(QueueItem::new(json!({"to": "c@example.com"})));
    assert!(matches!(
        rejected,
        Err(ResilienceError::CapacityExceeded { capacity: 2 })
    ));
    assert_eq!(queue.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn slow_recovery_is_classified_late() {
    let engine = ResilienceEngine::with_strategies(
        engine_config(),
        Arc::new(SeededFaultSource::default()),
        None,
        vec![Arc::new(DelayedRecovery(Duration::from_millis(150)))],
    )
    .unwrap();
    let scenario = FaultScenario::new(
        "probe_latency",
        "network_probe",
        ErrorKind::Timeout,
        MechanismKind::GracefulDegradation,
    )
    .with_deadline(Duration::from_millis(100))
    .with_severity(Severity::Low);

    let report = engine.runner().run_single(&scenario).await;
    assert_eq!(report.classification, Classification::RecoveredLate);
    assert!(!report.result.success);
    assert_eq!(report.result.severity, Severity::Medium);

    let summary = engine.summary();
    assert_eq!(summary.late_recoveries, 1);
    assert_eq!(summary.passed, 0);
    // Late recoveries still count toward availability.
    assert_eq!(summary.availability_score, 1.0);
}

#[tokio::test(start_paused = true)]
async fn cascade_over_three_components_ends_in_emergency() {
    let engine = ResilienceEngine::from_config(engine_config()).unwrap();
    let steps = ["ai_inference", "data_store", "network_probe"]
        .into_iter()
        .map(|id| {
            FaultScenario::new(
                format!("{id}_outage"),
                id,
                ErrorKind::ServiceUnavailable,
                MechanismKind::Fallback,
            )
        })
        .collect();
    let sequence = CascadeSequence::new(steps, Duration::from_millis(50)).unwrap();

    let started = Instant::now();
    let report = engine.runner().run_cascading(&sequence).await;
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(report.steps.len(), 3);
    assert!(report.emergency.outcome.success);
    assert!(report.converged);
    for id in sequence.targets() {
        assert_eq!(
            engine.registry().get(id).unwrap().health_status,
            HealthStatus::Emergency,
            "{id} should be in emergency mode"
        );
    }
}

#[test]
fn empty_run_has_zero_availability() {
    let engine = ResilienceEngine::from_config(engine_config()).unwrap();
    let summary = engine.summary();
    assert_eq!(summary.availability_score, 0.0);
    assert_eq!(summary.components.len(), 6);
    assert_eq!(engine.verdict().exit_code(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_runs_only_touch_their_own_component() {
    let engine = ResilienceEngine::from_config(engine_config()).unwrap();
    let targets = ["ai_inference", "data_store", "data_store", "network_probe"];
    let scenarios = targets
        .iter()
        .enumerate()
        .map(|(n, id)| {
            FaultScenario::new(
                format!("concurrent-{n}"),
                *id,
                ErrorKind::InvalidResponse,
                MechanismKind::Fallback,
            )
        })
        .collect();
    let reports = engine.runner().run_concurrent(scenarios).await;
    assert_eq!(reports.len(), 4);
    assert!(reports.iter().all(|r| r.result.success));

    let store = engine.registry().get("data_store").unwrap();
    assert_eq!(store.error_count, 2);
    assert_eq!(store.recovery_attempts, 2);
    let untouched = engine.registry().get("remote_execution").unwrap();
    assert_eq!(untouched.error_count, 0);
    assert_eq!(untouched.health_status, HealthStatus::Healthy);
}

#[tokio::test(start_paused = true)]
async fn soak_drains_in_flight_runs() {
    let engine = ResilienceEngine::from_config(engine_config()).unwrap();
    let catalog = ScenarioCatalog::default_pipeline();
    let report = engine
        .runner()
        .run_soak(&catalog, Duration::from_secs(2), Duration::from_millis(200))
        .await;
    assert_eq!(report.iterations, 10);
    assert_eq!(report.reports.len(), report.iterations);
    assert!((0.0..=1.0).contains(&report.stability_score));
    assert_eq!(engine.summary().total, report.iterations);
}

#[tokio::test(start_paused = true)]
async fn default_pipeline_publishes_metrics() {
    let registry = new_registry();
    let metrics = ResilienceMetrics::new(registry.clone()).unwrap();
    let engine = ResilienceEngine::new(
        engine_config(),
        Arc::new(SeededFaultSource::new(7)),
        Some(metrics),
    )
    .unwrap();
    let catalog = engine.load_catalog().unwrap();
    let mut reports = Vec::new();
    for scenario in &catalog.scenarios {
        reports.push(engine.runner().run_single(scenario).await);
    }
    let summary = engine.summary();
    assert_eq!(summary.total, catalog.len());
    assert_eq!(summary.results.len(), catalog.len());
    assert_eq!(
        summary.recovery_events.len(),
        reports.iter().filter(|r| r.recovery_event.is_some()).count()
    );
    // Failure events also carry queue work dropped along the way.
    for event in reports.iter().filter_map(|r| r.failure_event.as_ref()) {
        assert!(summary.failure_events.contains(event));
    }

    let exposition = faultline_metrics::render(&registry).unwrap();
    assert!(exposition.contains("faultline_scenarios_total"));
    assert!(exposition.contains("faultline_recovery_seconds"));
}

#[tokio::test(start_paused = true)]
async fn engine_loads_config_and_catalog_from_disk() {
    let mut catalog_file = tempfile::NamedTempFile::new().unwrap();
    write!(
        catalog_file,
        r#"
        [[scenarios]]
        name = "mail_relay_down"
        error_kind = "connection_refused"
        target_component_id = "mailer"
        induced_failure_rate = 0.0
        expected_recovery_mechanism = "queue_and_retry"
        recovery_deadline_ms = 1000
        severity = "medium"
        "#
    )
    .unwrap();

    let mut config_file = tempfile::NamedTempFile::new().unwrap();
    write!(
        config_file,
        r#"
        components = ["mailer"]
        failure_window_ms = 0
        scenario_files = ["{}"]

        [[mechanisms]]
        type = "queue_and_retry"
        capacity = 4
        retry_interval_ms = 20
        max_age_ms = 500
        max_retries_per_item = 2
        "#,
        catalog_file.path().display()
    )
    .unwrap();

    let config = EngineConfig::from_path(config_file.path()).unwrap();
    assert!(matches!(
        config.mechanism("queue_and_retry"),
        Some(RecoveryMechanismConfig::QueueAndRetry(QueueConfig { capacity: 4, .. }))
    ));
    let engine = ResilienceEngine::from_config(config).unwrap();
    let catalog = engine.load_catalog().unwrap();
    let scenario = catalog.get("mail_relay_down").unwrap();
    let report = engine.runner().run_single(scenario).await;
    assert_eq!(report.classification, Classification::RecoveredOnTime);
    assert_eq!(
        engine.registry().get("mailer").unwrap().health_status,
        HealthStatus::Healthy
    );
}

#[tokio::test(start_paused = true)]
async fn finished_run_does_not_lift_a_concurrent_runs_fault() {
    let engine = ResilienceEngine::with_strategies(
        EngineConfig {
            escalate_to_fallback: false,
            ..engine_config()
        },
        Arc::new(SeededFaultSource::default()),
        None,
        vec![
            Arc::new(CallAfter(Duration::from_millis(50))),
            Arc::new(InstantFallback),
        ],
    )
    .unwrap();
    let slow = FaultScenario::new(
        "inference_outage",
        "ai_inference",
        ErrorKind::ServiceUnavailable,
        MechanismKind::GracefulDegradation,
    );
    let quick = FaultScenario::new(
        "inference_blip",
        "ai_inference",
        ErrorKind::Timeout,
        MechanismKind::Fallback,
    );

    let reports = engine.runner().run_concurrent(vec![slow, quick]).await;
    let report = |name: &str| {
        reports
            .iter()
            .find(|r| r.scenario_name == name)
            .unwrap()
    };
    assert!(report("inference_blip").result.success);
    // The outage is still injected when the slow run finally calls in.
    assert!(!report("inference_outage").result.success);

    let stub = engine.injector().operation("ai_inference");
    assert_eq!(stub.active_scenarios(), 0);
    assert_eq!(stub.failures(), 1);
}

#[tokio::test(start_paused = true)]
async fn dropped_queue_work_is_reported_in_the_summary() {
    let mut config = engine_config();
    config.components = vec!["mailer".into()];
    config.escalate_to_fallback = false;
    config.mechanisms = vec![RecoveryMechanismConfig::QueueAndRetry(QueueConfig {
        capacity: 4,
        retry_interval: Duration::from_millis(20),
        max_age: Duration::from_secs(1),
        max_retries_per_item: 2,
    })];
    let engine = ResilienceEngine::from_config(config).unwrap();
    let scenario = FaultScenario::new(
        "mail_relay_down",
        "mailer",
        ErrorKind::ConnectionRefused,
        MechanismKind::QueueAndRetry,
    );

    let report = engine.runner().run_single(&scenario).await;
    assert_eq!(report.classification, Classification::Failed);

    let summary = engine.summary();
    assert_eq!(summary.failure_events.len(), 2);
    let dropped: Vec<_> = summary
        .failure_events
        .iter()
        .filter(|e| Some(*e) != report.failure_event.as_ref())
        .collect();
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].component_id, "mailer");
    assert_eq!(dropped[0].error_kind, "transient");
    assert!(dropped[0].message.contains("dropped after 2 attempts"));
}

#[tokio::test(start_paused = true)]
async fn hard_timeout_during_a_trial_call_keeps_the_breaker_usable() {
    let engine = ResilienceEngine::from_config(EngineConfig {
        hard_timeout: Duration::from_millis(200),
        escalate_to_fallback: false,
        ..engine_config()
    })
    .unwrap();
    let breaker = engine.registry().breaker("ai_inference").unwrap();
    for _ in 0..5 {
        engine.registry().apply_outcome("ai_inference", false).unwrap();
    }
    assert_eq!(breaker.state(), CircuitState::Open);
    tokio::time::advance(Duration::from_secs(1)).await;

    let hung = FaultScenario::new(
        "inference_hangs",
        "ai_inference",
        ErrorKind::Timeout,
        MechanismKind::ExponentialBackoff,
    )
    .with_failure_rate(0.0)
    .with_latency(Duration::from_secs(5));
    let report = engine.runner().run_single(&hung).await;
    assert_eq!(report.classification, Classification::Failed);
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    assert_eq!(breaker.trials_in_flight(), 0);

    let healthy = FaultScenario::new(
        "inference_back",
        "ai_inference",
        ErrorKind::Timeout,
        MechanismKind::ExponentialBackoff,
    )
    .with_failure_rate(0.0);
    let report = engine.runner().run_single(&healthy).await;
    assert_eq!(report.classification, Classification::RecoveredOnTime);
    assert_eq!(breaker.trials_in_flight(), 0);
}
