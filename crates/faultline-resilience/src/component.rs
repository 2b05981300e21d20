//! ---
//! fl_section: "02-resilience-fault-tolerance"
//! fl_subsection: "module"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Registry of dependency health and circuit state."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use faultline_common::BreakerConfig;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{Admission, CircuitBreaker, CircuitState};
use crate::error::{ResilienceError, Result};
use crate::metrics::ResilienceMetrics;
use crate::retry::CallGate;

/// Health reported for a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failed,
    /// Last-resort safe mode; sticky until reset or explicitly overridden.
    Emergency,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Failed => "failed",
            HealthStatus::Emergency => "emergency",
        }
    }

    /// Whether the dependency is serving requests, possibly in reduced form.
    pub fn is_stable(&self) -> bool {
        !matches!(self, HealthStatus::Failed)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a registered dependency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Component {
    pub id: String,
    pub health_status: HealthStatus,
    pub error_count: u64,
    pub circuit_state: CircuitState,
    pub recovery_attempts: u64,
    pub last_health_check_at: Option<DateTime<Utc>>,
}

impl Component {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            health_status: HealthStatus::Healthy,
            error_count: 0,
            circuit_state: CircuitState::Closed,
            recovery_attempts: 0,
            last_health_check_at: None,
        }
    }
}

#[derive(Debug)]
struct ComponentEntry {
    component: Component,
    breaker: Arc<CircuitBreaker>,
}

impl ComponentEntry {
    fn snapshot(&self) -> Component {
        let mut component = self.component.clone();
        component.circuit_state = self.breaker.state();
        component
    }
}

/// Tracks per-dependency health and owns one circuit breaker per component.
///
/// All mutation is serialised through a single lock so concurrent scenarios
/// targeting the same component cannot interleave partial updates.
#[derive(Debug)]
pub struct ComponentRegistry {
    breaker_config: BreakerConfig,
    inner: Mutex<IndexMap<String, ComponentEntry>>,
    metrics: Option<ResilienceMetrics>,
}

impl ComponentRegistry {
    pub fn new(breaker_config: BreakerConfig, metrics: Option<ResilienceMetrics>) -> Result<Self> {
        breaker_config.validate()?;
        Ok(Self {
            breaker_config,
            inner: Mutex::new(IndexMap::new()),
            metrics,
        })
    }

    /// Register a component in Healthy/Closed state. Re-registering is a no-op.
    pub fn register(&self, id: &str) -> Result<Component> {
        if id.trim().is_empty() {
            return Err(ResilienceError::configuration("component id must not be blank"));
        }
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get(id) {
            return Ok(entry.snapshot());
        }
        let breaker = Arc::new(CircuitBreaker::new(id, self.breaker_config)?);
        let entry = ComponentEntry {
            component: Component::new(id),
            breaker,
        };
        let snapshot = entry.snapshot();
        inner.insert(id.to_owned(), entry);
        debug!(target: "faultline::resilience::registry", component = id, "registered component");
        Ok(snapshot)
    }

    pub fn get(&self, id: &str) -> Result<Component> {
        let inner = self.inner.lock();
        inner
            .get(id)
            .map(ComponentEntry::snapshot)
            .ok_or_else(|| ResilienceError::NotFound(id.to_owned()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.lock().keys().cloned().collect()
    }

    pub fn breaker(&self, id: &str) -> Result<Arc<CircuitBreaker>> {
        let inner = self.inner.lock();
        inner
            .get(id)
            .map(|entry| entry.breaker.clone())
            .ok_or_else(|| ResilienceError::NotFound(id.to_owned()))
    }

    /// Feed a call result to the component's breaker and update its health.
    pub fn apply_outcome(&self, id: &str, success: bool) -> Result<Component> {
        let mut inner = self.inner.lock();
        let entry = inner
            .get_mut(id)
            .ok_or_else(|| ResilienceError::NotFound(id.to_owned()))?;
        let transition = entry.breaker.on_result(success);
        let component = &mut entry.component;
        if success {
            if matches!(
                component.health_status,
                HealthStatus::Failed | HealthStatus::Degraded
            ) {
                component.health_status = HealthStatus::Healthy;
            }
        } else {
            component.error_count += 1;
            if component.health_status != HealthStatus::Emergency {
                component.health_status = match entry.breaker.state() {
                    CircuitState::Closed => HealthStatus::Degraded,
                    CircuitState::Open | CircuitState::HalfOpen => HealthStatus::Failed,
                };
            }
        }
        if let Some(state) = transition {
            if let Some(metrics) = &self.metrics {
                metrics.record_circuit_transition(id, state);
            }
        }
        Ok(entry.snapshot())
    }

    /// Fault injection: mark the component Failed and count the error.
    pub fn mark_failed(&self, id: &str) -> Result<Component> {
        let mut inner = self.inner.lock();
        let entry = inner
            .get_mut(id)
            .ok_or_else(|| ResilienceError::NotFound(id.to_owned()))?;
        entry.component.health_status = HealthStatus::Failed;
        entry.component.error_count += 1;
        warn!(target: "faultline::resilience::registry", component = id, "component marked failed");
        Ok(entry.snapshot())
    }

    /// Explicit status override used by recovery mechanisms.
    pub fn set_status(&self, id: &str, status: HealthStatus) -> Result<Component> {
        let mut inner = self.inner.lock();
        let entry = inner
            .get_mut(id)
            .ok_or_else(|| ResilienceError::NotFound(id.to_owned()))?;
        if entry.component.health_status != status {
            info!(
                target: "faultline::resilience::registry",
                component = id,
                from = %entry.component.health_status,
                to = %status,
                "component status override",
            );
        }
        entry.component.health_status = status;
        Ok(entry.snapshot())
    }

    /// Force every registered component into `status`.
    pub fn set_all(&self, status: HealthStatus) -> Vec<Component> {
        let mut inner = self.inner.lock();
        inner
            .values_mut()
            .map(|entry| {
                entry.component.health_status = status;
                entry.snapshot()
            })
            .collect()
    }

    /// Count a recovery attempt against the component.
    pub fn note_recovery_attempt(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .get_mut(id)
            .ok_or_else(|| ResilienceError::NotFound(id.to_owned()))?;
        entry.component.recovery_attempts += 1;
        Ok(())
    }

    /// Stamp `last_health_check_at` and return the current view.
    pub fn health_check(&self, id: &str) -> Result<Component> {
        let mut inner = self.inner.lock();
        let entry = inner
            .get_mut(id)
            .ok_or_else(|| ResilienceError::NotFound(id.to_owned()))?;
        entry.component.last_health_check_at = Some(Utc::now());
        Ok(entry.snapshot())
    }

    /// All components in registration order.
    pub fn snapshot(&self) -> Vec<Component> {
        self.inner
            .lock()
            .values()
            .map(ComponentEntry::snapshot)
            .collect()
    }

    /// Restore every component to Healthy/Closed between independent runs.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        for (id, entry) in inner.iter_mut() {
            entry.component = Component::new(id);
            entry.breaker.reset();
        }
    }

    /// A [`CallGate`] that routes results through [`ComponentRegistry::apply_outcome`].
    pub fn gate<'a>(&'a self, id: &'a str) -> Result<ComponentGate<'a>> {
        let breaker = self.breaker(id)?;
        Ok(ComponentGate {
            registry: self,
            id,
            breaker,
        })
    }
}

/// Gate binding a retry loop to one registered component.
#[derive(Debug)]
pub struct ComponentGate<'a> {
    registry: &'a ComponentRegistry,
    id: &'a str,
    breaker: Arc<CircuitBreaker>,
}

impl CallGate for ComponentGate<'_> {
    fn admit(&self) -> Option<Admission> {
        self.breaker.admit()
    }

    fn is_rejecting(&self) -> bool {
        self.breaker.is_rejecting()
    }

    fn abandon(&self, admission: Admission) {
        self.breaker.abandon(admission);
    }

    fn record(&self, success: bool) {
        if let Err(err) = self.registry.apply_outcome(self.id, success) {
            warn!(target: "faultline::resilience::registry", component = self.id, error = %err, "failed to record outcome");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry() -> ComponentRegistry {
        ComponentRegistry::new(
            BreakerConfig {
                failure_threshold: 2,
                open_timeout: Duration::from_millis(50),
                half_open_trial_count: 1,
                success_threshold: 1,
            },
            None,
        )
        .unwrap()
    }

    #[test]
    fn register_starts_healthy_and_closed() {
        let registry = registry();
        let component = registry.register("ai_inference").unwrap();
        assert_eq!(component.health_status, HealthStatus::Healthy);
        assert_eq!(component.circuit_state, CircuitState::Closed);
        assert_eq!(component.error_count, 0);
        assert!(matches!(
            registry.get("missing"),
            Err(ResilienceError::NotFound(id)) if id == "missing"
        ));
    }

    #[tokio::test]
    async fn failures_degrade_then_fail_component() {
        let registry = registry();
        registry.register("data_store").unwrap();
        let first = registry.apply_outcome("data_store", false).unwrap();
        assert_eq!(first.health_status, HealthStatus::Degraded);
        let second = registry.apply_outcome("data_store", false).unwrap();
        assert_eq!(second.health_status, HealthStatus::Failed);
        assert_eq!(second.circuit_state, CircuitState::Open);
        assert_eq!(second.error_count, 2);
    }

    #[tokio::test]
    async fn emergency_is_sticky_until_reset() {
        let registry = registry();
        registry.register("a").unwrap();
        registry.register("b").unwrap();
        let all = registry.set_all(HealthStatus::Emergency);
        assert!(all.iter().all(|c| c.health_status == HealthStatus::Emergency));
        let after = registry.apply_outcome("a", false).unwrap();
        assert_eq!(after.health_status, HealthStatus::Emergency);
        registry.reset();
        assert!(registry
            .snapshot()
            .iter()
            .all(|c| c.health_status == HealthStatus::Healthy && c.error_count == 0));
    }

    #[test]
    fn health_check_stamps_timestamp() {
        let registry = registry();
        registry.register("network_probe").unwrap();
        assert!(registry.get("network_probe").unwrap().last_health_check_at.is_none());
        let checked = registry.health_check("network_probe").unwrap();
        assert!(checked.last_health_check_at.is_some());
    }

    #[test]
    fn snapshot_preserves_registration_order() {
        let registry = registry();
        for id in ["c", "a", "b"] {
            registry.register(id).unwrap();
        }
        assert_eq!(registry.ids(), vec!["c", "a", "b"]);
        assert!(registry.register(" ").is_err());
    }
}
