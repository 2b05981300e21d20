//! ---
//! fl_section: "02-resilience-fault-tolerance"
//! fl_subsection: "module"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Bounded-latency degraded responses."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use faultline_common::time::ratio;
use faultline_common::FallbackConfig;
use serde::Serialize;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::{ResilienceError, Result};
use crate::operation::{Operation, OperationContext};
use crate::scenario::FaultScenario;

pub const FALLBACK_SOURCE: &str = "fallback";

/// Response served in place of the failed dependency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackResult {
    #[serde(rename = "type")]
    pub fallback_type: String,
    pub quality_level: f64,
    pub timestamp: DateTime<Utc>,
    pub source: &'static str,
}

/// Serves degraded responses and tracks how often it managed to.
#[derive(Debug)]
pub struct FallbackProvider {
    config: FallbackConfig,
    secondary: Option<Arc<dyn Operation>>,
    attempts: AtomicU64,
    successes: AtomicU64,
}

impl FallbackProvider {
    pub fn new(config: FallbackConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            secondary: None,
            attempts: AtomicU64::new(0),
            successes: AtomicU64::new(0),
        })
    }

    /// Consult `secondary` (a cache or replica) instead of answering with static defaults.
    pub fn with_secondary(mut self, secondary: Arc<dyn Operation>) -> Self {
        self.secondary = Some(secondary);
        self
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    /// Produce a fallback for `scenario` within the latency budget.
    pub async fn provide(&self, scenario: &FaultScenario) -> Result<FallbackResult> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let fallback_type = match &self.secondary {
            Some(secondary) => {
                let context =
                    OperationContext::new(&scenario.target_component_id, &scenario.name);
                match timeout(self.config.latency_budget, secondary.invoke(&context)).await {
                    Ok(Ok(())) => "secondary_source",
                    Ok(Err(err)) => {
                        warn!(
                            target: "faultline::resilience::fallback",
                            scenario = %scenario.name,
                            component = %scenario.target_component_id,
                            error = %err,
                            "fallback source failed",
                        );
                        return Err(err);
                    }
                    Err(_) => {
                        warn!(
                            target: "faultline::resilience::fallback",
                            scenario = %scenario.name,
                            budget_ms = self.config.latency_budget.as_millis() as u64,
                            "fallback exceeded latency budget",
                        );
                        return Err(ResilienceError::Timeout(self.config.latency_budget));
                    }
                }
            }
            None => "static_default",
        };
        self.successes.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "faultline::resilience::fallback",
            scenario = %scenario.name,
            component = %scenario.target_component_id,
            fallback_type,
            quality = self.config.quality_level,
            "serving fallback response",
        );
        Ok(FallbackResult {
            fallback_type: fallback_type.to_owned(),
            quality_level: self.config.quality_level,
            timestamp: Utc::now(),
            source: FALLBACK_SOURCE,
        })
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// `successes / attempts`; 1.0 before any attempt.
    pub fn success_rate(&self) -> f64 {
        let attempts = self.attempts();
        if attempts == 0 {
            return 1.0;
        }
        ratio(self.successes(), attempts)
    }

    pub fn meets_target(&self) -> bool {
        self.success_rate() >= self.config.availability_target
    }

    /// Fails when the observed success rate is below the availability target.
    pub fn check(&self) -> Result<()> {
        if self.meets_target() {
            Ok(())
        } else {
            Err(ResilienceError::Persistent(format!(
                "fallback success rate {:.3} below target {:.3}",
                self.success_rate(),
                self.config.availability_target
            )))
        }
    }

    pub fn reset(&self) {
        self.attempts.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
    }
}
