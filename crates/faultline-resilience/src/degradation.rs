//! ---
//! fl_section: "02-resilience-fault-tolerance"
//! fl_subsection: "module"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Functional tier selection under load."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use faultline_common::DegradationConfig;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{ResilienceError, Result};
use crate::metrics::ResilienceMetrics;
use crate::operation::{Operation, OperationContext};

/// One functional tier together with the features it still offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DegradationLevel {
    pub name: String,
    /// Position in the configured list, 0 being the richest tier.
    pub index: usize,
    pub features: Vec<String>,
}

impl fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Measures how well the system performs when running at a given tier.
#[async_trait]
pub trait LoadProbe: Send + Sync {
    /// Performance score in `[0, 1]`; values outside are clamped.
    async fn measure(&self, level: &DegradationLevel) -> f64;
}

/// Probe that samples a dependency and discounts its failures by the load a tier sheds.
///
/// A tier offering `k` of `m` features carries `k / m` of the full load, so its
/// score is `1 - failure_fraction * k / m`.
#[derive(Debug)]
pub struct OperationProbe {
    operation: Arc<dyn Operation>,
    context: OperationContext,
    samples: u32,
    total_features: usize,
    total_levels: usize,
}

impl OperationProbe {
    pub fn new(
        operation: Arc<dyn Operation>,
        context: OperationContext,
        samples: u32,
        selector: &DegradationSelector,
    ) -> Self {
        Self {
            operation,
            context,
            samples: samples.max(1),
            total_features: selector.total_features(),
            total_levels: selector.levels().len(),
        }
    }

    fn load_factor(&self, level: &DegradationLevel) -> f64 {
        if self.total_features > 0 {
            level.features.len() as f64 / self.total_features as f64
        } else {
            (self.total_levels - level.index) as f64 / self.total_levels as f64
        }
    }
}

#[async_trait]
impl LoadProbe for OperationProbe {
    async fn measure(&self, level: &DegradationLevel) -> f64 {
        let mut failures = 0u32;
        for sample in 1..=self.samples {
            if self
                .operation
                .invoke(&self.context.with_attempt(sample))
                .await
                .is_err()
            {
                failures += 1;
            }
        }
        let failure_fraction = f64::from(failures) / f64::from(self.samples);
        1.0 - failure_fraction * self.load_factor(level)
    }
}

/// Result of probing every tier.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelSelection {
    pub level: DegradationLevel,
    pub score: f64,
    /// False when no tier met the threshold and the minimal one was forced.
    pub accepted: bool,
}

/// Picks the richest tier whose measured performance meets the acceptance threshold.
#[derive(Debug)]
pub struct DegradationSelector {
    levels: Vec<DegradationLevel>,
    acceptance_threshold: f64,
    metrics: Option<ResilienceMetrics>,
    last_level: Mutex<Option<String>>,
}

impl DegradationSelector {
    pub fn new(config: &DegradationConfig, metrics: Option<ResilienceMetrics>) -> Result<Self> {
        config.validate()?;
        let total = config.levels.len();
        let features = &config.feature_priority;
        let levels = config
            .levels
            .iter()
            .enumerate()
            .map(|(index, name)| {
                // Tiers accumulate features from the most essential one upward;
                // the richest tier offers every feature.
                let rank = total - index;
                let count = (features.len() * rank).div_ceil(total);
                DegradationLevel {
                    name: name.clone(),
                    index,
                    features: features[..count].to_vec(),
                }
            })
            .collect();
        Ok(Self {
            levels,
            acceptance_threshold: config.acceptance_threshold,
            metrics,
            last_level: Mutex::new(None),
        })
    }

    /// Levels ordered richest to minimal.
    pub fn levels(&self) -> &[DegradationLevel] {
        &self.levels
    }

    pub fn acceptance_threshold(&self) -> f64 {
        self.acceptance_threshold
    }

    /// The last configured level, used as the emergency tier.
    pub fn minimal(&self) -> &DegradationLevel {
        // Validation guarantees at least one level.
        &self.levels[self.levels.len() - 1]
    }

    pub fn total_features(&self) -> usize {
        self.levels.first().map_or(0, |level| level.features.len())
    }

    pub fn available_features(&self, level: &str) -> Result<&[String]> {
        self.levels
            .iter()
            .find(|l| l.name == level)
            .map(|l| l.features.as_slice())
            .ok_or_else(|| {
                ResilienceError::configuration(format!("unknown degradation level '{level}'"))
            })
    }

    pub fn current_level(&self) -> Option<String> {
        self.last_level.lock().clone()
    }

    /// Walk levels richest to minimal and return the first acceptable one,
    /// or the minimal level when none qualifies.
    pub async fn select_level(&self, probe: &dyn LoadProbe) -> DegradationLevel {
        self.select(probe).await.level
    }

    /// Like [`DegradationSelector::select_level`], also reporting whether the
    /// chosen level actually met the threshold.
    pub async fn select(&self, probe: &dyn LoadProbe) -> LevelSelection {
        let mut last_score = 0.0;
        for level in &self.levels {
            let score = probe.measure(level).await.clamp(0.0, 1.0);
            tracing::debug!(
                target: "faultline::resilience::degradation",
                level = %level,
                score,
                threshold = self.acceptance_threshold,
                "probed degradation level",
            );
            if score >= self.acceptance_threshold {
                self.note_level(level);
                return LevelSelection {
                    level: level.clone(),
                    score,
                    accepted: true,
                };
            }
            last_score = score;
        }
        let level = self.minimal().clone();
        self.note_level(&level);
        LevelSelection {
            level,
            score: last_score,
            accepted: false,
        }
    }

    fn note_level(&self, level: &DegradationLevel) {
        let mut last = self.last_level.lock();
        if last.as_deref() != Some(level.name.as_str()) {
            tracing::info!(
                target: "faultline::resilience::degradation",
                from = last.as_deref().unwrap_or("none"),
                to = %level,
                features = ?level.features,
                "degradation level transition",
            );
            *last = Some(level.name.clone());
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_degradation(&level.name);
        }
    }

    pub fn reset(&self) {
        *self.last_level.lock() = None;
    }
}
