//! ---
//! fl_section: "03-observability"
//! fl_subsection: "module"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Metrics registry sharing and export utilities."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{Registry, TextEncoder};
use tracing::debug;

/// Shared registry type used across the workspace.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Encode every metric family in the registry using the Prometheus text format.
pub fn render(registry: &SharedRegistry) -> Result<String> {
    let families = registry.gather();
    debug!(families = families.len(), "rendering metrics registry");
    TextEncoder::new()
        .encode_to_string(&families)
        .context("failed to encode metrics")
}

/// Names of the metric families currently registered.
pub fn family_names(registry: &SharedRegistry) -> Vec<String> {
    registry
        .gather()
        .iter()
        .map(|family| family.get_name().to_string())
        .collect()
}

pub use prometheus;
