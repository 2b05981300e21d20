//! ---
//! fl_section: "01-core-functionality"
//! fl_subsection: "module"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Shared primitives for the Faultline workspace."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
//! Shared primitives for the Faultline workspace: engine configuration,
//! logging bootstrap and small time helpers.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    BackoffConfig, BreakerConfig, DegradationConfig, EngineConfig, FallbackConfig, GateConfig,
    LoggingConfig, QueueConfig, RecoveryMechanismConfig, DEFAULT_COMPONENTS,
};
pub use logging::{init, init_tracing, LogFormat};
