//! ---
//! fl_section: "02-resilience-fault-tolerance"
//! fl_subsection: "module"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Failure taxonomy shared by every recovery mechanism."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ResilienceError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResilienceError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("persistent failure: {0}")]
    Persistent(String),
    #[error("queue capacity of {capacity} items exceeded")]
    CapacityExceeded { capacity: usize },
    #[error("recovered after {elapsed:?}, past the {deadline:?} deadline")]
    DeadlineExceeded { elapsed: Duration, deadline: Duration },
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("component {0} is not registered")]
    NotFound(String),
    #[error("circuit for {0} is open")]
    CircuitOpen(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl ResilienceError {
    /// Whether a retry loop may try the same call again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResilienceError::Transient(_) | ResilienceError::Timeout(_))
    }

    /// Stable snake_case label used in events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ResilienceError::Transient(_) => "transient",
            ResilienceError::Persistent(_) => "persistent",
            ResilienceError::CapacityExceeded { .. } => "capacity_exceeded",
            ResilienceError::DeadlineExceeded { .. } => "deadline_exceeded",
            ResilienceError::Configuration(_) => "configuration",
            ResilienceError::NotFound(_) => "not_found",
            ResilienceError::CircuitOpen(_) => "circuit_open",
            ResilienceError::Timeout(_) => "timeout",
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        ResilienceError::Configuration(message.into())
    }
}

impl From<anyhow::Error> for ResilienceError {
    fn from(err: anyhow::Error) -> Self {
        ResilienceError::Configuration(format!("{err:#}"))
    }
}
