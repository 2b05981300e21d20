//! ---
//! fl_section: "02-resilience-fault-tolerance"
//! fl_subsection: "module"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Collaborator boundary for calls into external dependencies."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
use std::fmt;
use std::future::Future;

use async_trait::async_trait;

use crate::error::Result;

/// Call-site information handed to every operation invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    pub component_id: String,
    pub scenario: String,
    /// 1-indexed attempt number within the current mechanism.
    pub attempt: u32,
}

impl OperationContext {
    pub fn new(component_id: impl Into<String>, scenario: impl Into<String>) -> Self {
        Self {
            component_id: component_id.into(),
            scenario: scenario.into(),
            attempt: 1,
        }
    }

    pub fn with_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }
}

/// A single call into a dependency (inference, remote execution, storage, ...).
///
/// Implementations report [`crate::ResilienceError::Transient`] for failures worth
/// retrying and [`crate::ResilienceError::Persistent`] for everything else.
#[async_trait]
pub trait Operation: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    async fn invoke(&self, context: &OperationContext) -> Result<()>;
}

/// Adapter turning an async closure into an [`Operation`].
pub struct FnOperation<F> {
    name: String,
    call: F,
}

impl<F> FnOperation<F> {
    pub fn new(name: impl Into<String>, call: F) -> Self {
        Self {
            name: name.into(),
            call,
        }
    }
}

impl<F> fmt::Debug for FnOperation<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOperation")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> Operation for FnOperation<F>
where
    F: Fn(OperationContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, context: &OperationContext) -> Result<()> {
        (self.call)(context.clone()).await
    }
}
