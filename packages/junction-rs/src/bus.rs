//! The workflow bus: dispatch-by-name over the registry.
//!
//! The bus is the execution entry point the task server calls into. It is
//! deliberately thin: resolve the name, decode the envelope, run the
//! workflow, and contain panics so a misbehaving workflow can never take
//! down the host loop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tracing::error;

use crate::core::RunContext;
use crate::error::{BusError, WorkflowFailure};
use crate::registry::{SharedWorkflowRegistry, WorkflowRegistry};

/// Dispatch interface consumed by task-server hosts.
///
/// Implementations resolve the workflow by name and run its composed steps;
/// callers treat the execution as opaque and only observe the structured
/// result.
#[async_trait]
pub trait WorkflowBus: Send + Sync {
    /// Run the named workflow with an enveloped input.
    ///
    /// `input_type_name` is the out-of-band discriminator recorded next to
    /// the payload; the embedded `$type` key is the fallback.
    async fn run_by_name(
        &self,
        name: &str,
        input: Value,
        input_type_name: Option<String>,
        ctx: RunContext,
    ) -> Result<Value, BusError>;

    /// Whether the bus can resolve `name` at all.
    fn resolves(&self, name: &str) -> bool;
}

/// Registry-backed bus implementation.
pub struct RegistryBus {
    registry: SharedWorkflowRegistry,
}

impl RegistryBus {
    /// Wrap a shared registry.
    pub fn new(registry: SharedWorkflowRegistry) -> Self {
        Self { registry }
    }

    /// Build from an owned registry.
    pub fn from_registry(registry: WorkflowRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    /// The underlying registry.
    pub fn registry(&self) -> &SharedWorkflowRegistry {
        &self.registry
    }
}

#[async_trait]
impl WorkflowBus for RegistryBus {
    async fn run_by_name(
        &self,
        name: &str,
        input: Value,
        input_type_name: Option<String>,
        ctx: RunContext,
    ) -> Result<Value, BusError> {
        let fut = self.registry.run(name, input, input_type_name, ctx);
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let detail = panic_message(&panic);
                error!(workflow = %name, panic = %detail, "workflow panicked");
                Err(BusError::Failure(WorkflowFailure::from_reason(format!(
                    "workflow panicked: {detail}"
                ))))
            }
        }
    }

    fn resolves(&self, name: &str) -> bool {
        self.registry.contains(name)
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
