//! Core workflow abstractions.
//!
//! A [`Workflow`] is a named unit of business logic with a typed JSON input.
//! Workflows stay ignorant of scheduling, retries, and persistence; the
//! orchestrator owns all of that policy and reaches workflows only through
//! the registry and bus in this crate.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Execution context handed to a running workflow.
///
/// Carries the identity of the execution record so sub-workflow invocations
/// can link back to their parent, plus a cooperative cancellation token.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// The execution record this run belongs to.
    pub metadata_id: Uuid,
    /// The execution record of the invoking workflow, for sub-workflows.
    pub parent_metadata_id: Option<Uuid>,
    /// Cooperative cancellation. Long-running steps should poll this.
    pub cancellation: CancellationToken,
}

impl RunContext {
    /// Context for a top-level run.
    pub fn root(metadata_id: Uuid) -> Self {
        Self {
            metadata_id,
            parent_metadata_id: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Context for a sub-workflow run under this one.
    pub fn child(&self, metadata_id: Uuid) -> Self {
        Self {
            metadata_id,
            parent_metadata_id: Some(self.metadata_id),
            cancellation: self.cancellation.child_token(),
        }
    }
}

/// A named workflow with a typed input and output.
///
/// The `name` is the stable lookup key used by manifests and the work queue;
/// it must be unique per deployment and should read like a fully-qualified
/// type name (e.g. `billing.InvoiceSweep`).
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    /// Input type, rehydrated from the payload envelope.
    type Input: DeserializeOwned + Send + 'static;
    /// Output type, serialized onto the execution record.
    type Output: Serialize + Send + 'static;

    /// Stable lookup key for this workflow.
    fn name(&self) -> &'static str;

    /// Discriminator recorded alongside serialized inputs.
    ///
    /// Defaults to the Rust type path of `Input`.
    fn input_type_name(&self) -> &'static str {
        std::any::type_name::<Self::Input>()
    }

    /// Execute the workflow.
    ///
    /// Errors returned here cross the bus as a structured
    /// [`WorkflowFailure`](crate::error::WorkflowFailure). Wrap step-level
    /// failures in [`StepError`] to report which step failed.
    async fn run(&self, input: Self::Input, ctx: RunContext) -> anyhow::Result<Self::Output>;
}

/// An error tagged with the workflow step that raised it.
///
/// The bus downcasts to this type when building the externalized failure, so
/// the orchestrator can persist `failure_step` without inspecting workflow
/// code.
#[derive(Debug)]
pub struct StepError {
    /// Name of the failing step.
    pub step: String,
    /// Underlying cause.
    pub source: anyhow::Error,
}

impl StepError {
    /// Wrap an error with the step that raised it.
    pub fn new(step: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self {
            step: step.into(),
            source: source.into(),
        }
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "step {} failed: {}", self.step, self.source)
    }
}

impl std::error::Error for StepError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}
