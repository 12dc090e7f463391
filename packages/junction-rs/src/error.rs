//! Structured error types for the workflow bus.
//!
//! `DecodeError` covers every way a payload can fail to rehydrate, so callers
//! can distinguish "the workflow name is wrong" from "the JSON is wrong".
//! `WorkflowFailure` is the only externalized execution error.
//!
//! # The Error Boundary Rule
//!
//! > **No `anyhow::Error` ever crosses the bus boundary.**
//!
//! - `anyhow` is internal transport (ergonomic for workflow bodies)
//! - `WorkflowFailure` is the only externalized error (structured for the
//!   orchestrator, which persists its fields verbatim and never inspects
//!   workflow code)

use std::fmt;

/// Failure modes when rehydrating a workflow input payload.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The workflow name has no registration.
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// The payload declared a type that does not match the registered input.
    #[error("payload type mismatch for {workflow}: expected {expected}, found {found}")]
    TypeMismatch {
        workflow: String,
        expected: String,
        found: String,
    },

    /// The payload is not a JSON object and cannot carry a discriminator.
    #[error("payload for {workflow} is not a JSON object")]
    NonObjectPayload { workflow: String },

    /// The payload shape does not deserialize into the registered input type.
    #[error("invalid payload for {workflow}: {source}")]
    InvalidPayload {
        workflow: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// True when the same payload can never decode, no matter how often it
    /// is retried.
    pub fn is_permanent(&self) -> bool {
        // Every decode failure is permanent: the bytes are already wrong.
        true
    }
}

/// The structured failure a workflow reports across the bus boundary.
///
/// The orchestrator persists these fields onto the execution record and
/// applies its retry policy; it never unwraps the underlying error chain.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WorkflowFailure {
    /// The step that failed, when the workflow reported one.
    pub step: Option<String>,
    /// The error type or short classification.
    pub exception: String,
    /// Human-readable root cause.
    pub reason: String,
    /// Formatted error chain, when available.
    pub stack_trace: Option<String>,
}

impl WorkflowFailure {
    /// Build a failure from an `anyhow` error, capturing the step when the
    /// workflow raised a [`StepError`](crate::core::StepError).
    pub fn from_error(error: &anyhow::Error) -> Self {
        let step = error
            .downcast_ref::<crate::core::StepError>()
            .map(|e| e.step.clone());

        let chain: Vec<String> = error.chain().map(|c| c.to_string()).collect();
        let reason = chain.last().cloned().unwrap_or_else(|| error.to_string());

        Self {
            step,
            exception: error.to_string(),
            reason,
            stack_trace: if chain.len() > 1 {
                Some(chain.join("\n  caused by: "))
            } else {
                None
            },
        }
    }

    /// A failure with just a reason, used for panics and host-side faults.
    pub fn from_reason(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            step: None,
            exception: reason.clone(),
            reason,
            stack_trace: None,
        }
    }
}

impl fmt::Display for WorkflowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step {
            Some(step) => write!(f, "workflow failed at step {step}: {}", self.reason),
            None => write!(f, "workflow failed: {}", self.reason),
        }
    }
}

impl std::error::Error for WorkflowFailure {}

/// Errors surfaced by [`WorkflowBus::run_by_name`](crate::bus::WorkflowBus).
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The payload could not be rehydrated.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The workflow ran and reported a failure.
    #[error(transparent)]
    Failure(WorkflowFailure),
}

/// Errors surfaced by the task-server contract.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// The task server refused the unit of work.
    #[error("task server rejected the work unit: {0}")]
    Rejected(String),

    /// The task server is draining and accepts no new work.
    #[error("task server is shutting down")]
    ShuttingDown,
}
