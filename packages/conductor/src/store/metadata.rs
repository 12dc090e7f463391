//! Metadata: the immutable record of one execution attempt.
//!
//! Exactly one row exists per attempt. The only legal mutation is the
//! forward state closure (`state → end_time → failure*`); terminal rows
//! never change again. Everything else about an attempt (payloads, timing,
//! failure detail) is captured at transition time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::kernel::ids::external_id;

/// Well-known `failure_reason` values written by the core itself.
pub mod failure_reason {
    /// The stuck-job reaper's verdict.
    pub const TIMEOUT: &str = "Timeout";
    /// The input payload could not be rehydrated at dispatch.
    pub const SERIALIZATION_ERROR: &str = "SerializationError";
    /// The task server refused the unit of work.
    pub const ENQUEUE_FAILED: &str = "EnqueueFailed";
    /// The workflow name resolved to nothing.
    pub const UNKNOWN_WORKFLOW: &str = "UnknownWorkflow";
}

/// Execution states. The transition graph is a DAG rooted at `Pending` with
/// sinks `{Completed, Failed, Cancelled}`; there are no backward edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "workflow_state", rename_all = "snake_case")]
pub enum WorkflowState {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    /// Stable symbolic mapping for external consumers.
    pub fn as_i16(&self) -> i16 {
        match self {
            WorkflowState::Pending => 0,
            WorkflowState::InProgress => 1,
            WorkflowState::Completed => 2,
            WorkflowState::Failed => 3,
            WorkflowState::Cancelled => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether `self → next` is a legal forward edge.
    pub fn can_transition_to(&self, next: WorkflowState) -> bool {
        matches!(
            (self, next),
            (
                WorkflowState::Pending,
                WorkflowState::InProgress | WorkflowState::Failed | WorkflowState::Cancelled
            ) | (
                WorkflowState::InProgress,
                WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
            )
        )
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkflowState::Pending => "Pending",
            WorkflowState::InProgress => "InProgress",
            WorkflowState::Completed => "Completed",
            WorkflowState::Failed => "Failed",
            WorkflowState::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

/// Failure detail persisted when an attempt ends in `Failed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub step: Option<String>,
    pub exception: Option<String>,
    pub reason: Option<String>,
    pub stack_trace: Option<String>,
}

impl FailureDetail {
    pub fn with_reason(reason: &str) -> Self {
        Self {
            reason: Some(reason.to_string()),
            ..Self::default()
        }
    }
}

impl From<junction::WorkflowFailure> for FailureDetail {
    fn from(failure: junction::WorkflowFailure) -> Self {
        Self {
            step: failure.step,
            exception: Some(failure.exception),
            reason: Some(failure.reason),
            stack_trace: failure.stack_trace,
        }
    }
}

/// One execution attempt.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Metadata {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    #[builder(default = crate::kernel::ids::external_id())]
    pub external_id: String,

    #[builder(default, setter(strip_option))]
    pub manifest_id: Option<Uuid>,

    /// Sub-workflow linkage; a pure back-reference, never a cycle.
    #[builder(default, setter(strip_option))]
    pub parent_id: Option<Uuid>,

    /// The work-queue row this attempt was dispatched from, when any.
    #[builder(default, setter(strip_option))]
    pub work_queue_id: Option<Uuid>,

    /// Workflow type name.
    pub name: String,

    /// Host identity that created this attempt.
    pub executor: String,

    #[builder(default)]
    pub workflow_state: WorkflowState,

    // Lifecycle
    #[builder(default, setter(strip_option))]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub start_time: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub end_time: Option<DateTime<Utc>>,

    // Failure fields, set iff state = Failed
    #[builder(default, setter(strip_option))]
    pub failure_step: Option<String>,
    #[builder(default, setter(strip_option))]
    pub failure_exception: Option<String>,
    #[builder(default, setter(strip_option))]
    pub failure_reason: Option<String>,
    #[builder(default, setter(strip_option))]
    pub stack_trace: Option<String>,

    // Payloads
    #[builder(default, setter(strip_option))]
    pub input_json: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub output_json: Option<serde_json::Value>,
}

impl Metadata {
    /// An attempt born `Failed`, used when dispatch itself fails (payload
    /// rehydration, unknown workflow). Counts toward the retry budget.
    pub fn born_failed(
        name: &str,
        executor: &str,
        manifest_id: Option<Uuid>,
        work_queue_id: Option<Uuid>,
        input_json: Option<serde_json::Value>,
        detail: FailureDetail,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            external_id: external_id(),
            manifest_id,
            parent_id: None,
            work_queue_id,
            name: name.to_string(),
            executor: executor.to_string(),
            workflow_state: WorkflowState::Failed,
            scheduled_time: None,
            start_time: now,
            end_time: Some(now),
            failure_step: detail.step,
            failure_exception: detail.exception,
            failure_reason: detail.reason,
            stack_trace: detail.stack_trace,
            input_json,
            output_json: None,
        }
    }

    pub fn apply_failure(&mut self, detail: FailureDetail) {
        self.failure_step = detail.step;
        self.failure_exception = detail.exception;
        self.failure_reason = detail.reason;
        self.stack_trace = detail.stack_trace;
    }
}

/// Fields a transition may set. Everything absent stays untouched.
#[derive(Debug, Clone, Default)]
pub struct MetadataPatch {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub failure: Option<FailureDetail>,
    pub output_json: Option<serde_json::Value>,
}

impl MetadataPatch {
    /// Patch for entering `InProgress`.
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            start_time: Some(at),
            ..Self::default()
        }
    }

    /// Patch for a successful completion.
    pub fn completed(at: DateTime<Utc>, output_json: Option<serde_json::Value>) -> Self {
        Self {
            end_time: Some(at),
            output_json,
            ..Self::default()
        }
    }

    /// Patch for a failure.
    pub fn failed(at: DateTime<Utc>, detail: FailureDetail) -> Self {
        Self {
            end_time: Some(at),
            failure: Some(detail),
            ..Self::default()
        }
    }

    /// Patch for a cancellation.
    pub fn cancelled(at: DateTime<Utc>) -> Self {
        Self {
            end_time: Some(at),
            ..Self::default()
        }
    }

    /// Check the closure invariants against the target state:
    /// `end_time` set iff terminal, failure detail set iff `Failed`.
    pub fn validate_for(&self, to: WorkflowState) -> Result<(), String> {
        if to.is_terminal() && self.end_time.is_none() {
            return Err(format!("transition to {to} requires end_time"));
        }
        if !to.is_terminal() && self.end_time.is_some() {
            return Err(format!("transition to {to} must not set end_time"));
        }
        if self.failure.is_some() && to != WorkflowState::Failed {
            return Err(format!("failure detail is only legal on Failed, not {to}"));
        }
        if to == WorkflowState::Failed && self.failure.is_none() {
            return Err("transition to Failed requires failure detail".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_mapping_is_stable() {
        assert_eq!(WorkflowState::Pending.as_i16(), 0);
        assert_eq!(WorkflowState::InProgress.as_i16(), 1);
        assert_eq!(WorkflowState::Completed.as_i16(), 2);
        assert_eq!(WorkflowState::Failed.as_i16(), 3);
        assert_eq!(WorkflowState::Cancelled.as_i16(), 4);
    }

    #[test]
    fn transition_graph_has_no_backward_edges() {
        use WorkflowState::*;
        let all = [Pending, InProgress, Completed, Failed, Cancelled];

        for terminal in [Completed, Failed, Cancelled] {
            for next in all {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
        assert!(!InProgress.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn forward_edges_are_legal() {
        use WorkflowState::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(Pending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Failed));
        assert!(InProgress.can_transition_to(Cancelled));
    }

    #[test]
    fn patch_validation_enforces_failure_closure() {
        let now = Utc::now();

        assert!(MetadataPatch::failed(now, FailureDetail::with_reason("x"))
            .validate_for(WorkflowState::Failed)
            .is_ok());

        // Failure detail on a completion is illegal.
        let bad = MetadataPatch {
            end_time: Some(now),
            failure: Some(FailureDetail::with_reason("x")),
            ..MetadataPatch::default()
        };
        assert!(bad.validate_for(WorkflowState::Completed).is_err());

        // Terminal transition without end_time is illegal.
        let missing_end = MetadataPatch {
            failure: Some(FailureDetail::with_reason("x")),
            ..MetadataPatch::default()
        };
        assert!(missing_end.validate_for(WorkflowState::Failed).is_err());

        // Failed without detail is illegal.
        assert!(MetadataPatch::cancelled(now)
            .validate_for(WorkflowState::Failed)
            .is_err());
    }

    #[test]
    fn born_failed_is_terminal_with_reason() {
        let row = Metadata::born_failed(
            "reports.Nightly",
            "test-host",
            None,
            None,
            None,
            FailureDetail::with_reason(failure_reason::SERIALIZATION_ERROR),
            Utc::now(),
        );
        assert_eq!(row.workflow_state, WorkflowState::Failed);
        assert!(row.end_time.is_some());
        assert_eq!(
            row.failure_reason.as_deref(),
            Some(failure_reason::SERIALIZATION_ERROR)
        );
    }
}
