//! The task-server contract.
//!
//! A task server is the background host that eventually runs a dispatched
//! unit of work. The contract is intentionally weak: enqueued work
//! eventually runs on some worker, recurring work fires at roughly the
//! configured cadence, and cancellation is best-effort. The task server is
//! **not** authoritative about execution state — the metadata record is.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use uuid::Uuid;

use crate::error::EnqueueError;

/// The unit of work handed to a task server.
///
/// Pairs the execution-record id with everything needed to call the bus.
#[derive(Debug, Clone)]
pub struct TaskUnit {
    /// The execution record created for this dispatch.
    pub metadata_id: Uuid,
    /// Workflow lookup key.
    pub workflow_name: String,
    /// Enveloped input payload.
    pub input: Value,
    /// Out-of-band input discriminator, when recorded.
    pub input_type_name: Option<String>,
    /// Parent execution record for sub-workflow dispatches.
    pub parent_metadata_id: Option<Uuid>,
}

/// Opaque handle for a unit of work accepted by a task server.
///
/// Persisted for dashboard visibility and used for best-effort cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TaskHandle(pub String);

impl TaskHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Callback invoked on each firing of a recurring registration.
pub type RecurringCallback = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Background-host adapter interface.
#[async_trait]
pub trait TaskServer: Send + Sync {
    /// Hand off a unit of work for eventual execution.
    async fn enqueue(&self, unit: TaskUnit) -> Result<TaskHandle, EnqueueError>;

    /// Register a recurring callback keyed by `id`, fired on the cadence of
    /// a 5-field cron expression. Re-registering an id replaces the
    /// previous registration.
    async fn enqueue_recurring(
        &self,
        id: &str,
        cron_expression: &str,
        callback: RecurringCallback,
    ) -> Result<TaskHandle, EnqueueError>;

    /// Best-effort cancellation. Returns whether the handle was still known.
    async fn cancel(&self, handle: &TaskHandle) -> Result<bool, EnqueueError>;
}
