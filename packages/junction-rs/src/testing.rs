//! Test doubles for bus and task-server consumers.
//!
//! Enabled with the `testing` feature. These doubles record interactions for
//! assertions instead of doing real work.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{RunContext, Workflow};
use crate::error::EnqueueError;
use crate::task_server::{RecurringCallback, TaskHandle, TaskServer, TaskUnit};

/// Task server that records every enqueue without executing anything.
pub struct RecordingTaskServer {
    units: Mutex<Vec<TaskUnit>>,
    recurring: Mutex<Vec<(String, String)>>,
    cancelled: Mutex<Vec<TaskHandle>>,
    reject: AtomicBool,
    counter: AtomicU64,
}

impl Default for RecordingTaskServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingTaskServer {
    pub fn new() -> Self {
        Self {
            units: Mutex::new(Vec::new()),
            recurring: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            reject: AtomicBool::new(false),
            counter: AtomicU64::new(0),
        }
    }

    /// Make subsequent enqueues fail, to exercise `EnqueueFailed` paths.
    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Every unit handed over so far.
    pub fn units(&self) -> Vec<TaskUnit> {
        self.units.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Recurring registrations as `(id, cron)` pairs.
    pub fn recurring(&self) -> Vec<(String, String)> {
        self.recurring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Handles cancelled so far.
    pub fn cancelled(&self) -> Vec<TaskHandle> {
        self.cancelled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl TaskServer for RecordingTaskServer {
    async fn enqueue(&self, unit: TaskUnit) -> Result<TaskHandle, EnqueueError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(EnqueueError::Rejected("recording server set to reject".into()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        self.units
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(unit);
        Ok(TaskHandle::new(format!("recorded-{n}")))
    }

    async fn enqueue_recurring(
        &self,
        id: &str,
        cron_expression: &str,
        _callback: RecurringCallback,
    ) -> Result<TaskHandle, EnqueueError> {
        self.recurring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id.to_string(), cron_expression.to_string()));
        Ok(TaskHandle::new(format!("recurring-{id}")))
    }

    async fn cancel(&self, handle: &TaskHandle) -> Result<bool, EnqueueError> {
        self.cancelled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle.clone());
        Ok(true)
    }
}

/// Input for the counting test workflows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CountedInput {
    pub label: String,
}

/// Workflow that succeeds and counts its invocations.
pub struct CountingWorkflow {
    name: &'static str,
    runs: AtomicU64,
}

impl CountingWorkflow {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            runs: AtomicU64::new(0),
        }
    }

    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Workflow for Arc<CountingWorkflow> {
    type Input = CountedInput;
    type Output = u64;

    fn name(&self) -> &'static str {
        self.name
    }

    fn input_type_name(&self) -> &'static str {
        "junction.testing.CountedInput"
    }

    async fn run(&self, _input: CountedInput, _ctx: RunContext) -> anyhow::Result<u64> {
        Ok(self.runs.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// Workflow that fails a configured number of times before succeeding.
pub struct FlakyWorkflow {
    name: &'static str,
    failures_before_success: u64,
    runs: AtomicU64,
}

impl FlakyWorkflow {
    pub fn new(name: &'static str, failures_before_success: u64) -> Self {
        Self {
            name,
            failures_before_success,
            runs: AtomicU64::new(0),
        }
    }

    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Workflow for Arc<FlakyWorkflow> {
    type Input = CountedInput;
    type Output = u64;

    fn name(&self) -> &'static str {
        self.name
    }

    fn input_type_name(&self) -> &'static str {
        "junction.testing.CountedInput"
    }

    async fn run(&self, _input: CountedInput, _ctx: RunContext) -> anyhow::Result<u64> {
        let attempt = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures_before_success {
            anyhow::bail!("induced failure on attempt {attempt}");
        }
        Ok(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn unit() -> TaskUnit {
        TaskUnit {
            metadata_id: Uuid::new_v4(),
            workflow_name: "demo.Workflow".into(),
            input: serde_json::json!({}),
            input_type_name: None,
            parent_metadata_id: None,
        }
    }

    #[tokio::test]
    async fn recording_server_tracks_units() {
        let server = RecordingTaskServer::new();
        server.enqueue(unit()).await.unwrap();
        server.enqueue(unit()).await.unwrap();
        assert_eq!(server.units().len(), 2);
    }

    #[tokio::test]
    async fn recording_server_can_reject() {
        let server = RecordingTaskServer::new();
        server.set_reject(true);
        assert!(server.enqueue(unit()).await.is_err());
        assert!(server.units().is_empty());
    }

    #[tokio::test]
    async fn flaky_workflow_fails_then_succeeds() {
        let flaky = Arc::new(FlakyWorkflow::new("demo.Flaky", 2));
        let ctx = RunContext::root(Uuid::new_v4());
        assert!(flaky.run(CountedInput::default(), ctx.clone()).await.is_err());
        assert!(flaky.run(CountedInput::default(), ctx.clone()).await.is_err());
        assert!(flaky.run(CountedInput::default(), ctx).await.is_ok());
    }
}
