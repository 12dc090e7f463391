//! In-process task server on the tokio runtime.
//!
//! Implements the junction task-server contract by spawning each unit of
//! work as a tokio task that calls the workflow bus and writes the terminal
//! transition. The metadata record stays authoritative: the host only moves
//! `InProgress → {Completed, Failed}`, loses compare-and-set races silently
//! (a cancel beat it), and reports what actually happened on the completion
//! channel.
//!
//! ```text
//! Dispatcher                TokioTaskServer                    Store
//!     │  enqueue(unit)           │                               │
//!     ├─────────────────────────►│ spawn task                    │
//!     │  Pending → InProgress    │   wait until not Pending      │
//!     ├─────────────────────────────────────────────────────────►│
//!     │                          │   bus.run_by_name(...)        │
//!     │                          │   InProgress → terminal       │
//!     │                          ├──────────────────────────────►│
//!     │ ◄── CompletionEvent ─────┤                               │
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use junction::{
    BusError, EnqueueError, RecurringCallback, RunContext, TaskHandle, TaskServer, TaskUnit,
    WorkflowBus, WorkflowFailure,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::kernel::Clock;
use crate::schedule::CronExpression;
use crate::store::{
    BackgroundJob, FailureDetail, MetadataPatch, SharedStore, Store, WorkflowState,
};

/// How a dispatched execution ended, reported back to the dispatcher.
#[derive(Debug, Clone)]
pub struct CompletionEvent {
    pub metadata_id: Uuid,
    pub state: WorkflowState,
    pub failure: Option<WorkflowFailure>,
}

/// Sender half of the completion channel.
pub type CompletionSender = mpsc::UnboundedSender<CompletionEvent>;
/// Receiver half, consumed by the dispatcher.
pub type CompletionReceiver = mpsc::UnboundedReceiver<CompletionEvent>;

/// Open a completion channel pair.
pub fn completion_channel() -> (CompletionSender, CompletionReceiver) {
    mpsc::unbounded_channel()
}

struct RunningTask {
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

type TaskMap = Arc<Mutex<HashMap<String, RunningTask>>>;

/// Task server running workflow executions as tokio tasks.
pub struct TokioTaskServer {
    store: SharedStore,
    bus: Arc<dyn WorkflowBus>,
    clock: Arc<dyn Clock>,
    completions: CompletionSender,
    tasks: TaskMap,
    recurring: Mutex<HashMap<String, RunningTask>>,
    counter: AtomicU64,
    draining: AtomicBool,
}

impl TokioTaskServer {
    pub fn new(
        store: SharedStore,
        bus: Arc<dyn WorkflowBus>,
        clock: Arc<dyn Clock>,
        completions: CompletionSender,
    ) -> Self {
        Self {
            store,
            bus,
            clock,
            completions,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            recurring: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
            draining: AtomicBool::new(false),
        }
    }

    /// Number of workflow tasks currently held.
    pub fn active_count(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stop accepting work and wait for every running task to finish.
    pub async fn drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
        loop {
            let joins: Vec<JoinHandle<()>> = {
                let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
                tasks.values_mut().filter_map(|t| t.join.take()).collect()
            };
            for join in joins {
                let _ = join.await;
            }
            let empty = self
                .tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_empty();
            if empty {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
    }

    /// Wait for in-flight tasks without refusing new work. Test hook.
    pub async fn settle(&self) {
        loop {
            let joins: Vec<String> = {
                let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
                tasks.keys().cloned().collect()
            };
            if joins.is_empty() {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
    }

    fn next_handle(&self) -> TaskHandle {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        TaskHandle::new(format!("tokio-task-{n}"))
    }

    async fn execute(
        store: SharedStore,
        bus: Arc<dyn WorkflowBus>,
        clock: Arc<dyn Clock>,
        completions: CompletionSender,
        unit: TaskUnit,
        cancel: CancellationToken,
    ) {
        let metadata_id = unit.metadata_id;

        // The dispatcher flips Pending -> InProgress right after enqueue
        // returns; wait for that (or for a cancel racing us) before running.
        let ready = loop {
            match store.get_metadata(metadata_id).await {
                Ok(Some(row)) => match row.workflow_state {
                    WorkflowState::InProgress => break true,
                    WorkflowState::Pending => {
                        if cancel.is_cancelled() {
                            break false;
                        }
                        tokio::time::sleep(StdDuration::from_millis(5)).await;
                    }
                    terminal => {
                        debug!(metadata_id = %metadata_id, state = %terminal,
                               "execution settled before the host ran it");
                        let _ = completions.send(CompletionEvent {
                            metadata_id,
                            state: terminal,
                            failure: None,
                        });
                        break false;
                    }
                },
                Ok(None) => {
                    warn!(metadata_id = %metadata_id, "execution record vanished before run");
                    break false;
                }
                Err(e) => {
                    warn!(metadata_id = %metadata_id, error = %e, "failed to read execution record");
                    tokio::time::sleep(StdDuration::from_millis(50)).await;
                    if cancel.is_cancelled() {
                        break false;
                    }
                }
            }
        };
        if !ready {
            return;
        }

        let ctx = RunContext {
            metadata_id,
            parent_metadata_id: unit.parent_metadata_id,
            cancellation: cancel.clone(),
        };
        let result = bus
            .run_by_name(&unit.workflow_name, unit.input, unit.input_type_name, ctx)
            .await;

        let now = clock.now();
        let (target, patch, failure) = match result {
            Ok(output) => (
                WorkflowState::Completed,
                MetadataPatch::completed(now, Some(output)),
                None,
            ),
            Err(BusError::Failure(failure)) => (
                WorkflowState::Failed,
                MetadataPatch::failed(now, FailureDetail::from(failure.clone())),
                Some(failure),
            ),
            Err(BusError::Decode(decode)) => {
                let failure = WorkflowFailure::from_reason(decode.to_string());
                (
                    WorkflowState::Failed,
                    MetadataPatch::failed(now, FailureDetail::from(failure.clone())),
                    Some(failure),
                )
            }
        };

        let state = match store
            .transition_metadata(metadata_id, WorkflowState::InProgress, target, patch)
            .await
        {
            Ok(row) => row.workflow_state,
            Err(e) => {
                // Lost to a cancel or the reaper; the record is authoritative.
                debug!(metadata_id = %metadata_id, error = %e, "terminal transition lost a race");
                match store.get_metadata(metadata_id).await {
                    Ok(Some(row)) => row.workflow_state,
                    _ => target,
                }
            }
        };

        let _ = completions.send(CompletionEvent {
            metadata_id,
            state,
            failure,
        });
    }
}

#[async_trait]
impl TaskServer for TokioTaskServer {
    async fn enqueue(&self, unit: TaskUnit) -> Result<TaskHandle, EnqueueError> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(EnqueueError::ShuttingDown);
        }

        let handle = self.next_handle();
        let cancel = CancellationToken::new();

        let job = BackgroundJob::builder()
            .task_handle(handle.as_str().to_string())
            .metadata_id(unit.metadata_id)
            .created_at(self.clock.now())
            .build();
        if let Err(e) = self.store.record_background_job(job).await {
            return Err(EnqueueError::Rejected(format!(
                "could not record background job: {e}"
            )));
        }

        let store = Arc::clone(&self.store);
        let bus = Arc::clone(&self.bus);
        let clock = Arc::clone(&self.clock);
        let completions = self.completions.clone();
        let task_cancel = cancel.clone();
        let task_unit = unit;
        let handle_key = handle.as_str().to_string();

        // Register before spawning so the task can always unregister itself.
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).insert(
            handle_key.clone(),
            RunningTask {
                cancel,
                join: None,
            },
        );

        let join = tokio::spawn({
            let store_for_close = Arc::clone(&store);
            let clock_for_close = Arc::clone(&clock);
            let tasks = Arc::clone(&self.tasks);
            let key = handle_key.clone();
            async move {
                Self::execute(store, bus, clock, completions, task_unit, task_cancel).await;
                let _ = store_for_close
                    .complete_background_job(&key, clock_for_close.now())
                    .await;
                tasks.lock().unwrap_or_else(|e| e.into_inner()).remove(&key);
            }
        });

        if let Some(entry) = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&handle_key)
        {
            entry.join = Some(join);
        }
        Ok(handle)
    }

    async fn enqueue_recurring(
        &self,
        id: &str,
        cron_expression: &str,
        callback: RecurringCallback,
    ) -> Result<TaskHandle, EnqueueError> {
        let cron = CronExpression::parse(cron_expression)
            .map_err(|e| EnqueueError::Rejected(format!("bad cron expression: {e}")))?;

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let clock = Arc::clone(&self.clock);
        let registration = id.to_string();

        let join = tokio::spawn(async move {
            loop {
                let now = clock.now();
                let Some(next) = cron.next_after(now + chrono::Duration::seconds(1)) else {
                    break;
                };
                let wait = (next - now).to_std().unwrap_or(StdDuration::from_secs(1));
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {
                        if let Err(e) = callback().await {
                            error!(registration = %registration, error = %e, "recurring callback failed");
                        }
                    }
                }
            }
        });

        let handle = TaskHandle::new(format!("tokio-recurring-{id}"));
        let mut recurring = self.recurring.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = recurring.insert(
            id.to_string(),
            RunningTask {
                cancel,
                join: Some(join),
            },
        ) {
            previous.cancel.cancel();
        }
        Ok(handle)
    }

    async fn cancel(&self, handle: &TaskHandle) -> Result<bool, EnqueueError> {
        if let Some(id) = handle.as_str().strip_prefix("tokio-recurring-") {
            let mut recurring = self.recurring.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(task) = recurring.remove(id) {
                task.cancel.cancel();
                return Ok(true);
            }
            return Ok(false);
        }

        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        match tasks.get(handle.as_str()) {
            Some(task) => {
                task.cancel.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Drop for TokioTaskServer {
    fn drop(&mut self) {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for task in tasks.values() {
            task.cancel.cancel();
        }
        let recurring = self.recurring.lock().unwrap_or_else(|e| e.into_inner());
        for task in recurring.values() {
            task.cancel.cancel();
        }
    }
}
