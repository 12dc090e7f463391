//! Job dispatcher: bounded concurrent consumer of the work queue.
//!
//! ```text
//! JobDispatcher
//!     │
//!     ├─► pump completion events (release slots, retry policy)
//!     ├─► reconcile slot counters against the store (every N-th tick)
//!     ├─► claim up to (pool size - in flight) queue rows
//!     └─► per row: group slot → Pending metadata → task-server handoff
//!                  → Pending → InProgress (or Failed on refusal)
//! ```
//!
//! Guarantees kept here: at most one in-flight dispatch per queue row (the
//! claim is atomic), at most `max_active_jobs` executions per group (slot
//! permits), claim-order dispatch within a group, and a `priority += 1`
//! nudge whenever a saturated group forces a claim to be rolled back.

pub mod slots;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use anyhow::Result;
use junction::{SharedWorkflowRegistry, TaskHandle, TaskServer, TaskUnit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::kernel::Clock;
use crate::retry::{self, RetryDefaults};
use crate::service::Service;
use crate::store::{
    failure_reason, FailureDetail, Metadata, MetadataPatch, SharedStore, Store, StoreError,
    WorkQueueEntry, WorkflowState,
};
use crate::taskserver::{CompletionEvent, CompletionReceiver};

pub use slots::{GroupSlots, SlotPermit};

/// Dispatcher knobs, cut from the application [`Config`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_interval: StdDuration,
    pub max_active_jobs: usize,
    pub executor: String,
    pub reconcile_stride: u64,
    pub drain_timeout: StdDuration,
    pub retry_defaults: RetryDefaults,
}

impl DispatcherConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.job_dispatcher_polling_interval,
            max_active_jobs: config.max_active_jobs.max(1),
            executor: config.executor_name.clone(),
            reconcile_stride: 6,
            drain_timeout: config.drain_timeout,
            retry_defaults: config.retry_defaults(),
        }
    }
}

/// What one tick did; used by logs and scenario tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    pub completions_handled: usize,
    pub claimed: usize,
    pub dispatched: usize,
    pub released: usize,
    pub born_failed: usize,
    pub enqueue_failed: usize,
}

struct Inflight {
    entry: WorkQueueEntry,
    task_handle: Option<TaskHandle>,
    // Held for the lifetime of the execution; dropping releases the slot.
    _permit: Option<SlotPermit>,
}

/// Consumer of the work queue; one per process.
pub struct JobDispatcher {
    store: SharedStore,
    registry: SharedWorkflowRegistry,
    task_server: Arc<dyn TaskServer>,
    slots: Arc<GroupSlots>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
    completions: Mutex<CompletionReceiver>,
    inflight: Mutex<HashMap<Uuid, Inflight>>,
    ticks: AtomicU64,
}

impl JobDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: SharedStore,
        registry: SharedWorkflowRegistry,
        task_server: Arc<dyn TaskServer>,
        slots: Arc<GroupSlots>,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
        completions: CompletionReceiver,
    ) -> Self {
        Self {
            store,
            registry,
            task_server,
            slots,
            clock,
            config,
            completions: Mutex::new(completions),
            inflight: Mutex::new(HashMap::new()),
            ticks: AtomicU64::new(0),
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// One poll cycle: completions, reconcile, claim, dispatch.
    pub async fn tick(&self) -> Result<TickStats> {
        let now = self.clock.now();
        let mut stats = TickStats::default();

        stats.completions_handled = self.pump_completions().await?;

        let tick_number = self.ticks.fetch_add(1, Ordering::SeqCst);
        if tick_number % self.config.reconcile_stride == 0 {
            self.reconcile().await?;
        }

        let free = self
            .config
            .max_active_jobs
            .saturating_sub(self.in_flight_count());
        if free == 0 {
            return Ok(stats);
        }

        let claimed = self.store.claim_work_queue(free as i64, now).await?;
        stats.claimed = claimed.len();
        for entry in claimed {
            self.dispatch_entry(entry, &mut stats).await?;
        }
        Ok(stats)
    }

    /// Drain pending completion events. Also run by `tick`.
    pub async fn pump_completions(&self) -> Result<usize> {
        let mut handled = 0;
        loop {
            let event = {
                let mut rx = self.completions.lock().unwrap_or_else(|e| e.into_inner());
                rx.try_recv()
            };
            match event {
                Ok(event) => {
                    self.handle_completion(event).await?;
                    handled += 1;
                }
                Err(_) => break,
            }
        }
        Ok(handled)
    }

    async fn dispatch_entry(&self, entry: WorkQueueEntry, stats: &mut TickStats) -> Result<()> {
        let now = self.clock.now();

        let manifest = match entry.manifest_id {
            Some(id) => self.store.get_manifest(id).await?,
            None => None,
        };
        let group = match manifest.as_ref().and_then(|m| m.manifest_group_id) {
            Some(group_id) => self.store.get_group(group_id).await?,
            None => None,
        };

        // Group gate: disabled groups roll the claim back untouched, a
        // saturated group rolls it back with an anti-starvation nudge.
        let permit = match &group {
            Some(g) if !g.is_enabled => {
                debug!(entry_id = %entry.id, group = %g.name, "group disabled, releasing claim");
                self.store.release_claim(entry.id, 0).await?;
                stats.released += 1;
                return Ok(());
            }
            Some(g) => match self.slots.try_acquire(g) {
                Some(permit) => Some(permit),
                None => {
                    debug!(entry_id = %entry.id, group = %g.name, "group saturated, releasing claim");
                    self.store.release_claim(entry.id, 1).await?;
                    stats.released += 1;
                    return Ok(());
                }
            },
            None => None,
        };

        let input = entry
            .input_json
            .clone()
            .unwrap_or_else(|| serde_json::Value::Object(Default::default()));

        // Dispatch-time faults are born Failed: they count toward the retry
        // budget without ever reaching a worker.
        let dispatch_fault = if !self.registry.contains(&entry.workflow_name) {
            Some(FailureDetail {
                reason: Some(failure_reason::UNKNOWN_WORKFLOW.to_string()),
                exception: Some(format!("no workflow registered as {}", entry.workflow_name)),
                ..FailureDetail::default()
            })
        } else if let Err(decode) =
            self.registry
                .check_input(&entry.workflow_name, &input, entry.input_type_name.as_deref())
        {
            Some(FailureDetail {
                reason: Some(failure_reason::SERIALIZATION_ERROR.to_string()),
                exception: Some(decode.to_string()),
                ..FailureDetail::default()
            })
        } else {
            None
        };

        if let Some(detail) = dispatch_fault {
            warn!(
                entry_id = %entry.id,
                workflow = %entry.workflow_name,
                reason = detail.reason.as_deref().unwrap_or(""),
                "dispatch fault, recording born-failed execution"
            );
            let row = Metadata::born_failed(
                &entry.workflow_name,
                &self.config.executor,
                entry.manifest_id,
                Some(entry.id),
                entry.input_json.clone(),
                detail,
                now,
            );
            let row = self.store.append_metadata(row).await?;
            if let Some(dead_letter_id) = entry.dead_letter_id {
                self.store.attach_retry_metadata(dead_letter_id, row.id).await?;
            }
            if let Some(manifest) = &manifest {
                retry::on_failure(
                    self.store.as_ref(),
                    manifest,
                    Some(&entry),
                    &self.config.retry_defaults,
                    now,
                )
                .await?;
            }
            stats.born_failed += 1;
            return Ok(());
        }

        // Commit the attempt.
        let mut row = Metadata::builder()
            .name(entry.workflow_name.clone())
            .executor(self.config.executor.clone())
            .scheduled_time(entry.created_at)
            .start_time(now)
            .build();
        row.manifest_id = entry.manifest_id;
        row.work_queue_id = Some(entry.id);
        row.input_json = entry.input_json.clone();
        let row = self.store.append_metadata(row).await?;

        if let Some(dead_letter_id) = entry.dead_letter_id {
            self.store.attach_retry_metadata(dead_letter_id, row.id).await?;
        }

        let unit = TaskUnit {
            metadata_id: row.id,
            workflow_name: entry.workflow_name.clone(),
            input,
            input_type_name: entry.input_type_name.clone(),
            parent_metadata_id: None,
        };

        match self.task_server.enqueue(unit).await {
            Ok(handle) => {
                match self
                    .store
                    .transition_metadata(
                        row.id,
                        WorkflowState::Pending,
                        WorkflowState::InProgress,
                        MetadataPatch::started(now),
                    )
                    .await
                {
                    Ok(_) => {}
                    // A cancel can beat us here; the host observes it.
                    Err(StoreError::StateConflict { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
                self.inflight.lock().unwrap_or_else(|e| e.into_inner()).insert(
                    row.id,
                    Inflight {
                        entry,
                        task_handle: Some(handle),
                        _permit: permit,
                    },
                );
                stats.dispatched += 1;
            }
            Err(refusal) => {
                warn!(
                    metadata_id = %row.id,
                    workflow = %entry.workflow_name,
                    error = %refusal,
                    "task server refused the work unit"
                );
                self.store
                    .transition_metadata(
                        row.id,
                        WorkflowState::Pending,
                        WorkflowState::Failed,
                        MetadataPatch::failed(
                            now,
                            FailureDetail {
                                reason: Some(failure_reason::ENQUEUE_FAILED.to_string()),
                                exception: Some(refusal.to_string()),
                                ..FailureDetail::default()
                            },
                        ),
                    )
                    .await?;
                if let Some(manifest) = &manifest {
                    retry::on_failure(
                        self.store.as_ref(),
                        manifest,
                        Some(&entry),
                        &self.config.retry_defaults,
                        now,
                    )
                    .await?;
                }
                stats.enqueue_failed += 1;
                // Permit drops here: the attempt is terminal.
            }
        }
        Ok(())
    }

    async fn handle_completion(&self, event: CompletionEvent) -> Result<()> {
        let now = self.clock.now();
        let inflight = self
            .inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&event.metadata_id);

        let manifest_id = match &inflight {
            Some(record) => record.entry.manifest_id,
            None => self
                .store
                .get_metadata(event.metadata_id)
                .await?
                .and_then(|m| m.manifest_id),
        };

        match event.state {
            WorkflowState::Completed => {
                if let Some(manifest_id) = manifest_id {
                    self.store.record_successful_run(manifest_id, now).await?;
                }
            }
            WorkflowState::Failed => {
                if let Some(manifest_id) = manifest_id {
                    if let Some(manifest) = self.store.get_manifest(manifest_id).await? {
                        retry::on_failure(
                            self.store.as_ref(),
                            &manifest,
                            inflight.as_ref().map(|r| &r.entry),
                            &self.config.retry_defaults,
                            now,
                        )
                        .await?;
                    }
                }
            }
            // Cancelled executions never retry; Pending/InProgress events
            // do not occur.
            _ => {}
        }
        // The permit (if any) drops with `inflight` here.
        Ok(())
    }

    /// Self-healing pass: synthesize completions for executions whose
    /// terminal transition we never saw, and snap group counters to the
    /// store's counts.
    async fn reconcile(&self) -> Result<()> {
        let tracked: Vec<Uuid> = {
            let inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            inflight.keys().copied().collect()
        };

        for metadata_id in tracked {
            let Some(row) = self.store.get_metadata(metadata_id).await? else {
                self.inflight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&metadata_id);
                continue;
            };
            if row.workflow_state.is_terminal() {
                debug!(metadata_id = %metadata_id, state = %row.workflow_state,
                       "reconciling missed terminal transition");
                self.handle_completion(CompletionEvent {
                    metadata_id,
                    state: row.workflow_state,
                    failure: None,
                })
                .await?;
            }
        }

        for group in self.store.list_groups().await? {
            let active = self.store.count_active_jobs(group.id).await?;
            self.slots.reconcile(group.id, active);
        }
        Ok(())
    }

    /// Drain for shutdown: wait for in-flight work, then force-cancel
    /// whatever is left at the deadline.
    async fn drain(&self) {
        let started = std::time::Instant::now();
        while self.in_flight_count() > 0 && started.elapsed() < self.config.drain_timeout {
            if let Err(e) = self.pump_completions().await {
                warn!(error = %e, "completion pump failed during drain");
            }
            if let Err(e) = self.reconcile().await {
                warn!(error = %e, "reconcile failed during drain");
            }
            tokio::time::sleep(StdDuration::from_millis(50)).await;
        }

        let leftovers: Vec<(Uuid, Option<TaskHandle>)> = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            inflight
                .drain()
                .map(|(id, record)| (id, record.task_handle))
                .collect()
        };
        if leftovers.is_empty() {
            return;
        }

        let now = self.clock.now();
        warn!(count = leftovers.len(), "force-cancelling executions at drain deadline");
        for (metadata_id, handle) in leftovers {
            if let Some(handle) = handle {
                let _ = self.task_server.cancel(&handle).await;
            }
            match self
                .store
                .transition_metadata(
                    metadata_id,
                    WorkflowState::InProgress,
                    WorkflowState::Cancelled,
                    MetadataPatch::cancelled(now),
                )
                .await
            {
                Ok(_) | Err(StoreError::StateConflict { .. }) => {}
                Err(e) => warn!(metadata_id = %metadata_id, error = %e,
                                "failed to cancel execution at deadline"),
            }
        }
    }
}

#[async_trait::async_trait]
impl Service for JobDispatcher {
    fn name(&self) -> &'static str {
        "job-dispatcher"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            pool_size = self.config.max_active_jobs,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "job dispatcher starting"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(stats) if stats.claimed > 0 || stats.completions_handled > 0 => {
                            debug!(?stats, "dispatcher tick");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "dispatcher tick failed"),
                    }
                }
            }
        }

        self.drain().await;
        info!("job dispatcher stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::ManualClock;
    use crate::store::{ManifestGroup, MemoryStore, QueueStatus};
    use junction::testing::RecordingTaskServer;
    use junction::WorkflowRegistry;

    use crate::store::Manifest;
    use crate::taskserver::completion_channel;

    struct Harness {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        task_server: Arc<RecordingTaskServer>,
        dispatcher: JobDispatcher,
    }

    fn harness(registry: WorkflowRegistry) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::fixed());
        let task_server = Arc::new(RecordingTaskServer::new());
        let (_tx, rx) = completion_channel();
        let dispatcher = JobDispatcher::new(
            store.clone(),
            Arc::new(registry),
            task_server.clone(),
            GroupSlots::new(),
            clock.clone(),
            DispatcherConfig {
                poll_interval: StdDuration::from_secs(5),
                max_active_jobs: 10,
                executor: "test-host".into(),
                reconcile_stride: 1_000,
                drain_timeout: StdDuration::from_secs(1),
                retry_defaults: RetryDefaults::default(),
            },
            rx,
        );
        Harness {
            store,
            clock,
            task_server,
            dispatcher,
        }
    }

    fn empty_registry() -> WorkflowRegistry {
        WorkflowRegistry::new()
    }

    fn registry_with_noop() -> WorkflowRegistry {
        use junction::testing::CountingWorkflow;
        let mut registry = WorkflowRegistry::new();
        registry
            .register(Arc::new(CountingWorkflow::new("demo.Noop")))
            .unwrap();
        registry
    }

    async fn queue_for_manifest(h: &Harness, manifest: &Manifest) -> WorkQueueEntry {
        let now = h.clock.now();
        h.store
            .enqueue_work(WorkQueueEntry::for_manifest(manifest, manifest.priority, now))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn dispatch_creates_in_progress_metadata() {
        let h = harness(registry_with_noop());
        let mut manifest = Manifest::on_demand("demo.Noop");
        manifest.properties_json = Some(serde_json::json!({"label": "x"}));
        let manifest = h.store.upsert_manifest(manifest).await.unwrap();
        queue_for_manifest(&h, &manifest).await;

        let stats = h.dispatcher.tick().await.unwrap();
        assert_eq!(stats.claimed, 1);
        assert_eq!(stats.dispatched, 1);
        assert_eq!(h.task_server.units().len(), 1);

        let rows = h.store.all_metadata();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].workflow_state, WorkflowState::InProgress);
        assert!(rows[0].work_queue_id.is_some());
        assert_eq!(h.dispatcher.in_flight_count(), 1);
    }

    #[tokio::test]
    async fn unknown_workflow_is_born_failed() {
        let h = harness(empty_registry());
        let manifest = h
            .store
            .upsert_manifest(Manifest::on_demand("ghost.Workflow"))
            .await
            .unwrap();
        queue_for_manifest(&h, &manifest).await;

        let stats = h.dispatcher.tick().await.unwrap();
        assert_eq!(stats.born_failed, 1);
        assert!(h.task_server.units().is_empty());

        let rows = h.store.all_metadata();
        assert_eq!(rows[0].workflow_state, WorkflowState::Failed);
        assert_eq!(
            rows[0].failure_reason.as_deref(),
            Some(failure_reason::UNKNOWN_WORKFLOW)
        );

        // The failure consumed retry budget and queued a delayed retry.
        let retries: Vec<_> = h
            .store
            .all_work_entries()
            .into_iter()
            .filter(|e| e.status == QueueStatus::Queued)
            .collect();
        assert_eq!(retries.len(), 1);
        assert!(retries[0].available_at > h.clock.now());
    }

    #[tokio::test]
    async fn undecodable_input_is_a_serialization_error() {
        let h = harness(registry_with_noop());
        let mut manifest = Manifest::on_demand("demo.Noop");
        manifest.properties_json = Some(serde_json::json!({"label": 42}));
        let manifest = h.store.upsert_manifest(manifest).await.unwrap();
        queue_for_manifest(&h, &manifest).await;

        let stats = h.dispatcher.tick().await.unwrap();
        assert_eq!(stats.born_failed, 1);
        let rows = h.store.all_metadata();
        assert_eq!(
            rows[0].failure_reason.as_deref(),
            Some(failure_reason::SERIALIZATION_ERROR)
        );
    }

    #[tokio::test]
    async fn task_server_refusal_fails_the_attempt() {
        let h = harness(registry_with_noop());
        h.task_server.set_reject(true);
        let manifest = h
            .store
            .upsert_manifest(Manifest::on_demand("demo.Noop"))
            .await
            .unwrap();
        queue_for_manifest(&h, &manifest).await;

        let stats = h.dispatcher.tick().await.unwrap();
        assert_eq!(stats.enqueue_failed, 1);
        assert_eq!(h.dispatcher.in_flight_count(), 0);

        let rows = h.store.all_metadata();
        assert_eq!(rows[0].workflow_state, WorkflowState::Failed);
        assert_eq!(
            rows[0].failure_reason.as_deref(),
            Some(failure_reason::ENQUEUE_FAILED)
        );
    }

    #[tokio::test]
    async fn saturated_group_rolls_back_with_priority_nudge() {
        let h = harness(registry_with_noop());
        let group = h
            .store
            .upsert_group(
                ManifestGroup::builder()
                    .name("tight".to_string())
                    .max_active_jobs(1)
                    .build(),
            )
            .await
            .unwrap();

        let mut first = Manifest::on_demand("demo.Noop");
        first.manifest_group_id = Some(group.id);
        let first = h.store.upsert_manifest(first).await.unwrap();
        let mut second = Manifest::on_demand("demo.Noop");
        second.manifest_group_id = Some(group.id);
        let second = h.store.upsert_manifest(second).await.unwrap();

        queue_for_manifest(&h, &first).await;
        // Later creation time keeps the claim order deterministic.
        h.clock.advance(chrono::Duration::seconds(1));
        let blocked = queue_for_manifest(&h, &second).await;

        let stats = h.dispatcher.tick().await.unwrap();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.released, 1);

        let rolled_back = h.store.get_work_entry(blocked.id).await.unwrap().unwrap();
        assert_eq!(rolled_back.status, QueueStatus::Queued);
        assert_eq!(rolled_back.priority, blocked.priority + 1);
    }

    #[tokio::test]
    async fn disabled_group_releases_without_nudge() {
        let h = harness(registry_with_noop());
        let group = h
            .store
            .upsert_group(
                ManifestGroup::builder()
                    .name("off".to_string())
                    .is_enabled(false)
                    .build(),
            )
            .await
            .unwrap();
        let mut manifest = Manifest::on_demand("demo.Noop");
        manifest.manifest_group_id = Some(group.id);
        let manifest = h.store.upsert_manifest(manifest).await.unwrap();
        let entry = queue_for_manifest(&h, &manifest).await;

        let stats = h.dispatcher.tick().await.unwrap();
        assert_eq!(stats.released, 1);
        assert_eq!(stats.dispatched, 0);
        let entry = h.store.get_work_entry(entry.id).await.unwrap().unwrap();
        assert_eq!(entry.priority, 0);
        assert_eq!(entry.status, QueueStatus::Queued);
    }

    #[tokio::test]
    async fn pool_size_bounds_claims() {
        let h = harness(registry_with_noop());
        let small_pool = {
            // Rebuild with a pool of 2.
            let (_tx, rx) = completion_channel();
            JobDispatcher::new(
                h.store.clone(),
                Arc::new(registry_with_noop()),
                h.task_server.clone(),
                GroupSlots::new(),
                h.clock.clone(),
                DispatcherConfig {
                    poll_interval: StdDuration::from_secs(5),
                    max_active_jobs: 2,
                    executor: "test-host".into(),
                    reconcile_stride: 1_000,
                    drain_timeout: StdDuration::from_secs(1),
                    retry_defaults: RetryDefaults::default(),
                },
                rx,
            )
        };

        for _ in 0..5 {
            let manifest = h
                .store
                .upsert_manifest(Manifest::on_demand("demo.Noop"))
                .await
                .unwrap();
            queue_for_manifest(&h, &manifest).await;
        }

        let stats = small_pool.tick().await.unwrap();
        assert_eq!(stats.claimed, 2);
        assert_eq!(small_pool.in_flight_count(), 2);

        // Pool full: the next tick claims nothing.
        let stats = small_pool.tick().await.unwrap();
        assert_eq!(stats.claimed, 0);
    }
}
