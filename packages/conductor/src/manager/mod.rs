//! Manifest manager: the periodic evaluate-and-enqueue loop.
//!
//! One cycle, in order:
//!
//! 1. reap stuck executions (every N-th cycle, plus startup)
//! 2. promote exhausted manifests to dead letters
//! 3. retention cleanup, when configured and due
//! 4. select due candidates (schedule, group, DAG, dead-letter gates)
//! 5. enqueue winners transactionally, advancing `last_enqueued_at`
//!
//! The loop never dies to a transient store error or a panicking cycle;
//! both are logged and the next tick starts fresh.

pub mod cleanup;
pub mod promotion;
pub mod reaper;

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::kernel::Clock;
use crate::retry::RetryDefaults;
use crate::schedule::{self, ScheduleError};
use crate::service::Service;
use crate::store::{
    DeadLetterStatus, EnqueueOutcome, Manifest, ManifestGroup, SharedStore, Store, StoreError,
    WorkQueueEntry,
};

pub use cleanup::{CleanupStats, CleanupSweeper};
pub use reaper::Reaper;

/// Manager knobs, cut from the application [`Config`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub polling_interval: StdDuration,
    pub max_jobs_per_cycle: i64,
    pub recover_stuck_jobs_on_startup: bool,
    pub reaper_cycle_stride: u64,
    pub default_job_timeout: chrono::Duration,
    pub retry_defaults: RetryDefaults,
}

impl ManagerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            polling_interval: config.polling_interval,
            max_jobs_per_cycle: config.max_jobs_per_cycle,
            recover_stuck_jobs_on_startup: config.recover_stuck_jobs_on_startup,
            reaper_cycle_stride: config.reaper_cycle_stride.max(1),
            default_job_timeout: chrono::Duration::from_std(config.default_job_timeout)
                .unwrap_or_else(|_| chrono::Duration::minutes(20)),
            retry_defaults: config.retry_defaults(),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub reaped: u64,
    pub promoted: u64,
    pub cleanup: Option<CleanupStats>,
    pub candidates: usize,
    pub enqueued: usize,
    pub skipped_saturated: usize,
    pub skipped_conflict: usize,
    pub disabled_invalid_schedule: usize,
}

/// The evaluate-and-enqueue singleton.
pub struct ManifestManager {
    store: SharedStore,
    clock: Arc<dyn Clock>,
    config: ManagerConfig,
    reaper: Reaper,
    cleanup: Option<CleanupSweeper>,
    cycles: AtomicU64,
}

impl ManifestManager {
    pub fn new(
        store: SharedStore,
        clock: Arc<dyn Clock>,
        config: ManagerConfig,
        cleanup: Option<CleanupSweeper>,
    ) -> Self {
        let reaper = Reaper::new(Arc::clone(&store), config.default_job_timeout);
        Self {
            store,
            clock,
            config,
            reaper,
            cleanup,
            cycles: AtomicU64::new(0),
        }
    }

    pub fn reaper(&self) -> &Reaper {
        &self.reaper
    }

    /// One full manager cycle.
    pub async fn run_cycle(&self) -> Result<CycleStats> {
        let now = self.clock.now();
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst);
        let mut stats = CycleStats::default();

        if cycle % self.config.reaper_cycle_stride == 0 {
            stats.reaped = self.reaper.reap(self.clock.as_ref()).await?;
        }

        stats.promoted =
            promotion::promote_exhausted(&self.store, &self.config.retry_defaults, now).await?;

        if let Some(sweeper) = &self.cleanup {
            stats.cleanup = sweeper.maybe_run(now).await?;
        }

        self.evaluate_and_enqueue(now, &mut stats).await?;

        Ok(stats)
    }

    async fn evaluate_and_enqueue(
        &self,
        now: DateTime<Utc>,
        stats: &mut CycleStats,
    ) -> Result<()> {
        let candidates = self
            .store
            .list_schedulable_manifests(self.config.max_jobs_per_cycle)
            .await?;
        stats.candidates = candidates.len();
        if candidates.is_empty() {
            return Ok(());
        }

        let groups: HashMap<Uuid, ManifestGroup> = self
            .store
            .list_groups()
            .await?
            .into_iter()
            .map(|g| (g.id, g))
            .collect();
        let parked: HashSet<Uuid> = self
            .store
            .list_dead_letters(Some(DeadLetterStatus::AwaitingIntervention))
            .await?
            .into_iter()
            .map(|dl| dl.manifest_id)
            .collect();

        let mut winners: Vec<(Manifest, Option<ManifestGroup>)> = Vec::new();
        for manifest in candidates {
            if parked.contains(&manifest.id) {
                continue;
            }

            let group = match manifest.manifest_group_id {
                Some(group_id) => match groups.get(&group_id) {
                    Some(group) => Some(group.clone()),
                    None => {
                        warn!(manifest = %manifest.external_id, group_id = %group_id,
                              "manifest references a missing group, skipping");
                        continue;
                    }
                },
                None => None,
            };
            if let Some(group) = &group {
                if !group.is_enabled {
                    continue;
                }
            }

            match schedule::is_due(&manifest, now) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    self.disable_for_invalid_schedule(&manifest, &e).await?;
                    stats.disabled_invalid_schedule += 1;
                    continue;
                }
            }

            if !self.predecessor_satisfied(&manifest).await? {
                continue;
            }

            winners.push((manifest, group));
        }

        // (group priority desc, manifest priority desc, last_enqueued_at asc
        // nulls first), tie-broken by id.
        winners.sort_by(|(a, ga), (b, gb)| {
            let ga_priority = ga.as_ref().map(|g| g.priority).unwrap_or(0);
            let gb_priority = gb.as_ref().map(|g| g.priority).unwrap_or(0);
            gb_priority
                .cmp(&ga_priority)
                .then_with(|| b.priority.cmp(&a.priority))
                .then_with(|| match (a.last_enqueued_at, b.last_enqueued_at) {
                    (None, None) => std::cmp::Ordering::Equal,
                    (None, Some(_)) => std::cmp::Ordering::Less,
                    (Some(_), None) => std::cmp::Ordering::Greater,
                    (Some(x), Some(y)) => x.cmp(&y),
                })
                .then_with(|| a.id.cmp(&b.id))
        });

        // Saturation accounting includes enqueues admitted this cycle, not
        // just committed store state.
        let mut db_active: HashMap<Uuid, i64> = HashMap::new();
        let mut admitted: HashMap<Uuid, i64> = HashMap::new();

        for (manifest, group) in winners {
            if let Some(group) = &group {
                let active = match db_active.get(&group.id) {
                    Some(active) => *active,
                    None => {
                        let active = self.store.count_active_jobs(group.id).await?;
                        db_active.insert(group.id, active);
                        active
                    }
                };
                let in_cycle = admitted.get(&group.id).copied().unwrap_or(0);
                if !group.has_capacity(active, in_cycle) {
                    stats.skipped_saturated += 1;
                    continue;
                }
            }

            let priority = manifest.priority + group.as_ref().map(|g| g.priority).unwrap_or(0);
            let entry = WorkQueueEntry::for_manifest(&manifest, priority, now);

            match self
                .store
                .enqueue_manifest_run(manifest.id, manifest.last_enqueued_at, entry, now)
                .await
            {
                Ok(EnqueueOutcome::Enqueued(entry)) => {
                    debug!(
                        manifest = %manifest.external_id,
                        workflow = %manifest.name,
                        entry_id = %entry.id,
                        priority = entry.priority,
                        "enqueued manifest run"
                    );
                    stats.enqueued += 1;
                    if let Some(group) = &group {
                        *admitted.entry(group.id).or_insert(0) += 1;
                    }
                }
                Ok(EnqueueOutcome::Conflict) => {
                    stats.skipped_conflict += 1;
                }
                Err(e) if e.is_transient() => {
                    // Abort the remainder of the cycle; next tick retries.
                    error!(error = %e, "transport error mid-cycle, aborting remaining enqueues");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn disable_for_invalid_schedule(
        &self,
        manifest: &Manifest,
        error: &ScheduleError,
    ) -> Result<(), StoreError> {
        warn!(
            manifest = %manifest.external_id,
            error = %error,
            "disabling manifest with invalid schedule"
        );
        self.store
            .disable_manifest(manifest.id, &format!("invalid schedule: {error}"))
            .await
    }

    /// A dependent is eligible only when its predecessor has completed at
    /// least once since the dependent was last enqueued.
    async fn predecessor_satisfied(&self, manifest: &Manifest) -> Result<bool, StoreError> {
        let Some(parent_id) = manifest.depends_on_manifest_id else {
            return Ok(true);
        };
        let Some(latest) = self.store.latest_completed_metadata(parent_id).await? else {
            return Ok(false);
        };
        Ok(match manifest.last_enqueued_at {
            None => true,
            Some(last_enqueued) => latest
                .end_time
                .map(|end| end >= last_enqueued)
                .unwrap_or(false),
        })
    }
}

#[async_trait::async_trait]
impl Service for ManifestManager {
    fn name(&self) -> &'static str {
        "manifest-manager"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            polling_interval_ms = self.config.polling_interval.as_millis() as u64,
            max_jobs_per_cycle = self.config.max_jobs_per_cycle,
            "manifest manager starting"
        );

        if self.config.recover_stuck_jobs_on_startup {
            if let Err(e) = self.reaper.recover_on_startup(self.clock.as_ref()).await {
                error!(error = %e, "startup recovery failed");
            }
        }

        let mut interval = tokio::time::interval(self.config.polling_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match AssertUnwindSafe(self.run_cycle()).catch_unwind().await {
                        Ok(Ok(stats)) => {
                            if stats.enqueued > 0 || stats.reaped > 0 || stats.promoted > 0 {
                                debug!(?stats, "manager cycle");
                            }
                        }
                        Ok(Err(e)) => error!(error = %e, "manager cycle failed"),
                        Err(_) => error!("manager cycle panicked"),
                    }
                }
            }
        }

        info!("manifest manager stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::ManualClock;
    use crate::store::{DeadLetter, MemoryStore, QueueStatus};
    use chrono::Duration;

    struct Harness {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        manager: ManifestManager,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::fixed());
        let manager = ManifestManager::new(
            store.clone(),
            clock.clone(),
            ManagerConfig {
                polling_interval: StdDuration::from_secs(5),
                max_jobs_per_cycle: 100,
                recover_stuck_jobs_on_startup: true,
                reaper_cycle_stride: 1,
                default_job_timeout: chrono::Duration::minutes(20),
                retry_defaults: RetryDefaults::default(),
            },
            None,
        );
        Harness {
            store,
            clock,
            manager,
        }
    }

    fn queued(store: &MemoryStore) -> Vec<WorkQueueEntry> {
        store
            .all_work_entries()
            .into_iter()
            .filter(|e| e.status == QueueStatus::Queued)
            .collect()
    }

    #[tokio::test]
    async fn due_interval_manifest_is_enqueued_once() {
        let h = harness();
        let manifest = h
            .store
            .upsert_manifest(Manifest::interval("sync.Accounts", 60))
            .await
            .unwrap();

        let stats = h.manager.run_cycle().await.unwrap();
        assert_eq!(stats.enqueued, 1);

        let entries = queued(&h.store);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].manifest_id, Some(manifest.id));

        let manifest = h.store.get_manifest(manifest.id).await.unwrap().unwrap();
        assert_eq!(manifest.last_enqueued_at, Some(h.clock.now()));

        // While the row sits queued the manifest is not schedulable again.
        h.clock.advance(Duration::seconds(120));
        let stats = h.manager.run_cycle().await.unwrap();
        assert_eq!(stats.enqueued, 0);
        assert_eq!(queued(&h.store).len(), 1);
    }

    #[tokio::test]
    async fn on_demand_manifests_are_not_auto_enqueued() {
        let h = harness();
        h.store
            .upsert_manifest(Manifest::on_demand("manual.Job"))
            .await
            .unwrap();

        let stats = h.manager.run_cycle().await.unwrap();
        assert_eq!(stats.enqueued, 0);
        assert!(queued(&h.store).is_empty());
    }

    #[tokio::test]
    async fn group_saturation_admits_one_per_cycle() {
        let h = harness();
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

        for name in ["a.Job", "b.Job"] {
            let mut manifest = Manifest::interval(name, 60);
            manifest.manifest_group_id = Some(group.id);
            h.store.upsert_manifest(manifest).await.unwrap();
        }

        let stats = h.manager.run_cycle().await.unwrap();
        assert_eq!(stats.enqueued, 1);
        assert_eq!(stats.skipped_saturated, 1);
    }

    #[tokio::test]
    async fn disabled_group_blocks_members() {
        let h = harness();
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
        let mut manifest = Manifest::interval("a.Job", 60);
        manifest.manifest_group_id = Some(group.id);
        h.store.upsert_manifest(manifest).await.unwrap();

        let stats = h.manager.run_cycle().await.unwrap();
        assert_eq!(stats.enqueued, 0);
    }

    #[tokio::test]
    async fn dead_lettered_manifest_is_skipped() {
        let h = harness();
        let manifest = h
            .store
            .upsert_manifest(Manifest::interval("flaky.Job", 60))
            .await
            .unwrap();
        h.store
            .upsert_dead_letter(DeadLetter::awaiting(manifest.id, "x", 3, h.clock.now()))
            .await
            .unwrap();

        let stats = h.manager.run_cycle().await.unwrap();
        assert_eq!(stats.enqueued, 0);
    }

    #[tokio::test]
    async fn invalid_cron_disables_the_manifest_with_a_note() {
        let h = harness();
        let manifest = h
            .store
            .upsert_manifest(Manifest::cron("bad.Job", "every tuesday"))
            .await
            .unwrap();

        let stats = h.manager.run_cycle().await.unwrap();
        assert_eq!(stats.disabled_invalid_schedule, 1);
        assert_eq!(stats.enqueued, 0);

        let manifest = h.store.get_manifest(manifest.id).await.unwrap().unwrap();
        assert!(!manifest.is_enabled);
        assert!(manifest
            .disabled_note
            .as_deref()
            .unwrap()
            .contains("invalid schedule"));

        // The next cycle no longer sees it at all.
        let stats = h.manager.run_cycle().await.unwrap();
        assert_eq!(stats.disabled_invalid_schedule, 0);
    }

    #[tokio::test]
    async fn dependent_waits_for_predecessor_completion() {
        use crate::store::{Metadata, MetadataPatch, WorkflowState};

        let h = harness();
        let parent = h
            .store
            .upsert_manifest(Manifest::on_demand("parent.Job"))
            .await
            .unwrap();
        let mut child = Manifest::interval("child.Job", 60);
        child.depends_on_manifest_id = Some(parent.id);
        let child = h.store.upsert_manifest(child).await.unwrap();

        // No completed parent run: the child stays parked.
        let stats = h.manager.run_cycle().await.unwrap();
        assert_eq!(stats.enqueued, 0);

        // Complete a parent run.
        let mut row = Metadata::builder()
            .name(parent.name.clone())
            .executor("test-host".to_string())
            .start_time(h.clock.now())
            .build();
        row.manifest_id = Some(parent.id);
        let row = h.store.append_metadata(row).await.unwrap();
        h.store
            .transition_metadata(
                row.id,
                WorkflowState::Pending,
                WorkflowState::InProgress,
                MetadataPatch::started(h.clock.now()),
            )
            .await
            .unwrap();
        h.clock.advance(Duration::seconds(5));
        h.store
            .transition_metadata(
                row.id,
                WorkflowState::InProgress,
                WorkflowState::Completed,
                MetadataPatch::completed(h.clock.now(), None),
            )
            .await
            .unwrap();

        h.clock.advance(Duration::seconds(5));
        let stats = h.manager.run_cycle().await.unwrap();
        assert_eq!(stats.enqueued, 1);
        let entries = queued(&h.store);
        assert_eq!(entries[0].manifest_id, Some(child.id));
    }

    #[tokio::test]
    async fn priority_orders_enqueues() {
        let h = harness();
        let fast_lane = h
            .store
            .upsert_group(
                ManifestGroup::builder()
                    .name("fast".to_string())
                    .priority(10)
                    .build(),
            )
            .await
            .unwrap();

        let mut urgent = Manifest::interval("urgent.Job", 60);
        urgent.manifest_group_id = Some(fast_lane.id);
        urgent.priority = 5;
        h.store.upsert_manifest(urgent).await.unwrap();

        let lazy = Manifest::interval("lazy.Job", 60);
        h.store.upsert_manifest(lazy).await.unwrap();

        h.manager.run_cycle().await.unwrap();
        let entries = queued(&h.store);
        assert_eq!(entries.len(), 2);
        let urgent_entry = entries
            .iter()
            .find(|e| e.workflow_name == "urgent.Job")
            .unwrap();
        // Work-queue priority folds the group's priority in.
        assert_eq!(urgent_entry.priority, 15);
    }
}
