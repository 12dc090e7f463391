//! In-memory store with the same semantics as the PostgreSQL store.
//!
//! Used by scenario tests and local experiments. Every operation takes the
//! single interior lock, so the claim and compare-and-set guarantees hold
//! under concurrent callers just as they do with row locks.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::{
    BackgroundJob, DeadLetter, DeadLetterResolution, DeadLetterStatus, EnqueueOutcome, Manifest,
    ManifestGroup, Metadata, MetadataPatch, QueueStatus, Store, StoreError, WorkQueueEntry,
    WorkflowState,
};

#[derive(Default)]
struct Inner {
    manifests: HashMap<Uuid, Manifest>,
    groups: HashMap<Uuid, ManifestGroup>,
    metadata: HashMap<Uuid, Metadata>,
    work_queue: HashMap<Uuid, WorkQueueEntry>,
    dead_letters: HashMap<Uuid, DeadLetter>,
    background_jobs: HashMap<Uuid, BackgroundJob>,
}

/// Lock-serialized in-memory [`Store`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Test helper: every metadata row, unordered.
    pub fn all_metadata(&self) -> Vec<Metadata> {
        self.lock().metadata.values().cloned().collect()
    }

    /// Test helper: every work-queue row, unordered.
    pub fn all_work_entries(&self) -> Vec<WorkQueueEntry> {
        self.lock().work_queue.values().cloned().collect()
    }
}

fn active_manifest_ids(inner: &Inner) -> std::collections::HashSet<Uuid> {
    inner
        .metadata
        .values()
        .filter(|m| m.workflow_state.is_active())
        .filter_map(|m| m.manifest_id)
        .collect()
}

#[async_trait]
impl Store for MemoryStore {
    // ---- manifests -------------------------------------------------------

    async fn upsert_manifest(&self, manifest: Manifest) -> Result<Manifest, StoreError> {
        let mut inner = self.lock();
        let existing = inner
            .manifests
            .values()
            .find(|m| m.external_id == manifest.external_id)
            .cloned();

        let stored = match existing {
            Some(current) => {
                let mut updated = manifest;
                updated.id = current.id;
                updated.created_at = current.created_at;
                updated.last_successful_run_at = current.last_successful_run_at;
                updated.last_enqueued_at = current.last_enqueued_at;
                updated.updated_at = Utc::now();
                updated
            }
            None => manifest,
        };
        inner.manifests.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_manifest(&self, id: Uuid) -> Result<Option<Manifest>, StoreError> {
        Ok(self.lock().manifests.get(&id).cloned())
    }

    async fn get_manifest_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Manifest>, StoreError> {
        Ok(self
            .lock()
            .manifests
            .values()
            .find(|m| m.external_id == external_id)
            .cloned())
    }

    async fn list_manifests(&self) -> Result<Vec<Manifest>, StoreError> {
        let mut manifests: Vec<_> = self.lock().manifests.values().cloned().collect();
        manifests.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        Ok(manifests)
    }

    async fn disable_manifest(&self, id: Uuid, note: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let manifest = inner.manifests.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "manifest",
            id,
        })?;
        manifest.is_enabled = false;
        manifest.disabled_note = Some(note.to_string());
        manifest.updated_at = Utc::now();
        Ok(())
    }

    async fn list_schedulable_manifests(&self, limit: i64) -> Result<Vec<Manifest>, StoreError> {
        let inner = self.lock();
        let busy = active_manifest_ids(&inner);
        let queued: std::collections::HashSet<Uuid> = inner
            .work_queue
            .values()
            .filter(|e| e.status == QueueStatus::Queued)
            .filter_map(|e| e.manifest_id)
            .collect();
        let mut candidates: Vec<_> = inner
            .manifests
            .values()
            .filter(|m| m.is_enabled && !busy.contains(&m.id) && !queued.contains(&m.id))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| match (a.last_enqueued_at, b.last_enqueued_at) {
                    (None, None) => std::cmp::Ordering::Equal,
                    (None, Some(_)) => std::cmp::Ordering::Less,
                    (Some(_), None) => std::cmp::Ordering::Greater,
                    (Some(x), Some(y)) => x.cmp(&y),
                })
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates.truncate(limit.max(0) as usize);
        Ok(candidates)
    }

    async fn enqueue_manifest_run(
        &self,
        manifest_id: Uuid,
        expected_last_enqueued_at: Option<DateTime<Utc>>,
        entry: WorkQueueEntry,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, StoreError> {
        let mut inner = self.lock();
        let Some(manifest) = inner.manifests.get_mut(&manifest_id) else {
            return Ok(EnqueueOutcome::Conflict);
        };
        if !manifest.is_enabled || manifest.last_enqueued_at != expected_last_enqueued_at {
            return Ok(EnqueueOutcome::Conflict);
        }
        manifest.last_enqueued_at = Some(now);
        manifest.updated_at = now;
        inner.work_queue.insert(entry.id, entry.clone());
        Ok(EnqueueOutcome::Enqueued(entry))
    }

    async fn record_successful_run(
        &self,
        manifest_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let manifest = inner
            .manifests
            .get_mut(&manifest_id)
            .ok_or(StoreError::NotFound {
                entity: "manifest",
                id: manifest_id,
            })?;
        manifest.last_successful_run_at = Some(at);
        manifest.updated_at = at;
        Ok(())
    }

    // ---- groups ----------------------------------------------------------

    async fn upsert_group(&self, group: ManifestGroup) -> Result<ManifestGroup, StoreError> {
        let mut inner = self.lock();
        let existing = inner
            .groups
            .values()
            .find(|g| g.name == group.name)
            .cloned();
        let stored = match existing {
            Some(current) => {
                let mut updated = group;
                updated.id = current.id;
                updated.created_at = current.created_at;
                updated.updated_at = Utc::now();
                updated
            }
            None => group,
        };
        inner.groups.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_group(&self, id: Uuid) -> Result<Option<ManifestGroup>, StoreError> {
        Ok(self.lock().groups.get(&id).cloned())
    }

    async fn list_groups(&self) -> Result<Vec<ManifestGroup>, StoreError> {
        let mut groups: Vec<_> = self.lock().groups.values().cloned().collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    async fn count_active_jobs(&self, group_id: Uuid) -> Result<i64, StoreError> {
        let inner = self.lock();
        let member_ids: std::collections::HashSet<Uuid> = inner
            .manifests
            .values()
            .filter(|m| m.manifest_group_id == Some(group_id))
            .map(|m| m.id)
            .collect();
        Ok(inner
            .metadata
            .values()
            .filter(|m| m.workflow_state.is_active())
            .filter(|m| m.manifest_id.map(|id| member_ids.contains(&id)).unwrap_or(false))
            .count() as i64)
    }

    // ---- work queue ------------------------------------------------------

    async fn enqueue_work(&self, entry: WorkQueueEntry) -> Result<WorkQueueEntry, StoreError> {
        let mut inner = self.lock();
        inner.work_queue.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn claim_work_queue(
        &self,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkQueueEntry>, StoreError> {
        let mut inner = self.lock();
        let mut claimable: Vec<Uuid> = inner
            .work_queue
            .values()
            .filter(|e| e.is_claimable(now))
            .map(|e| e.id)
            .collect();
        claimable.sort_by(|a, b| {
            let ea = &inner.work_queue[a];
            let eb = &inner.work_queue[b];
            eb.priority
                .cmp(&ea.priority)
                .then_with(|| ea.created_at.cmp(&eb.created_at))
                .then_with(|| ea.id.cmp(&eb.id))
        });
        claimable.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(claimable.len());
        for id in claimable {
            let entry = inner.work_queue.get_mut(&id).expect("row exists");
            entry.status = QueueStatus::Dispatched;
            entry.dispatched_at = Some(now);
            claimed.push(entry.clone());
        }
        Ok(claimed)
    }

    async fn release_claim(&self, id: Uuid, priority_bump: i32) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let entry = inner.work_queue.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "work_queue",
            id,
        })?;
        if entry.status != QueueStatus::Dispatched {
            return Err(StoreError::StateConflict {
                entity: "work_queue",
                id,
                expected: "Dispatched".into(),
                found: format!("{:?}", entry.status),
            });
        }
        entry.status = QueueStatus::Queued;
        entry.dispatched_at = None;
        entry.priority += priority_bump;
        Ok(())
    }

    async fn cancel_work_entry(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.work_queue.get_mut(&id) {
            Some(entry) if entry.status == QueueStatus::Queued => {
                entry.status = QueueStatus::Cancelled;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn get_work_entry(&self, id: Uuid) -> Result<Option<WorkQueueEntry>, StoreError> {
        Ok(self.lock().work_queue.get(&id).cloned())
    }

    async fn recover_orphaned_claims(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let dispatched_with_metadata: std::collections::HashSet<Uuid> = inner
            .metadata
            .values()
            .filter_map(|m| m.work_queue_id)
            .collect();
        let orphaned: Vec<Uuid> = inner
            .work_queue
            .values()
            .filter(|e| {
                e.status == QueueStatus::Dispatched && !dispatched_with_metadata.contains(&e.id)
            })
            .map(|e| e.id)
            .collect();
        let recovered = orphaned.len() as u64;
        for id in orphaned {
            let entry = inner.work_queue.get_mut(&id).expect("row exists");
            entry.status = QueueStatus::Queued;
            entry.dispatched_at = None;
            entry.available_at = now;
        }
        Ok(recovered)
    }

    // ---- metadata --------------------------------------------------------

    async fn append_metadata(&self, row: Metadata) -> Result<Metadata, StoreError> {
        let mut inner = self.lock();
        if inner
            .metadata
            .values()
            .any(|m| m.external_id == row.external_id)
        {
            return Err(StoreError::DuplicateExternalId(row.external_id));
        }
        if let Some(parent_id) = row.parent_id {
            if parent_id == row.id {
                return Err(StoreError::Constraint(
                    "metadata cannot be its own parent".into(),
                ));
            }
            if !inner.metadata.contains_key(&parent_id) {
                return Err(StoreError::NotFound {
                    entity: "metadata",
                    id: parent_id,
                });
            }
        }
        if row.workflow_state == WorkflowState::Failed && row.failure_reason.is_none() {
            return Err(StoreError::Constraint(
                "metadata born Failed requires a failure reason".into(),
            ));
        }
        inner.metadata.insert(row.id, row.clone());
        Ok(row)
    }

    async fn transition_metadata(
        &self,
        id: Uuid,
        from: WorkflowState,
        to: WorkflowState,
        patch: MetadataPatch,
    ) -> Result<Metadata, StoreError> {
        if !from.can_transition_to(to) {
            return Err(StoreError::IllegalTransition { from, to });
        }
        patch.validate_for(to).map_err(StoreError::Constraint)?;

        let mut inner = self.lock();
        let row = inner.metadata.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "metadata",
            id,
        })?;
        if row.workflow_state != from {
            return Err(StoreError::StateConflict {
                entity: "metadata",
                id,
                expected: from.to_string(),
                found: row.workflow_state.to_string(),
            });
        }

        row.workflow_state = to;
        if let Some(start_time) = patch.start_time {
            row.start_time = start_time;
        }
        if let Some(end_time) = patch.end_time {
            row.end_time = Some(end_time);
        }
        if let Some(output) = patch.output_json {
            row.output_json = Some(output);
        }
        if let Some(failure) = patch.failure {
            row.apply_failure(failure);
        }
        Ok(row.clone())
    }

    async fn get_metadata(&self, id: Uuid) -> Result<Option<Metadata>, StoreError> {
        Ok(self.lock().metadata.get(&id).cloned())
    }

    async fn latest_completed_metadata(
        &self,
        manifest_id: Uuid,
    ) -> Result<Option<Metadata>, StoreError> {
        Ok(self
            .lock()
            .metadata
            .values()
            .filter(|m| {
                m.manifest_id == Some(manifest_id)
                    && m.workflow_state == WorkflowState::Completed
            })
            .max_by_key(|m| m.end_time)
            .cloned())
    }

    async fn list_timed_out(
        &self,
        now: DateTime<Utc>,
        default_timeout: Duration,
    ) -> Result<Vec<Metadata>, StoreError> {
        let inner = self.lock();
        let mut timed_out: Vec<Metadata> = inner
            .metadata
            .values()
            .filter(|m| m.workflow_state == WorkflowState::InProgress)
            .filter(|m| {
                let timeout = m
                    .manifest_id
                    .and_then(|id| inner.manifests.get(&id))
                    .map(|manifest| manifest.effective_timeout(default_timeout))
                    .unwrap_or(default_timeout);
                now - m.start_time > timeout
            })
            .cloned()
            .collect();
        timed_out.sort_by_key(|m| m.start_time);
        Ok(timed_out)
    }

    async fn count_recent_failures(
        &self,
        manifest_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> Result<i64, StoreError> {
        Ok(self
            .lock()
            .metadata
            .values()
            .filter(|m| {
                m.manifest_id == Some(manifest_id) && m.workflow_state == WorkflowState::Failed
            })
            .filter(|m| match since {
                Some(since) => m.start_time > since,
                None => true,
            })
            .count() as i64)
    }

    async fn has_pending_work(&self, manifest_id: Uuid) -> Result<bool, StoreError> {
        let inner = self.lock();
        let queued = inner
            .work_queue
            .values()
            .any(|e| e.manifest_id == Some(manifest_id) && e.status == QueueStatus::Queued);
        let active = inner
            .metadata
            .values()
            .any(|m| m.manifest_id == Some(manifest_id) && m.workflow_state.is_active());
        Ok(queued || active)
    }

    async fn recent_metadata(
        &self,
        manifest_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Metadata>, StoreError> {
        let mut rows: Vec<_> = self
            .lock()
            .metadata
            .values()
            .filter(|m| m.manifest_id == Some(manifest_id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn purge_terminal_metadata(
        &self,
        older_than: DateTime<Utc>,
        batch_size: i64,
    ) -> Result<u64, StoreError> {
        let mut inner = self.lock();

        let protected_retry_targets: std::collections::HashSet<Uuid> = inner
            .dead_letters
            .values()
            .filter_map(|dl| dl.retry_metadata_id)
            .collect();
        let protected_parents: std::collections::HashSet<Uuid> = inner
            .metadata
            .values()
            .filter(|m| m.workflow_state.is_active())
            .filter_map(|m| m.parent_id)
            .collect();

        let mut victims: Vec<(DateTime<Utc>, Uuid)> = inner
            .metadata
            .values()
            .filter(|m| m.workflow_state.is_terminal())
            .filter(|m| m.end_time.map(|t| t < older_than).unwrap_or(false))
            .filter(|m| !protected_retry_targets.contains(&m.id))
            .filter(|m| !protected_parents.contains(&m.id))
            .map(|m| (m.end_time.expect("terminal has end_time"), m.id))
            .collect();
        victims.sort();
        victims.truncate(batch_size.max(0) as usize);

        let deleted = victims.len() as u64;
        for (_, id) in victims {
            inner.metadata.remove(&id);
        }
        Ok(deleted)
    }

    // ---- dead letters ----------------------------------------------------

    async fn awaiting_intervention(
        &self,
        manifest_id: Uuid,
    ) -> Result<Option<DeadLetter>, StoreError> {
        Ok(self
            .lock()
            .dead_letters
            .values()
            .find(|dl| {
                dl.manifest_id == manifest_id
                    && dl.status == DeadLetterStatus::AwaitingIntervention
            })
            .cloned())
    }

    async fn list_dead_letters(
        &self,
        status: Option<DeadLetterStatus>,
    ) -> Result<Vec<DeadLetter>, StoreError> {
        let mut letters: Vec<_> = self
            .lock()
            .dead_letters
            .values()
            .filter(|dl| status.map(|s| dl.status == s).unwrap_or(true))
            .cloned()
            .collect();
        letters.sort_by_key(|dl| dl.dead_lettered_at);
        Ok(letters)
    }

    async fn upsert_dead_letter(&self, letter: DeadLetter) -> Result<DeadLetter, StoreError> {
        let mut inner = self.lock();
        if let Some(existing) = inner
            .dead_letters
            .values()
            .find(|dl| {
                dl.manifest_id == letter.manifest_id
                    && dl.status == DeadLetterStatus::AwaitingIntervention
            })
            .cloned()
        {
            return Ok(existing);
        }
        inner.dead_letters.insert(letter.id, letter.clone());
        Ok(letter)
    }

    async fn resolve_dead_letter(
        &self,
        id: Uuid,
        resolution: DeadLetterResolution,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<DeadLetter, StoreError> {
        let mut inner = self.lock();
        let letter = inner.dead_letters.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "dead_letter",
            id,
        })?;
        if letter.status != DeadLetterStatus::AwaitingIntervention {
            return Err(StoreError::StateConflict {
                entity: "dead_letter",
                id,
                expected: "AwaitingIntervention".into(),
                found: format!("{:?}", letter.status),
            });
        }
        letter.status = resolution.target_status();
        letter.resolved_at = Some(now);
        letter.resolution_note = note;
        Ok(letter.clone())
    }

    async fn attach_retry_metadata(
        &self,
        dead_letter_id: Uuid,
        metadata_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let letter = inner
            .dead_letters
            .get_mut(&dead_letter_id)
            .ok_or(StoreError::NotFound {
                entity: "dead_letter",
                id: dead_letter_id,
            })?;
        letter.retry_metadata_id = Some(metadata_id);
        Ok(())
    }

    async fn get_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetter>, StoreError> {
        Ok(self.lock().dead_letters.get(&id).cloned())
    }

    async fn purge_resolved_dead_letters(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let victims: Vec<Uuid> = inner
            .dead_letters
            .values()
            .filter(|dl| dl.status.is_resolved())
            .filter(|dl| dl.resolved_at.map(|t| t < older_than).unwrap_or(false))
            .map(|dl| dl.id)
            .collect();
        let purged = victims.len() as u64;
        for id in victims {
            inner.dead_letters.remove(&id);
        }
        Ok(purged)
    }

    // ---- background jobs -------------------------------------------------

    async fn record_background_job(&self, job: BackgroundJob) -> Result<(), StoreError> {
        self.lock().background_jobs.insert(job.id, job);
        Ok(())
    }

    async fn complete_background_job(
        &self,
        task_handle: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        for job in inner.background_jobs.values_mut() {
            if job.task_handle == task_handle && job.completed_at.is_none() {
                job.completed_at = Some(at);
            }
        }
        Ok(())
    }

    async fn find_background_job_by_metadata(
        &self,
        metadata_id: Uuid,
    ) -> Result<Option<BackgroundJob>, StoreError> {
        Ok(self
            .lock()
            .background_jobs
            .values()
            .find(|j| j.metadata_id == Some(metadata_id) && j.completed_at.is_none())
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::metadata::failure_reason;
    use crate::store::FailureDetail;

    fn store() -> MemoryStore {
        MemoryStore::new()
    }

    fn pending_metadata(manifest_id: Option<Uuid>) -> Metadata {
        let mut row = Metadata::builder()
            .name("demo.Workflow".to_string())
            .executor("test-host".to_string())
            .build();
        row.manifest_id = manifest_id;
        row
    }

    #[tokio::test]
    async fn upsert_manifest_preserves_scheduling_state() {
        let store = store();
        let mut manifest = Manifest::interval("sync.Accounts", 60);
        manifest = store.upsert_manifest(manifest).await.unwrap();

        store
            .record_successful_run(manifest.id, Utc::now())
            .await
            .unwrap();

        // Re-seed the same external id with a tweaked definition.
        let mut reseeded = Manifest::interval("sync.Accounts", 120);
        reseeded.external_id = manifest.external_id.clone();
        let stored = store.upsert_manifest(reseeded).await.unwrap();

        assert_eq!(stored.id, manifest.id);
        assert_eq!(stored.interval_seconds, Some(120));
        assert!(stored.last_successful_run_at.is_some());
    }

    #[tokio::test]
    async fn claim_is_one_shot() {
        let store = store();
        let now = Utc::now();
        let entry = WorkQueueEntry::builder()
            .workflow_name("demo.Workflow".to_string())
            .created_at(now)
            .available_at(now)
            .build();
        store.enqueue_work(entry).await.unwrap();

        let first = store.claim_work_queue(10, now).await.unwrap();
        let second = store.claim_work_queue(10, now).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(first[0].status, QueueStatus::Dispatched);
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_age() {
        let store = store();
        let now = Utc::now();
        for (priority, age_secs, name) in [(0, 30, "old-low"), (5, 10, "high"), (0, 60, "oldest-low")]
        {
            store
                .enqueue_work(
                    WorkQueueEntry::builder()
                        .workflow_name(name.to_string())
                        .priority(priority)
                        .created_at(now - Duration::seconds(age_secs))
                        .available_at(now - Duration::seconds(age_secs))
                        .build(),
                )
                .await
                .unwrap();
        }
        let claimed = store.claim_work_queue(10, now).await.unwrap();
        let names: Vec<_> = claimed.iter().map(|e| e.workflow_name.as_str()).collect();
        assert_eq!(names, vec!["high", "oldest-low", "old-low"]);
    }

    #[tokio::test]
    async fn transition_cas_detects_conflicts() {
        let store = store();
        let row = store
            .append_metadata(pending_metadata(None))
            .await
            .unwrap();

        let now = Utc::now();
        store
            .transition_metadata(
                row.id,
                WorkflowState::Pending,
                WorkflowState::InProgress,
                MetadataPatch::started(now),
            )
            .await
            .unwrap();

        // A second Pending -> InProgress loses the race.
        let err = store
            .transition_metadata(
                row.id,
                WorkflowState::Pending,
                WorkflowState::InProgress,
                MetadataPatch::started(now),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StateConflict { .. }));
    }

    #[tokio::test]
    async fn terminal_rows_never_change() {
        let store = store();
        let row = store.append_metadata(pending_metadata(None)).await.unwrap();
        let now = Utc::now();
        store
            .transition_metadata(
                row.id,
                WorkflowState::Pending,
                WorkflowState::InProgress,
                MetadataPatch::started(now),
            )
            .await
            .unwrap();
        store
            .transition_metadata(
                row.id,
                WorkflowState::InProgress,
                WorkflowState::Completed,
                MetadataPatch::completed(now, None),
            )
            .await
            .unwrap();

        let err = store
            .transition_metadata(
                row.id,
                WorkflowState::Completed,
                WorkflowState::Failed,
                MetadataPatch::failed(now, FailureDetail::with_reason("late")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn duplicate_external_id_is_rejected() {
        let store = store();
        let row = pending_metadata(None);
        let mut clone = pending_metadata(None);
        clone.external_id = row.external_id.clone();
        store.append_metadata(row).await.unwrap();
        let err = store.append_metadata(clone).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateExternalId(_)));
    }

    #[tokio::test]
    async fn at_most_one_awaiting_letter_per_manifest() {
        let store = store();
        let manifest_id = Uuid::new_v4();
        let first = store
            .upsert_dead_letter(DeadLetter::awaiting(manifest_id, "x", 3, Utc::now()))
            .await
            .unwrap();
        let second = store
            .upsert_dead_letter(DeadLetter::awaiting(manifest_id, "y", 4, Utc::now()))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(
            store
                .list_dead_letters(Some(DeadLetterStatus::AwaitingIntervention))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn resolved_letters_cannot_be_resolved_again() {
        let store = store();
        let letter = store
            .upsert_dead_letter(DeadLetter::awaiting(Uuid::new_v4(), "x", 3, Utc::now()))
            .await
            .unwrap();
        store
            .resolve_dead_letter(
                letter.id,
                DeadLetterResolution::Acknowledge,
                Some("looked at it".into()),
                Utc::now(),
            )
            .await
            .unwrap();
        let err = store
            .resolve_dead_letter(letter.id, DeadLetterResolution::Retry, None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StateConflict { .. }));
    }

    #[tokio::test]
    async fn purge_skips_protected_rows() {
        let store = store();
        let now = Utc::now();
        let old = now - Duration::days(60);

        // A terminal row old enough to purge.
        let mut purgeable = pending_metadata(None);
        purgeable.workflow_state = WorkflowState::Completed;
        purgeable.end_time = Some(old);
        let purgeable = store.append_metadata(purgeable).await.unwrap();

        // A terminal row protected as a dead-letter retry target.
        let mut protected = pending_metadata(None);
        protected.workflow_state = WorkflowState::Completed;
        protected.end_time = Some(old);
        let protected = store.append_metadata(protected).await.unwrap();
        let letter = store
            .upsert_dead_letter(DeadLetter::awaiting(Uuid::new_v4(), "x", 3, now))
            .await
            .unwrap();
        store
            .attach_retry_metadata(letter.id, protected.id)
            .await
            .unwrap();

        let deleted = store.purge_terminal_metadata(now, 100).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_metadata(purgeable.id).await.unwrap().is_none());
        assert!(store.get_metadata(protected.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn purge_protects_parents_of_active_children() {
        let store = store();
        let now = Utc::now();
        let old = now - Duration::days(60);

        let mut parent = pending_metadata(None);
        parent.workflow_state = WorkflowState::Completed;
        parent.end_time = Some(old);
        let parent = store.append_metadata(parent).await.unwrap();

        let mut child = pending_metadata(None);
        child.parent_id = Some(parent.id);
        store.append_metadata(child).await.unwrap();

        let deleted = store.purge_terminal_metadata(now, 100).await.unwrap();
        assert_eq!(deleted, 0);
    }

    #[tokio::test]
    async fn orphaned_claims_are_recovered() {
        let store = store();
        let now = Utc::now();
        let entry = store
            .enqueue_work(
                WorkQueueEntry::builder()
                    .workflow_name("demo.Workflow".to_string())
                    .created_at(now)
                    .available_at(now)
                    .build(),
            )
            .await
            .unwrap();
        let claimed = store.claim_work_queue(1, now).await.unwrap();
        assert_eq!(claimed.len(), 1);

        // Crash before any metadata was written: the claim is orphaned.
        let recovered = store.recover_orphaned_claims(now).await.unwrap();
        assert_eq!(recovered, 1);
        let entry = store.get_work_entry(entry.id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Queued);
    }

    #[tokio::test]
    async fn recovery_leaves_real_dispatches_alone() {
        let store = store();
        let now = Utc::now();
        let entry = store
            .enqueue_work(
                WorkQueueEntry::builder()
                    .workflow_name("demo.Workflow".to_string())
                    .created_at(now)
                    .available_at(now)
                    .build(),
            )
            .await
            .unwrap();
        store.claim_work_queue(1, now).await.unwrap();

        let mut row = pending_metadata(None);
        row.work_queue_id = Some(entry.id);
        store.append_metadata(row).await.unwrap();

        assert_eq!(store.recover_orphaned_claims(now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn count_recent_failures_respects_since() {
        let store = store();
        let manifest = store
            .upsert_manifest(Manifest::on_demand("demo.Workflow"))
            .await
            .unwrap();
        let now = Utc::now();

        for age_secs in [300, 200, 100] {
            let mut row = pending_metadata(Some(manifest.id));
            row.workflow_state = WorkflowState::Failed;
            row.failure_reason = Some(failure_reason::TIMEOUT.to_string());
            row.start_time = now - Duration::seconds(age_secs);
            row.end_time = Some(now - Duration::seconds(age_secs));
            store.append_metadata(row).await.unwrap();
        }

        assert_eq!(
            store.count_recent_failures(manifest.id, None).await.unwrap(),
            3
        );
        assert_eq!(
            store
                .count_recent_failures(manifest.id, Some(now - Duration::seconds(250)))
                .await
                .unwrap(),
            2
        );
    }
}
