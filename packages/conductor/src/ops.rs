//! Operator surface: explicit triggers, cancellation, and dead-letter
//! actions.
//!
//! Everything the dashboard or an admin CLI needs that is not part of the
//! periodic loops goes through this controller, so the loops themselves
//! never grow ad-hoc entry points.

use std::sync::Arc;

use junction::TaskServer;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::dag::{self, DagLayout};
use crate::kernel::Clock;
use crate::store::{
    DeadLetter, DeadLetterResolution, DeadLetterStatus, Metadata, MetadataPatch, SharedStore,
    Store, StoreError, WorkQueueEntry, WorkflowState,
};

#[derive(Debug, thiserror::Error)]
pub enum OpsError {
    #[error("manifest {0} not found")]
    ManifestNotFound(String),

    #[error("manifest {0} is disabled")]
    ManifestDisabled(String),

    #[error("dead letter {0} not found")]
    DeadLetterNotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dag(#[from] dag::DagError),
}

/// Manual-control facade over the store and task server.
pub struct Controller {
    store: SharedStore,
    task_server: Arc<dyn TaskServer>,
    clock: Arc<dyn Clock>,
}

impl Controller {
    pub fn new(store: SharedStore, task_server: Arc<dyn TaskServer>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            task_server,
            clock,
        }
    }

    /// Enqueue one run of a manifest, with an optional input override.
    /// This is how `OnDemand` manifests run at all.
    pub async fn trigger(
        &self,
        external_id: &str,
        input: Option<Value>,
    ) -> Result<WorkQueueEntry, OpsError> {
        let manifest = self
            .store
            .get_manifest_by_external_id(external_id)
            .await?
            .ok_or_else(|| OpsError::ManifestNotFound(external_id.to_string()))?;
        if !manifest.is_enabled {
            return Err(OpsError::ManifestDisabled(external_id.to_string()));
        }

        let now = self.clock.now();
        let mut entry = WorkQueueEntry::for_manifest(&manifest, manifest.priority, now);
        if let Some(input) = input {
            entry.input_json = Some(input);
        }
        let entry = self.store.enqueue_work(entry).await?;
        info!(manifest = %external_id, entry_id = %entry.id, "manifest triggered");
        Ok(entry)
    }

    /// Enqueue one run per input payload.
    pub async fn schedule_many(
        &self,
        external_id: &str,
        inputs: Vec<Value>,
    ) -> Result<Vec<WorkQueueEntry>, OpsError> {
        let mut entries = Vec::with_capacity(inputs.len());
        for input in inputs {
            entries.push(self.trigger(external_id, Some(input)).await?);
        }
        Ok(entries)
    }

    /// Cancel an execution: transition any non-terminal record to
    /// `Cancelled` and best-effort cancel the task-server handle. A
    /// cancelled record never becomes `Completed` or `Failed`.
    pub async fn cancel_execution(&self, metadata_id: Uuid) -> Result<bool, OpsError> {
        let Some(row) = self.store.get_metadata(metadata_id).await? else {
            return Ok(false);
        };
        if row.workflow_state.is_terminal() {
            return Ok(false);
        }

        let now = self.clock.now();
        let cancelled = match self
            .store
            .transition_metadata(
                metadata_id,
                row.workflow_state,
                WorkflowState::Cancelled,
                MetadataPatch::cancelled(now),
            )
            .await
        {
            Ok(_) => true,
            Err(StoreError::StateConflict { .. }) => false,
            Err(e) => return Err(e.into()),
        };

        if let Some(job) = self.store.find_background_job_by_metadata(metadata_id).await? {
            let _ = self
                .task_server
                .cancel(&junction::TaskHandle::new(job.task_handle))
                .await;
        }
        if cancelled {
            info!(metadata_id = %metadata_id, "execution cancelled");
        }
        Ok(cancelled)
    }

    /// Cancel a queue row that has not been dispatched yet.
    pub async fn cancel_queued(&self, entry_id: Uuid) -> Result<bool, OpsError> {
        Ok(self.store.cancel_work_entry(entry_id).await?)
    }

    /// Retry a parked manifest: append a fresh queue row, mark the letter
    /// `Retried`. The execution record for the retry is attached to the
    /// letter once the dispatcher creates it.
    pub async fn retry_dead_letter(
        &self,
        dead_letter_id: Uuid,
        note: Option<String>,
    ) -> Result<WorkQueueEntry, OpsError> {
        let letter = self
            .store
            .get_dead_letter(dead_letter_id)
            .await?
            .ok_or(OpsError::DeadLetterNotFound(dead_letter_id))?;
        let manifest = self
            .store
            .get_manifest(letter.manifest_id)
            .await?
            .ok_or_else(|| OpsError::ManifestNotFound(letter.manifest_id.to_string()))?;

        let now = self.clock.now();
        self.store
            .resolve_dead_letter(dead_letter_id, DeadLetterResolution::Retry, note, now)
            .await?;

        let mut entry = WorkQueueEntry::for_manifest(&manifest, manifest.priority, now);
        entry.dead_letter_id = Some(dead_letter_id);
        let entry = self.store.enqueue_work(entry).await?;
        info!(
            dead_letter_id = %dead_letter_id,
            manifest = %manifest.external_id,
            entry_id = %entry.id,
            "dead letter retried"
        );
        Ok(entry)
    }

    /// Acknowledge a parked manifest with an operator note. Does not
    /// unblock retries; a new manual trigger is required.
    pub async fn acknowledge_dead_letter(
        &self,
        dead_letter_id: Uuid,
        note: Option<String>,
    ) -> Result<DeadLetter, OpsError> {
        let letter = self
            .store
            .resolve_dead_letter(
                dead_letter_id,
                DeadLetterResolution::Acknowledge,
                note,
                self.clock.now(),
            )
            .await?;
        info!(dead_letter_id = %dead_letter_id, "dead letter acknowledged");
        Ok(letter)
    }

    /// Dashboard feed: dead letters by status.
    pub async fn dead_letters(
        &self,
        status: Option<DeadLetterStatus>,
    ) -> Result<Vec<DeadLetter>, OpsError> {
        Ok(self.store.list_dead_letters(status).await?)
    }

    /// Dashboard feed: recent attempts for a manifest, newest first.
    pub async fn recent_runs(
        &self,
        external_id: &str,
        limit: i64,
    ) -> Result<Vec<Metadata>, OpsError> {
        let manifest = self
            .store
            .get_manifest_by_external_id(external_id)
            .await?
            .ok_or_else(|| OpsError::ManifestNotFound(external_id.to_string()))?;
        Ok(self.store.recent_metadata(manifest.id, limit).await?)
    }

    /// Dashboard feed: the validated, reproducibly-ordered DAG layout.
    pub async fn dag_snapshot(&self) -> Result<DagLayout, OpsError> {
        let groups = self.store.list_groups().await?;
        let manifests = self.store.list_manifests().await?;
        let graph = dag::build_graph(&groups, &manifests)?;
        let layers = dag::validate(&graph)?;
        Ok(dag::layout(&graph, layers))
    }
}
