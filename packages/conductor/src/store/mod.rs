//! Transactional persistence for the orchestrator entities.
//!
//! The [`Store`] trait is the only shared mutable state in the process;
//! every loop reaches it through a transactional boundary and treats
//! anything it holds in memory as a snapshot. Implementations:
//!
//! - [`PostgresStore`] — production, `sqlx` over PostgreSQL with
//!   `FOR UPDATE SKIP LOCKED` claims
//! - [`MemoryStore`] — in-process double with identical semantics, used by
//!   scenario tests
//!
//! Compare-and-set lives here: [`Store::transition_metadata`] refuses any
//! move that is not a forward edge of the state DAG, and loses races with
//! [`StoreError::StateConflict`] instead of clobbering history.

pub mod background_job;
pub mod dead_letter;
pub mod manifest;
pub mod manifest_group;
pub mod memory;
pub mod metadata;
pub mod postgres;
pub mod work_queue;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

pub use background_job::BackgroundJob;
pub use dead_letter::{DeadLetter, DeadLetterResolution, DeadLetterStatus, MAX_RETRIES_EXCEEDED};
pub use manifest::{Manifest, ScheduleType};
pub use manifest_group::ManifestGroup;
pub use memory::MemoryStore;
pub use metadata::{failure_reason, FailureDetail, Metadata, MetadataPatch, WorkflowState};
pub use postgres::PostgresStore;
pub use work_queue::{QueueStatus, WorkQueueEntry};

/// Store failure modes, with the propagation policy attached to each.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A concurrent mutation won the race. The loser skips this row for the
    /// cycle; no failure is recorded.
    #[error("state conflict on {entity} {id}: expected {expected}, found {found}")]
    StateConflict {
        entity: &'static str,
        id: Uuid,
        expected: String,
        found: String,
    },

    /// External ids are unique per deployment.
    #[error("duplicate external id {0}")]
    DuplicateExternalId(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    /// The requested metadata move is not a forward edge.
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        from: WorkflowState,
        to: WorkflowState,
    },

    /// A structural invariant would be violated (patch closure, parent
    /// cycles, awaiting-letter uniqueness).
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// Transport or database fault; retried on the next cycle.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Whether the next cycle may plausibly succeed without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }
}

/// Outcome of a guarded manifest enqueue.
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// The work-queue row was appended and `last_enqueued_at` advanced.
    Enqueued(WorkQueueEntry),
    /// The manifest changed since candidate selection; skipped this cycle.
    Conflict,
}

/// Transactional API over the §3 entities. One call = one unit of work;
/// nothing is cached across calls.
#[async_trait]
pub trait Store: Send + Sync {
    // ---- manifests -------------------------------------------------------

    /// Insert or update a manifest by `external_id`. Scheduling state
    /// (`last_successful_run_at`, `last_enqueued_at`) and identity of an
    /// existing row are preserved.
    async fn upsert_manifest(&self, manifest: Manifest) -> Result<Manifest, StoreError>;

    async fn get_manifest(&self, id: Uuid) -> Result<Option<Manifest>, StoreError>;

    async fn get_manifest_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Manifest>, StoreError>;

    async fn list_manifests(&self) -> Result<Vec<Manifest>, StoreError>;

    /// Disable a manifest with a persisted note (invalid schedule, operator
    /// action). Other manifests are unaffected.
    async fn disable_manifest(&self, id: Uuid, note: &str) -> Result<(), StoreError>;

    /// Enabled manifests with no `Pending`/`InProgress` attempt and no
    /// outstanding `Queued` work row, ordered by `(priority desc,
    /// last_enqueued_at asc nulls first, id)`. Due-ness is evaluated by the
    /// caller against the schedule evaluator.
    async fn list_schedulable_manifests(&self, limit: i64) -> Result<Vec<Manifest>, StoreError>;

    /// Transactionally re-check eligibility and enqueue: verifies the
    /// manifest is still enabled and `last_enqueued_at` still matches
    /// `expected_last_enqueued_at`, appends `entry`, and advances
    /// `last_enqueued_at` to `now`. Returns [`EnqueueOutcome::Conflict`]
    /// when the recheck fails.
    async fn enqueue_manifest_run(
        &self,
        manifest_id: Uuid,
        expected_last_enqueued_at: Option<DateTime<Utc>>,
        entry: WorkQueueEntry,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, StoreError>;

    /// Record a successful run: sets `last_successful_run_at = at`, which
    /// also resets the derived retry count.
    async fn record_successful_run(
        &self,
        manifest_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // ---- groups ----------------------------------------------------------

    /// Insert or update a group by unique name.
    async fn upsert_group(&self, group: ManifestGroup) -> Result<ManifestGroup, StoreError>;

    async fn get_group(&self, id: Uuid) -> Result<Option<ManifestGroup>, StoreError>;

    async fn list_groups(&self) -> Result<Vec<ManifestGroup>, StoreError>;

    /// Metadatas in `{Pending, InProgress}` whose manifest belongs to the
    /// group.
    async fn count_active_jobs(&self, group_id: Uuid) -> Result<i64, StoreError>;

    // ---- work queue ------------------------------------------------------

    /// Append a dispatch request (triggers, retries, dead-letter retries).
    async fn enqueue_work(&self, entry: WorkQueueEntry) -> Result<WorkQueueEntry, StoreError>;

    /// Atomically select up to `limit` claimable rows, flip them
    /// `Queued → Dispatched`, and return them. Safe under concurrent
    /// pollers; returns fewer rows rather than blocking. Order:
    /// `(priority desc, created_at asc)`.
    async fn claim_work_queue(
        &self,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkQueueEntry>, StoreError>;

    /// Roll a claim back (`Dispatched → Queued`) with an anti-starvation
    /// priority bump.
    async fn release_claim(&self, id: Uuid, priority_bump: i32) -> Result<(), StoreError>;

    /// One-shot `Queued → Cancelled`. Returns whether the row was still
    /// queued.
    async fn cancel_work_entry(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn get_work_entry(&self, id: Uuid) -> Result<Option<WorkQueueEntry>, StoreError>;

    /// Startup recovery: any `Dispatched` row with no execution record is a
    /// claim that died before dispatch completed; put it back to `Queued`.
    async fn recover_orphaned_claims(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    // ---- metadata --------------------------------------------------------

    /// Insert-only append. Fails on duplicate external id; rejects parent
    /// references that do not exist or would self-reference.
    async fn append_metadata(&self, row: Metadata) -> Result<Metadata, StoreError>;

    /// Compare-and-set transition. Fails with [`StoreError::StateConflict`]
    /// when the current state differs from `from`, and with
    /// [`StoreError::IllegalTransition`] when `from → to` is not a forward
    /// edge.
    async fn transition_metadata(
        &self,
        id: Uuid,
        from: WorkflowState,
        to: WorkflowState,
        patch: MetadataPatch,
    ) -> Result<Metadata, StoreError>;

    async fn get_metadata(&self, id: Uuid) -> Result<Option<Metadata>, StoreError>;

    /// Latest `Completed` attempt for a manifest, by `end_time`.
    async fn latest_completed_metadata(
        &self,
        manifest_id: Uuid,
    ) -> Result<Option<Metadata>, StoreError>;

    /// `InProgress` attempts whose per-manifest timeout (or the default,
    /// whichever is larger) has elapsed at `now`.
    async fn list_timed_out(
        &self,
        now: DateTime<Utc>,
        default_timeout: Duration,
    ) -> Result<Vec<Metadata>, StoreError>;

    /// Derived retry count: failed attempts started after `since` (all
    /// failed attempts when `since` is `None`).
    async fn count_recent_failures(
        &self,
        manifest_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> Result<i64, StoreError>;

    /// Whether the manifest has work in flight: a `Queued` work row or a
    /// `Pending`/`InProgress` attempt. Dead-letter promotion holds off
    /// while this is true.
    async fn has_pending_work(&self, manifest_id: Uuid) -> Result<bool, StoreError>;

    /// Recent attempts for a manifest, newest first.
    async fn recent_metadata(
        &self,
        manifest_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Metadata>, StoreError>;

    /// Delete one batch of terminal attempts older than `older_than`.
    /// Never deletes the retry target of an unresolved dead letter, nor the
    /// parent of a non-terminal attempt. Returns rows deleted; callers loop
    /// until zero.
    async fn purge_terminal_metadata(
        &self,
        older_than: DateTime<Utc>,
        batch_size: i64,
    ) -> Result<u64, StoreError>;

    // ---- dead letters ----------------------------------------------------

    /// The `AwaitingIntervention` letter for a manifest, if any.
    async fn awaiting_intervention(
        &self,
        manifest_id: Uuid,
    ) -> Result<Option<DeadLetter>, StoreError>;

    async fn list_dead_letters(
        &self,
        status: Option<DeadLetterStatus>,
    ) -> Result<Vec<DeadLetter>, StoreError>;

    /// Create an awaiting letter, or return the existing one — at most one
    /// `AwaitingIntervention` row per manifest at any time.
    async fn upsert_dead_letter(&self, letter: DeadLetter) -> Result<DeadLetter, StoreError>;

    /// Resolve an awaiting letter. Fails with `StateConflict` when the
    /// letter is already resolved.
    async fn resolve_dead_letter(
        &self,
        id: Uuid,
        resolution: DeadLetterResolution,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<DeadLetter, StoreError>;

    /// Attach the execution record created for a dead-letter retry row.
    async fn attach_retry_metadata(
        &self,
        dead_letter_id: Uuid,
        metadata_id: Uuid,
    ) -> Result<(), StoreError>;

    async fn get_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetter>, StoreError>;

    /// Delete resolved letters older than `older_than`.
    async fn purge_resolved_dead_letters(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    // ---- background jobs -------------------------------------------------

    async fn record_background_job(&self, job: BackgroundJob) -> Result<(), StoreError>;

    async fn complete_background_job(
        &self,
        task_handle: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn find_background_job_by_metadata(
        &self,
        metadata_id: Uuid,
    ) -> Result<Option<BackgroundJob>, StoreError>;
}

/// Shared store handle.
pub type SharedStore = std::sync::Arc<dyn Store>;
