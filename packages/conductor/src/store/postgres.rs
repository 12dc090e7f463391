//! PostgreSQL-backed store.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent pollers never block on
//! each other, and the guarded enqueue re-checks eligibility inside a row
//! lock. Metadata transitions are compare-and-set `UPDATE ... WHERE
//! workflow_state = $from` statements; a zero-row update is diagnosed into
//! `NotFound` or `StateConflict`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPool;
use uuid::Uuid;

use super::{
    BackgroundJob, DeadLetter, DeadLetterResolution, DeadLetterStatus, EnqueueOutcome, Manifest,
    ManifestGroup, Metadata, MetadataPatch, Store, StoreError, WorkQueueEntry, WorkflowState,
};

const MANIFEST_COLUMNS: &str = "id, external_id, name, properties_json, properties_type_name, \
     schedule_type, cron_expression, interval_seconds, max_retries, timeout_seconds, \
     retry_backoff_multiplier, default_retry_delay_seconds, max_retry_delay_seconds, \
     manifest_group_id, depends_on_manifest_id, is_enabled, disabled_note, priority, \
     last_successful_run_at, last_enqueued_at, created_at, updated_at";

const GROUP_COLUMNS: &str = "id, name, max_active_jobs, priority, is_enabled, created_at, updated_at";

const METADATA_COLUMNS: &str = "id, external_id, manifest_id, parent_id, work_queue_id, name, \
     executor, workflow_state, scheduled_time, start_time, end_time, failure_step, \
     failure_exception, failure_reason, stack_trace, input_json, output_json";

const WORK_QUEUE_COLUMNS: &str = "id, workflow_name, input_json, input_type_name, manifest_id, \
     dead_letter_id, priority, status, created_at, available_at, dispatched_at";

const DEAD_LETTER_COLUMNS: &str = "id, manifest_id, reason, retry_count_at_dead_letter, status, \
     dead_lettered_at, resolved_at, resolution_note, retry_metadata_id";

/// Production [`Store`] over a `sqlx` PostgreSQL pool.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Constraint(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn map_unique_violation(error: sqlx::Error, external_id: &str) -> StoreError {
        if let sqlx::Error::Database(ref db) = error {
            if db.constraint().is_some_and(|c| c.contains("external_id")) {
                return StoreError::DuplicateExternalId(external_id.to_string());
            }
        }
        StoreError::Database(error)
    }
}

#[async_trait]
impl Store for PostgresStore {
    // ---- manifests -------------------------------------------------------

    async fn upsert_manifest(&self, manifest: Manifest) -> Result<Manifest, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO manifests ({MANIFEST_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21, $22)
            ON CONFLICT (external_id) DO UPDATE SET
                name = EXCLUDED.name,
                properties_json = EXCLUDED.properties_json,
                properties_type_name = EXCLUDED.properties_type_name,
                schedule_type = EXCLUDED.schedule_type,
                cron_expression = EXCLUDED.cron_expression,
                interval_seconds = EXCLUDED.interval_seconds,
                max_retries = EXCLUDED.max_retries,
                timeout_seconds = EXCLUDED.timeout_seconds,
                retry_backoff_multiplier = EXCLUDED.retry_backoff_multiplier,
                default_retry_delay_seconds = EXCLUDED.default_retry_delay_seconds,
                max_retry_delay_seconds = EXCLUDED.max_retry_delay_seconds,
                manifest_group_id = EXCLUDED.manifest_group_id,
                depends_on_manifest_id = EXCLUDED.depends_on_manifest_id,
                is_enabled = EXCLUDED.is_enabled,
                disabled_note = EXCLUDED.disabled_note,
                priority = EXCLUDED.priority,
                updated_at = NOW()
            RETURNING {MANIFEST_COLUMNS}
            "#
        );
        let manifest = sqlx::query_as::<_, Manifest>(&sql)
            .bind(manifest.id)
            .bind(&manifest.external_id)
            .bind(&manifest.name)
            .bind(&manifest.properties_json)
            .bind(&manifest.properties_type_name)
            .bind(manifest.schedule_type)
            .bind(&manifest.cron_expression)
            .bind(manifest.interval_seconds)
            .bind(manifest.max_retries)
            .bind(manifest.timeout_seconds)
            .bind(manifest.retry_backoff_multiplier)
            .bind(manifest.default_retry_delay_seconds)
            .bind(manifest.max_retry_delay_seconds)
            .bind(manifest.manifest_group_id)
            .bind(manifest.depends_on_manifest_id)
            .bind(manifest.is_enabled)
            .bind(&manifest.disabled_note)
            .bind(manifest.priority)
            .bind(manifest.last_successful_run_at)
            .bind(manifest.last_enqueued_at)
            .bind(manifest.created_at)
            .bind(manifest.updated_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(manifest)
    }

    async fn get_manifest(&self, id: Uuid) -> Result<Option<Manifest>, StoreError> {
        let sql = format!("SELECT {MANIFEST_COLUMNS} FROM manifests WHERE id = $1");
        Ok(sqlx::query_as::<_, Manifest>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn get_manifest_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Manifest>, StoreError> {
        let sql = format!("SELECT {MANIFEST_COLUMNS} FROM manifests WHERE external_id = $1");
        Ok(sqlx::query_as::<_, Manifest>(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_manifests(&self) -> Result<Vec<Manifest>, StoreError> {
        let sql = format!("SELECT {MANIFEST_COLUMNS} FROM manifests ORDER BY external_id");
        Ok(sqlx::query_as::<_, Manifest>(&sql)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn disable_manifest(&self, id: Uuid, note: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE manifests
            SET is_enabled = FALSE, disabled_note = $1, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(note)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "manifest",
                id,
            });
        }
        Ok(())
    }

    async fn list_schedulable_manifests(&self, limit: i64) -> Result<Vec<Manifest>, StoreError> {
        let sql = format!(
            r#"
            SELECT {MANIFEST_COLUMNS}
            FROM manifests m
            WHERE m.is_enabled
              AND NOT EXISTS (
                  SELECT 1 FROM metadata md
                  WHERE md.manifest_id = m.id
                    AND md.workflow_state IN ('pending', 'in_progress')
              )
              AND NOT EXISTS (
                  SELECT 1 FROM work_queue wq
                  WHERE wq.manifest_id = m.id AND wq.status = 'queued'
              )
            ORDER BY m.priority DESC, m.last_enqueued_at ASC NULLS FIRST, m.id
            LIMIT $1
            "#
        );
        Ok(sqlx::query_as::<_, Manifest>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn enqueue_manifest_run(
        &self,
        manifest_id: Uuid,
        expected_last_enqueued_at: Option<DateTime<Utc>>,
        entry: WorkQueueEntry,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Re-check eligibility under a row lock; losers skip this cycle.
        let guard = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM manifests
            WHERE id = $1
              AND is_enabled
              AND last_enqueued_at IS NOT DISTINCT FROM $2
            FOR UPDATE
            "#,
        )
        .bind(manifest_id)
        .bind(expected_last_enqueued_at)
        .fetch_optional(&mut *tx)
        .await?;

        if guard.is_none() {
            tx.rollback().await?;
            return Ok(EnqueueOutcome::Conflict);
        }

        let sql = format!(
            r#"
            INSERT INTO work_queue ({WORK_QUEUE_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {WORK_QUEUE_COLUMNS}
            "#
        );
        let stored = sqlx::query_as::<_, WorkQueueEntry>(&sql)
            .bind(entry.id)
            .bind(&entry.workflow_name)
            .bind(&entry.input_json)
            .bind(&entry.input_type_name)
            .bind(entry.manifest_id)
            .bind(entry.dead_letter_id)
            .bind(entry.priority)
            .bind(entry.status)
            .bind(entry.created_at)
            .bind(entry.available_at)
            .bind(entry.dispatched_at)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query("UPDATE manifests SET last_enqueued_at = $1, updated_at = $1 WHERE id = $2")
            .bind(now)
            .bind(manifest_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(EnqueueOutcome::Enqueued(stored))
    }

    async fn record_successful_run(
        &self,
        manifest_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE manifests SET last_successful_run_at = $1, updated_at = $1 WHERE id = $2",
        )
        .bind(at)
        .bind(manifest_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "manifest",
                id: manifest_id,
            });
        }
        Ok(())
    }

    // ---- groups ----------------------------------------------------------

    async fn upsert_group(&self, group: ManifestGroup) -> Result<ManifestGroup, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO manifest_groups ({GROUP_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (name) DO UPDATE SET
                max_active_jobs = EXCLUDED.max_active_jobs,
                priority = EXCLUDED.priority,
                is_enabled = EXCLUDED.is_enabled,
                updated_at = NOW()
            RETURNING {GROUP_COLUMNS}
            "#
        );
        Ok(sqlx::query_as::<_, ManifestGroup>(&sql)
            .bind(group.id)
            .bind(&group.name)
            .bind(group.max_active_jobs)
            .bind(group.priority)
            .bind(group.is_enabled)
            .bind(group.created_at)
            .bind(group.updated_at)
            .fetch_one(&self.pool)
            .await?)
    }

    async fn get_group(&self, id: Uuid) -> Result<Option<ManifestGroup>, StoreError> {
        let sql = format!("SELECT {GROUP_COLUMNS} FROM manifest_groups WHERE id = $1");
        Ok(sqlx::query_as::<_, ManifestGroup>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_groups(&self) -> Result<Vec<ManifestGroup>, StoreError> {
        let sql = format!("SELECT {GROUP_COLUMNS} FROM manifest_groups ORDER BY name");
        Ok(sqlx::query_as::<_, ManifestGroup>(&sql)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn count_active_jobs(&self, group_id: Uuid) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM metadata md
            JOIN manifests m ON m.id = md.manifest_id
            WHERE m.manifest_group_id = $1
              AND md.workflow_state IN ('pending', 'in_progress')
            "#,
        )
        .bind(group_id)
        .fetch_one(&self.pool)
        .await?)
    }

    // ---- work queue ------------------------------------------------------

    async fn enqueue_work(&self, entry: WorkQueueEntry) -> Result<WorkQueueEntry, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO work_queue ({WORK_QUEUE_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {WORK_QUEUE_COLUMNS}
            "#
        );
        Ok(sqlx::query_as::<_, WorkQueueEntry>(&sql)
            .bind(entry.id)
            .bind(&entry.workflow_name)
            .bind(&entry.input_json)
            .bind(&entry.input_type_name)
            .bind(entry.manifest_id)
            .bind(entry.dead_letter_id)
            .bind(entry.priority)
            .bind(entry.status)
            .bind(entry.created_at)
            .bind(entry.available_at)
            .bind(entry.dispatched_at)
            .fetch_one(&self.pool)
            .await?)
    }

    async fn claim_work_queue(
        &self,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkQueueEntry>, StoreError> {
        let sql = format!(
            r#"
            WITH next_entries AS (
                SELECT id
                FROM work_queue
                WHERE status = 'queued' AND available_at <= $2
                ORDER BY priority DESC, created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE work_queue
            SET status = 'dispatched', dispatched_at = $2
            WHERE id IN (SELECT id FROM next_entries)
            RETURNING {WORK_QUEUE_COLUMNS}
            "#
        );
        let mut claimed = sqlx::query_as::<_, WorkQueueEntry>(&sql)
            .bind(limit)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        // RETURNING does not preserve the CTE order.
        claimed.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(claimed)
    }

    async fn release_claim(&self, id: Uuid, priority_bump: i32) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE work_queue
            SET status = 'queued', dispatched_at = NULL, priority = priority + $1
            WHERE id = $2 AND status = 'dispatched'
            "#,
        )
        .bind(priority_bump)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::StateConflict {
                entity: "work_queue",
                id,
                expected: "Dispatched".into(),
                found: "other".into(),
            });
        }
        Ok(())
    }

    async fn cancel_work_entry(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE work_queue SET status = 'cancelled' WHERE id = $1 AND status = 'queued'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_work_entry(&self, id: Uuid) -> Result<Option<WorkQueueEntry>, StoreError> {
        let sql = format!("SELECT {WORK_QUEUE_COLUMNS} FROM work_queue WHERE id = $1");
        Ok(sqlx::query_as::<_, WorkQueueEntry>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn recover_orphaned_claims(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE work_queue wq
            SET status = 'queued', dispatched_at = NULL, available_at = $1
            WHERE wq.status = 'dispatched'
              AND NOT EXISTS (
                  SELECT 1 FROM metadata md WHERE md.work_queue_id = wq.id
              )
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ---- metadata --------------------------------------------------------

    async fn append_metadata(&self, row: Metadata) -> Result<Metadata, StoreError> {
        if row.workflow_state == WorkflowState::Failed && row.failure_reason.is_none() {
            return Err(StoreError::Constraint(
                "metadata born Failed requires a failure reason".into(),
            ));
        }
        let sql = format!(
            r#"
            INSERT INTO metadata ({METADATA_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING {METADATA_COLUMNS}
            "#
        );
        sqlx::query_as::<_, Metadata>(&sql)
            .bind(row.id)
            .bind(&row.external_id)
            .bind(row.manifest_id)
            .bind(row.parent_id)
            .bind(row.work_queue_id)
            .bind(&row.name)
            .bind(&row.executor)
            .bind(row.workflow_state)
            .bind(row.scheduled_time)
            .bind(row.start_time)
            .bind(row.end_time)
            .bind(&row.failure_step)
            .bind(&row.failure_exception)
            .bind(&row.failure_reason)
            .bind(&row.stack_trace)
            .bind(&row.input_json)
            .bind(&row.output_json)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Self::map_unique_violation(e, &row.external_id))
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

        let failure = patch.failure.clone().unwrap_or_default();
        let sql = format!(
            r#"
            UPDATE metadata SET
                workflow_state = $1,
                start_time = COALESCE($2, start_time),
                end_time = COALESCE($3, end_time),
                output_json = COALESCE($4, output_json),
                failure_step = CASE WHEN $5 THEN $6 ELSE failure_step END,
                failure_exception = CASE WHEN $5 THEN $7 ELSE failure_exception END,
                failure_reason = CASE WHEN $5 THEN $8 ELSE failure_reason END,
                stack_trace = CASE WHEN $5 THEN $9 ELSE stack_trace END
            WHERE id = $10 AND workflow_state = $11
            RETURNING {METADATA_COLUMNS}
            "#
        );
        let updated = sqlx::query_as::<_, Metadata>(&sql)
            .bind(to)
            .bind(patch.start_time)
            .bind(patch.end_time)
            .bind(&patch.output_json)
            .bind(patch.failure.is_some())
            .bind(&failure.step)
            .bind(&failure.exception)
            .bind(&failure.reason)
            .bind(&failure.stack_trace)
            .bind(id)
            .bind(from)
            .fetch_optional(&self.pool)
            .await?;

        match updated {
            Some(row) => Ok(row),
            None => match self.get_metadata(id).await? {
                Some(current) => Err(StoreError::StateConflict {
                    entity: "metadata",
                    id,
                    expected: from.to_string(),
                    found: current.workflow_state.to_string(),
                }),
                None => Err(StoreError::NotFound {
                    entity: "metadata",
                    id,
                }),
            },
        }
    }

    async fn get_metadata(&self, id: Uuid) -> Result<Option<Metadata>, StoreError> {
        let sql = format!("SELECT {METADATA_COLUMNS} FROM metadata WHERE id = $1");
        Ok(sqlx::query_as::<_, Metadata>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn latest_completed_metadata(
        &self,
        manifest_id: Uuid,
    ) -> Result<Option<Metadata>, StoreError> {
        let sql = format!(
            r#"
            SELECT {METADATA_COLUMNS}
            FROM metadata
            WHERE manifest_id = $1 AND workflow_state = 'completed'
            ORDER BY end_time DESC
            LIMIT 1
            "#
        );
        Ok(sqlx::query_as::<_, Metadata>(&sql)
            .bind(manifest_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_timed_out(
        &self,
        now: DateTime<Utc>,
        default_timeout: Duration,
    ) -> Result<Vec<Metadata>, StoreError> {
        let sql = format!(
            r#"
            SELECT md.{}
            FROM metadata md
            LEFT JOIN manifests m ON m.id = md.manifest_id
            WHERE md.workflow_state = 'in_progress'
              AND md.start_time + make_interval(secs =>
                    GREATEST(COALESCE(m.timeout_seconds, 0), $1)::double precision) <= $2
            ORDER BY md.start_time
            "#,
            METADATA_COLUMNS.replace(", ", ", md.")
        );
        Ok(sqlx::query_as::<_, Metadata>(&sql)
            .bind(default_timeout.num_seconds())
            .bind(now)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn count_recent_failures(
        &self,
        manifest_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM metadata
            WHERE manifest_id = $1
              AND workflow_state = 'failed'
              AND ($2::timestamptz IS NULL OR start_time > $2)
            "#,
        )
        .bind(manifest_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn has_pending_work(&self, manifest_id: Uuid) -> Result<bool, StoreError> {
        Ok(sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM work_queue
                WHERE manifest_id = $1 AND status = 'queued'
            ) OR EXISTS (
                SELECT 1 FROM metadata
                WHERE manifest_id = $1
                  AND workflow_state IN ('pending', 'in_progress')
            )
            "#,
        )
        .bind(manifest_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn recent_metadata(
        &self,
        manifest_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Metadata>, StoreError> {
        let sql = format!(
            r#"
            SELECT {METADATA_COLUMNS}
            FROM metadata
            WHERE manifest_id = $1
            ORDER BY start_time DESC
            LIMIT $2
            "#
        );
        Ok(sqlx::query_as::<_, Metadata>(&sql)
            .bind(manifest_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn purge_terminal_metadata(
        &self,
        older_than: DateTime<Utc>,
        batch_size: i64,
    ) -> Result<u64, StoreError> {
        // Batched delete inside its own transaction to keep lock spans short.
        let result = sqlx::query(
            r#"
            DELETE FROM metadata
            WHERE id IN (
                SELECT md.id
                FROM metadata md
                WHERE md.workflow_state IN ('completed', 'failed', 'cancelled')
                  AND md.end_time < $1
                  AND NOT EXISTS (
                      SELECT 1 FROM dead_letters dl WHERE dl.retry_metadata_id = md.id
                  )
                  AND NOT EXISTS (
                      SELECT 1 FROM metadata child
                      WHERE child.parent_id = md.id
                        AND child.workflow_state IN ('pending', 'in_progress')
                  )
                ORDER BY md.end_time
                LIMIT $2
            )
            "#,
        )
        .bind(older_than)
        .bind(batch_size)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ---- dead letters ----------------------------------------------------

    async fn awaiting_intervention(
        &self,
        manifest_id: Uuid,
    ) -> Result<Option<DeadLetter>, StoreError> {
        let sql = format!(
            r#"
            SELECT {DEAD_LETTER_COLUMNS}
            FROM dead_letters
            WHERE manifest_id = $1 AND status = 'awaiting_intervention'
            "#
        );
        Ok(sqlx::query_as::<_, DeadLetter>(&sql)
            .bind(manifest_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_dead_letters(
        &self,
        status: Option<DeadLetterStatus>,
    ) -> Result<Vec<DeadLetter>, StoreError> {
        let sql = format!(
            r#"
            SELECT {DEAD_LETTER_COLUMNS}
            FROM dead_letters
            WHERE ($1::dead_letter_status IS NULL OR status = $1)
            ORDER BY dead_lettered_at
            "#
        );
        Ok(sqlx::query_as::<_, DeadLetter>(&sql)
            .bind(status)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn upsert_dead_letter(&self, letter: DeadLetter) -> Result<DeadLetter, StoreError> {
        // The partial unique index on (manifest_id) WHERE awaiting makes the
        // insert race-safe; on conflict the existing letter wins.
        let sql = format!(
            r#"
            INSERT INTO dead_letters ({DEAD_LETTER_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT DO NOTHING
            RETURNING {DEAD_LETTER_COLUMNS}
            "#
        );
        let inserted = sqlx::query_as::<_, DeadLetter>(&sql)
            .bind(letter.id)
            .bind(letter.manifest_id)
            .bind(&letter.reason)
            .bind(letter.retry_count_at_dead_letter)
            .bind(letter.status)
            .bind(letter.dead_lettered_at)
            .bind(letter.resolved_at)
            .bind(&letter.resolution_note)
            .bind(letter.retry_metadata_id)
            .fetch_optional(&self.pool)
            .await?;

        match inserted {
            Some(row) => Ok(row),
            None => self
                .awaiting_intervention(letter.manifest_id)
                .await?
                .ok_or(StoreError::NotFound {
                    entity: "dead_letter",
                    id: letter.id,
                }),
        }
    }

    async fn resolve_dead_letter(
        &self,
        id: Uuid,
        resolution: DeadLetterResolution,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<DeadLetter, StoreError> {
        let sql = format!(
            r#"
            UPDATE dead_letters
            SET status = $1, resolved_at = $2, resolution_note = $3
            WHERE id = $4 AND status = 'awaiting_intervention'
            RETURNING {DEAD_LETTER_COLUMNS}
            "#
        );
        let updated = sqlx::query_as::<_, DeadLetter>(&sql)
            .bind(resolution.target_status())
            .bind(now)
            .bind(&note)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match updated {
            Some(row) => Ok(row),
            None => match self.get_dead_letter(id).await? {
                Some(current) => Err(StoreError::StateConflict {
                    entity: "dead_letter",
                    id,
                    expected: "AwaitingIntervention".into(),
                    found: format!("{:?}", current.status),
                }),
                None => Err(StoreError::NotFound {
                    entity: "dead_letter",
                    id,
                }),
            },
        }
    }

    async fn attach_retry_metadata(
        &self,
        dead_letter_id: Uuid,
        metadata_id: Uuid,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE dead_letters SET retry_metadata_id = $1 WHERE id = $2")
            .bind(metadata_id)
            .bind(dead_letter_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "dead_letter",
                id: dead_letter_id,
            });
        }
        Ok(())
    }

    async fn get_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetter>, StoreError> {
        let sql = format!("SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE id = $1");
        Ok(sqlx::query_as::<_, DeadLetter>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn purge_resolved_dead_letters(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM dead_letters
            WHERE status IN ('retried', 'acknowledged')
              AND resolved_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ---- background jobs -------------------------------------------------

    async fn record_background_job(&self, job: BackgroundJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO background_jobs (id, task_handle, metadata_id, kind, created_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(job.id)
        .bind(&job.task_handle)
        .bind(job.metadata_id)
        .bind(&job.kind)
        .bind(job.created_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_background_job(
        &self,
        task_handle: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE background_jobs
            SET completed_at = $1
            WHERE task_handle = $2 AND completed_at IS NULL
            "#,
        )
        .bind(at)
        .bind(task_handle)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_background_job_by_metadata(
        &self,
        metadata_id: Uuid,
    ) -> Result<Option<BackgroundJob>, StoreError> {
        Ok(sqlx::query_as::<_, BackgroundJob>(
            r#"
            SELECT id, task_handle, metadata_id, kind, created_at, completed_at
            FROM background_jobs
            WHERE metadata_id = $1 AND completed_at IS NULL
            LIMIT 1
            "#,
        )
        .bind(metadata_id)
        .fetch_optional(&self.pool)
        .await?)
    }
}
