//! Retention sweeper for terminal execution records and resolved dead
//! letters.
//!
//! Deletes happen in batches, each in its own transaction, so a large
//! backlog never holds long locks. The store refuses to delete protected
//! rows (dead-letter retry targets, parents of live children).

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

use crate::config::MetadataCleanup;
use crate::store::{SharedStore, Store, StoreError};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub metadata_deleted: u64,
    pub dead_letters_purged: u64,
}

pub struct CleanupSweeper {
    store: SharedStore,
    config: MetadataCleanup,
    dead_letter_retention: Duration,
    auto_purge_dead_letters: bool,
    last_run: Mutex<Option<DateTime<Utc>>>,
}

impl CleanupSweeper {
    pub fn new(
        store: SharedStore,
        config: MetadataCleanup,
        dead_letter_retention: Duration,
        auto_purge_dead_letters: bool,
    ) -> Self {
        Self {
            store,
            config,
            dead_letter_retention,
            auto_purge_dead_letters,
            last_run: Mutex::new(None),
        }
    }

    /// Run a sweep when the cleanup interval has elapsed; otherwise no-op.
    pub async fn maybe_run(&self, now: DateTime<Utc>) -> Result<Option<CleanupStats>, StoreError> {
        let interval = Duration::from_std(self.config.cleanup_interval)
            .unwrap_or_else(|_| Duration::hours(1));
        {
            let last = self.last_run.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(last) = *last {
                if now - last < interval {
                    return Ok(None);
                }
            }
        }

        let stats = self.run(now).await?;
        *self.last_run.lock().unwrap_or_else(|e| e.into_inner()) = Some(now);
        Ok(Some(stats))
    }

    /// Unconditional sweep.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<CleanupStats, StoreError> {
        let retention = Duration::from_std(self.config.retention_period)
            .unwrap_or_else(|_| Duration::days(14));
        let horizon = now - retention;

        let mut stats = CleanupStats::default();
        loop {
            let deleted = self
                .store
                .purge_terminal_metadata(horizon, self.config.batch_size)
                .await?;
            stats.metadata_deleted += deleted;
            if deleted < self.config.batch_size as u64 {
                break;
            }
        }

        if self.auto_purge_dead_letters {
            let dead_letter_horizon = now - self.dead_letter_retention;
            stats.dead_letters_purged = self
                .store
                .purge_resolved_dead_letters(dead_letter_horizon)
                .await?;
        }

        if stats.metadata_deleted > 0 || stats.dead_letters_purged > 0 {
            tracing::info!(
                metadata_deleted = stats.metadata_deleted,
                dead_letters_purged = stats.dead_letters_purged,
                "cleanup sweep finished"
            );
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Metadata, WorkflowState};
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    async fn terminal_row(store: &MemoryStore, ended: DateTime<Utc>) {
        let mut row = Metadata::builder()
            .name("demo.Old".to_string())
            .executor("test-host".to_string())
            .build();
        row.workflow_state = WorkflowState::Completed;
        row.start_time = ended - Duration::seconds(5);
        row.end_time = Some(ended);
        store.append_metadata(row).await.unwrap();
    }

    fn sweeper(store: Arc<MemoryStore>, batch_size: i64) -> CleanupSweeper {
        CleanupSweeper::new(
            store,
            MetadataCleanup {
                cleanup_interval: StdDuration::from_secs(3600),
                retention_period: StdDuration::from_secs(60 * 60 * 24),
                batch_size,
            },
            Duration::days(30),
            true,
        )
    }

    #[tokio::test]
    async fn sweeps_old_terminal_rows_in_batches() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        for _ in 0..5 {
            terminal_row(&store, now - Duration::days(2)).await;
        }
        terminal_row(&store, now).await; // Fresh: survives.

        let stats = sweeper(store.clone(), 2).run(now).await.unwrap();
        assert_eq!(stats.metadata_deleted, 5);
        assert_eq!(store.all_metadata().len(), 1);
    }

    #[tokio::test]
    async fn respects_the_cleanup_interval() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        terminal_row(&store, now - Duration::days(2)).await;

        let sweeper = sweeper(store.clone(), 100);
        assert!(sweeper.maybe_run(now).await.unwrap().is_some());

        terminal_row(&store, now - Duration::days(2)).await;
        // Ten minutes later is inside the hour-long interval.
        assert!(sweeper
            .maybe_run(now + Duration::minutes(10))
            .await
            .unwrap()
            .is_none());
        // Past the interval it runs again.
        assert!(sweeper
            .maybe_run(now + Duration::minutes(61))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn purges_resolved_dead_letters_past_retention() {
        use crate::store::{DeadLetter, DeadLetterResolution};

        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let letter = store
            .upsert_dead_letter(DeadLetter::awaiting(
                uuid::Uuid::new_v4(),
                "x",
                3,
                now - Duration::days(60),
            ))
            .await
            .unwrap();
        store
            .resolve_dead_letter(
                letter.id,
                DeadLetterResolution::Acknowledge,
                None,
                now - Duration::days(45),
            )
            .await
            .unwrap();

        let stats = sweeper(store.clone(), 100).run(now).await.unwrap();
        assert_eq!(stats.dead_letters_purged, 1);
    }
}
