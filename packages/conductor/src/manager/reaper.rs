//! Stuck-job reaper.
//!
//! Any `InProgress` execution older than the larger of its manifest's
//! timeout and the deployment default is failed with reason `Timeout`. This
//! is the only place the manager writes to an execution record directly.
//! Runs once at startup (when configured) to clear state left by a crash,
//! then on every N-th manager cycle.

use chrono::Duration;

use crate::kernel::Clock;
use crate::store::{
    failure_reason, FailureDetail, MetadataPatch, SharedStore, Store, StoreError, WorkflowState,
};

pub struct Reaper {
    store: SharedStore,
    default_timeout: Duration,
}

impl Reaper {
    pub fn new(store: SharedStore, default_timeout: Duration) -> Self {
        Self {
            store,
            default_timeout,
        }
    }

    /// Fail every timed-out execution. Returns how many were reaped;
    /// compare-and-set losses (the workflow finished first) are skipped
    /// silently.
    pub async fn reap(&self, clock: &dyn Clock) -> Result<u64, StoreError> {
        let now = clock.now();
        let stuck = self.store.list_timed_out(now, self.default_timeout).await?;
        let mut reaped = 0;

        for row in stuck {
            let age = now - row.start_time;
            let patch = MetadataPatch::failed(
                now,
                FailureDetail {
                    reason: Some(failure_reason::TIMEOUT.to_string()),
                    exception: Some(format!(
                        "execution exceeded its timeout after {}s",
                        age.num_seconds()
                    )),
                    ..FailureDetail::default()
                },
            );
            match self
                .store
                .transition_metadata(row.id, WorkflowState::InProgress, WorkflowState::Failed, patch)
                .await
            {
                Ok(_) => {
                    tracing::warn!(
                        metadata_id = %row.id,
                        workflow = %row.name,
                        age_secs = age.num_seconds(),
                        "reaped stuck execution"
                    );
                    reaped += 1;
                }
                Err(StoreError::StateConflict { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(reaped)
    }

    /// Startup pass: reap and put orphaned claims back on the queue.
    pub async fn recover_on_startup(&self, clock: &dyn Clock) -> Result<(u64, u64), StoreError> {
        let reaped = self.reap(clock).await?;
        let recovered = self.store.recover_orphaned_claims(clock.now()).await?;
        if reaped > 0 || recovered > 0 {
            tracing::info!(reaped, recovered, "startup recovery finished");
        }
        Ok((reaped, recovered))
    }
}
