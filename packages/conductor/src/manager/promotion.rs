//! Dead-letter promotion.
//!
//! A manifest whose derived failure count has reached its retry budget is
//! parked with an `AwaitingIntervention` dead letter. The store enforces
//! at-most-one awaiting letter per manifest, so re-running the promotion
//! pass is harmless.

use chrono::{DateTime, Utc};

use crate::retry::RetryDefaults;
use crate::store::{DeadLetter, SharedStore, StoreError, MAX_RETRIES_EXCEEDED};

/// Promote every exhausted manifest. Returns how many letters were created.
pub async fn promote_exhausted(
    store: &SharedStore,
    defaults: &RetryDefaults,
    now: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let mut promoted = 0;

    for manifest in store.list_manifests().await? {
        let max_retries = if manifest.max_retries > 0 {
            manifest.max_retries
        } else {
            defaults.max_retries
        };

        let attempts = store
            .count_recent_failures(manifest.id, manifest.last_successful_run_at)
            .await?;
        if attempts < i64::from(max_retries) {
            continue;
        }
        if store.awaiting_intervention(manifest.id).await?.is_some() {
            continue;
        }
        // A queued retry (operator or backoff) gets its chance first.
        if store.has_pending_work(manifest.id).await? {
            continue;
        }

        let letter = store
            .upsert_dead_letter(DeadLetter::awaiting(
                manifest.id,
                MAX_RETRIES_EXCEEDED,
                attempts as i32,
                now,
            ))
            .await?;
        tracing::warn!(
            manifest_id = %manifest.id,
            external_id = %manifest.external_id,
            attempts,
            dead_letter_id = %letter.id,
            "manifest promoted to dead letter"
        );
        promoted += 1;
    }
    Ok(promoted)
}
