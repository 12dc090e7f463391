//! Retry and dead-letter policy.
//!
//! Attempts are never stored as a counter; they are derived from execution
//! history: failed attempts started after the manifest's last successful
//! run. That makes the policy crash-proof — the database alone decides how
//! many retries a manifest has burned.

use chrono::{DateTime, Duration, Utc};

use crate::store::{Manifest, Store, StoreError, WorkQueueEntry};

/// Deployment-wide backoff defaults; a manifest may override each knob.
#[derive(Debug, Clone, Copy)]
pub struct RetryDefaults {
    pub max_retries: i32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_retry_delay: Duration,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::minutes(5),
            backoff_multiplier: 2.0,
            max_retry_delay: Duration::hours(1),
        }
    }
}

/// The manifest's effective policy after applying defaults.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: i32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_retry_delay: Duration,
}

impl RetryPolicy {
    pub fn for_manifest(manifest: &Manifest, defaults: &RetryDefaults) -> Self {
        Self {
            max_retries: manifest.max_retries,
            retry_delay: manifest
                .default_retry_delay_seconds
                .filter(|s| *s > 0)
                .map(Duration::seconds)
                .unwrap_or(defaults.retry_delay),
            backoff_multiplier: manifest
                .retry_backoff_multiplier
                .filter(|m| *m >= 1.0)
                .unwrap_or(defaults.backoff_multiplier),
            max_retry_delay: manifest
                .max_retry_delay_seconds
                .filter(|s| *s > 0)
                .map(Duration::seconds)
                .unwrap_or(defaults.max_retry_delay),
        }
    }

    /// `min(max_delay, base * multiplier^(attempts - 1))` — the first retry
    /// waits the base delay.
    pub fn backoff_delay(&self, attempts: i64) -> Duration {
        let exponent = attempts.max(1) - 1;
        let factor = self.backoff_multiplier.powi(exponent.min(i32::MAX as i64) as i32);
        let base_ms = self.retry_delay.num_milliseconds() as f64;
        let delay_ms = (base_ms * factor).min(self.max_retry_delay.num_milliseconds() as f64);
        Duration::milliseconds(delay_ms as i64)
    }
}

/// What the policy decided for a failed attempt.
#[derive(Debug)]
pub enum RetryDecision {
    /// A fresh queue row was appended, claimable at the embedded time.
    Requeued { entry: WorkQueueEntry, attempts: i64 },
    /// The budget is exhausted; dead-letter promotion is the manager's job.
    Exhausted { attempts: i64 },
}

/// Derived attempt count for a manifest (see `count_recent_failures`).
pub async fn attempts_since_last_success(
    store: &dyn Store,
    manifest: &Manifest,
) -> Result<i64, StoreError> {
    store
        .count_recent_failures(manifest.id, manifest.last_successful_run_at)
        .await
}

/// React to a failed terminal transition: requeue with backoff while budget
/// remains, otherwise report exhaustion.
///
/// The re-queue is an append of a new row — the dispatched row and the
/// failed metadata are audit records and never rewritten. Priority ages by
/// the attempt count so retries do not starve behind fresh work.
pub async fn on_failure(
    store: &dyn Store,
    manifest: &Manifest,
    failed_entry: Option<&WorkQueueEntry>,
    defaults: &RetryDefaults,
    now: DateTime<Utc>,
) -> Result<RetryDecision, StoreError> {
    let attempts = attempts_since_last_success(store, manifest).await?;
    let policy = RetryPolicy::for_manifest(manifest, defaults);

    if attempts >= i64::from(policy.max_retries) {
        return Ok(RetryDecision::Exhausted { attempts });
    }

    let delay = policy.backoff_delay(attempts);
    let (input_json, input_type_name, base_priority) = match failed_entry {
        Some(entry) => (
            entry.input_json.clone(),
            entry.input_type_name.clone(),
            entry.priority,
        ),
        None => (
            manifest.properties_json.clone(),
            manifest.properties_type_name.clone(),
            manifest.priority,
        ),
    };

    let mut entry = WorkQueueEntry::builder()
        .workflow_name(manifest.name.clone())
        .manifest_id(manifest.id)
        .priority(base_priority + attempts as i32)
        .created_at(now)
        .available_at(now + delay)
        .build();
    entry.input_json = input_json;
    entry.input_type_name = input_type_name;

    let entry = store.enqueue_work(entry).await?;
    Ok(RetryDecision::Requeued { entry, attempts })
}
