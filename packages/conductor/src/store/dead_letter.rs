//! Dead letters: manifests parked for human intervention.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Reason written when the retry budget is exhausted.
pub const MAX_RETRIES_EXCEEDED: &str = "Max retries exceeded";

/// Dead-letter lifecycle. `Retried` and `Acknowledged` rows are audit-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "dead_letter_status", rename_all = "snake_case")]
pub enum DeadLetterStatus {
    #[default]
    AwaitingIntervention,
    Retried,
    Acknowledged,
}

impl DeadLetterStatus {
    /// Stable symbolic mapping for external consumers.
    pub fn as_i16(&self) -> i16 {
        match self {
            DeadLetterStatus::AwaitingIntervention => 0,
            DeadLetterStatus::Retried => 1,
            DeadLetterStatus::Acknowledged => 2,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, DeadLetterStatus::AwaitingIntervention)
    }
}

/// Operator action on an awaiting dead letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterResolution {
    /// Append a fresh work-queue row and mark the letter `Retried`.
    Retry,
    /// Record the operator's note; does not unblock anything by itself.
    Acknowledge,
}

impl DeadLetterResolution {
    pub fn target_status(&self) -> DeadLetterStatus {
        match self {
            DeadLetterResolution::Retry => DeadLetterStatus::Retried,
            DeadLetterResolution::Acknowledge => DeadLetterStatus::Acknowledged,
        }
    }
}

/// A manual-intervention record. At most one row per manifest may be
/// `AwaitingIntervention` at any time.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct DeadLetter {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    pub manifest_id: Uuid,

    pub reason: String,

    /// Derived attempt count at the moment of promotion.
    pub retry_count_at_dead_letter: i32,

    #[builder(default)]
    pub status: DeadLetterStatus,

    #[builder(default = Utc::now())]
    pub dead_lettered_at: DateTime<Utc>,

    #[builder(default, setter(strip_option))]
    pub resolved_at: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option))]
    pub resolution_note: Option<String>,

    /// Execution record created for the retry row, once it exists.
    #[builder(default, setter(strip_option))]
    pub retry_metadata_id: Option<Uuid>,
}

impl DeadLetter {
    /// A fresh awaiting-intervention letter for an exhausted manifest.
    pub fn awaiting(
        manifest_id: Uuid,
        reason: &str,
        retry_count: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self::builder()
            .manifest_id(manifest_id)
            .reason(reason.to_string())
            .retry_count_at_dead_letter(retry_count)
            .dead_lettered_at(now)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_is_stable() {
        assert_eq!(DeadLetterStatus::AwaitingIntervention.as_i16(), 0);
        assert_eq!(DeadLetterStatus::Retried.as_i16(), 1);
        assert_eq!(DeadLetterStatus::Acknowledged.as_i16(), 2);
    }

    #[test]
    fn resolution_maps_to_terminal_status() {
        assert_eq!(
            DeadLetterResolution::Retry.target_status(),
            DeadLetterStatus::Retried
        );
        assert_eq!(
            DeadLetterResolution::Acknowledge.target_status(),
            DeadLetterStatus::Acknowledged
        );
    }

    #[test]
    fn awaiting_letter_starts_unresolved() {
        let letter = DeadLetter::awaiting(Uuid::new_v4(), MAX_RETRIES_EXCEEDED, 3, Utc::now());
        assert_eq!(letter.status, DeadLetterStatus::AwaitingIntervention);
        assert!(!letter.status.is_resolved());
        assert!(letter.resolved_at.is_none());
        assert_eq!(letter.retry_count_at_dead_letter, 3);
    }
}
