//! Work queue: the dispatch request table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Queue row states. `Queued → {Dispatched, Cancelled}` is one-shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "queue_status", rename_all = "snake_case")]
pub enum QueueStatus {
    #[default]
    Queued,
    Dispatched,
    Cancelled,
}

impl QueueStatus {
    /// Stable symbolic mapping for external consumers.
    pub fn as_i16(&self) -> i16 {
        match self {
            QueueStatus::Queued => 0,
            QueueStatus::Dispatched => 1,
            QueueStatus::Cancelled => 2,
        }
    }
}

/// A pending dispatch request.
///
/// Rows are append-only from the consumer's point of view: a retry is a new
/// row, and a dispatched row stays dispatched for audit.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct WorkQueueEntry {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    /// Workflow lookup key.
    pub workflow_name: String,

    #[builder(default)]
    pub input_json: Option<serde_json::Value>,
    #[builder(default)]
    pub input_type_name: Option<String>,

    #[builder(default, setter(strip_option))]
    pub manifest_id: Option<Uuid>,

    /// Set when this row was appended by a dead-letter retry, so the fresh
    /// execution record can be attached back to the dead letter.
    #[builder(default, setter(strip_option))]
    pub dead_letter_id: Option<Uuid>,

    #[builder(default = 0)]
    pub priority: i32,

    #[builder(default)]
    pub status: QueueStatus,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,

    /// Earliest instant the row may be claimed; backoff delays land here.
    #[builder(default = Utc::now())]
    pub available_at: DateTime<Utc>,

    #[builder(default, setter(strip_option))]
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl WorkQueueEntry {
    /// A row for a manifest-driven dispatch carrying the manifest's default
    /// input payload.
    pub fn for_manifest(
        manifest: &crate::store::Manifest,
        priority: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self::builder()
            .workflow_name(manifest.name.clone())
            .input_json(manifest.properties_json.clone())
            .input_type_name(manifest.properties_type_name.clone())
            .manifest_id(manifest.id)
            .priority(priority)
            .created_at(now)
            .available_at(now)
            .build()
    }

    /// Whether the row can be claimed at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Queued && self.available_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Manifest;

    #[test]
    fn status_mapping_is_stable() {
        assert_eq!(QueueStatus::Queued.as_i16(), 0);
        assert_eq!(QueueStatus::Dispatched.as_i16(), 1);
        assert_eq!(QueueStatus::Cancelled.as_i16(), 2);
    }

    #[test]
    fn for_manifest_copies_payload_and_priority() {
        let mut manifest = Manifest::on_demand("reports.Nightly");
        manifest.properties_json = Some(serde_json::json!({"$type": "reports.Input", "day": 3}));
        manifest.properties_type_name = Some("reports.Input".into());

        let now = Utc::now();
        let entry = WorkQueueEntry::for_manifest(&manifest, 7, now);
        assert_eq!(entry.workflow_name, "reports.Nightly");
        assert_eq!(entry.priority, 7);
        assert_eq!(entry.manifest_id, Some(manifest.id));
        assert_eq!(entry.input_type_name.as_deref(), Some("reports.Input"));
        assert!(entry.is_claimable(now));
    }

    #[test]
    fn delayed_rows_are_not_claimable_early() {
        let now = Utc::now();
        let entry = WorkQueueEntry::builder()
            .workflow_name("x".to_string())
            .created_at(now)
            .available_at(now + chrono::Duration::seconds(30))
            .build();
        assert!(!entry.is_claimable(now));
        assert!(entry.is_claimable(now + chrono::Duration::seconds(31)));
    }
}
