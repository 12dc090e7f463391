//! Manifest model: the stable definition of a runnable job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// How a manifest becomes eligible for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "schedule_type", rename_all = "snake_case")]
pub enum ScheduleType {
    /// Never auto-eligible.
    #[default]
    None,
    /// 5-field cron expression.
    Cron,
    /// Fixed seconds since the last successful run.
    Interval,
    /// Eligible only through an explicit trigger.
    OnDemand,
}

impl ScheduleType {
    /// Stable symbolic mapping for external consumers.
    pub fn as_i16(&self) -> i16 {
        match self {
            ScheduleType::None => 0,
            ScheduleType::Cron => 1,
            ScheduleType::Interval => 2,
            ScheduleType::OnDemand => 3,
        }
    }
}

/// The stable definition of a runnable job: identity, schedule, retry
/// policy, DAG placement, and scheduling state.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Manifest {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    /// Human-visible identifier, unique per deployment, stable for life.
    #[builder(default = crate::kernel::ids::external_id())]
    pub external_id: String,

    /// Fully-qualified workflow name; the bus lookup key.
    pub name: String,

    // Default input payload
    #[builder(default, setter(strip_option))]
    pub properties_json: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub properties_type_name: Option<String>,

    // Schedule
    #[builder(default)]
    pub schedule_type: ScheduleType,
    #[builder(default, setter(strip_option))]
    pub cron_expression: Option<String>,
    #[builder(default, setter(strip_option))]
    pub interval_seconds: Option<i64>,

    // Retry / timeout policy
    #[builder(default = 3)]
    pub max_retries: i32,
    #[builder(default, setter(strip_option))]
    pub timeout_seconds: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub retry_backoff_multiplier: Option<f64>,
    #[builder(default, setter(strip_option))]
    pub default_retry_delay_seconds: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub max_retry_delay_seconds: Option<i64>,

    // DAG placement
    #[builder(default, setter(strip_option))]
    pub manifest_group_id: Option<Uuid>,
    #[builder(default, setter(strip_option))]
    pub depends_on_manifest_id: Option<Uuid>,

    // Scheduling state
    #[builder(default = true)]
    pub is_enabled: bool,
    #[builder(default, setter(strip_option))]
    pub disabled_note: Option<String>,
    #[builder(default = 0)]
    pub priority: i32,
    #[builder(default, setter(strip_option))]
    pub last_successful_run_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_enqueued_at: Option<DateTime<Utc>>,

    // Timestamps
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Manifest {
    /// Convenience constructor for an on-demand manifest.
    pub fn on_demand(name: &str) -> Self {
        Self::builder()
            .name(name.to_string())
            .schedule_type(ScheduleType::OnDemand)
            .build()
    }

    /// Convenience constructor for an interval manifest.
    pub fn interval(name: &str, seconds: i64) -> Self {
        Self::builder()
            .name(name.to_string())
            .schedule_type(ScheduleType::Interval)
            .interval_seconds(seconds)
            .build()
    }

    /// Convenience constructor for a cron manifest.
    pub fn cron(name: &str, expression: &str) -> Self {
        Self::builder()
            .name(name.to_string())
            .schedule_type(ScheduleType::Cron)
            .cron_expression(expression.to_string())
            .build()
    }

    /// Per-job timeout, falling back to the configured default.
    pub fn effective_timeout(&self, default_timeout: chrono::Duration) -> chrono::Duration {
        match self.timeout_seconds {
            Some(secs) if secs > 0 => chrono::Duration::seconds(secs).max(default_timeout),
            _ => default_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_type_mapping_is_stable() {
        assert_eq!(ScheduleType::None.as_i16(), 0);
        assert_eq!(ScheduleType::Cron.as_i16(), 1);
        assert_eq!(ScheduleType::Interval.as_i16(), 2);
        assert_eq!(ScheduleType::OnDemand.as_i16(), 3);
    }

    #[test]
    fn new_manifest_is_enabled_with_default_retries() {
        let manifest = Manifest::on_demand("reports.Nightly");
        assert!(manifest.is_enabled);
        assert_eq!(manifest.max_retries, 3);
        assert_eq!(manifest.priority, 0);
        assert_eq!(manifest.external_id.len(), 32);
    }

    #[test]
    fn interval_constructor_sets_schedule_fields() {
        let manifest = Manifest::interval("sync.Accounts", 60);
        assert_eq!(manifest.schedule_type, ScheduleType::Interval);
        assert_eq!(manifest.interval_seconds, Some(60));
        assert!(manifest.cron_expression.is_none());
    }

    #[test]
    fn effective_timeout_prefers_larger_of_manifest_and_default() {
        let mut manifest = Manifest::on_demand("x");
        let default = chrono::Duration::minutes(20);

        assert_eq!(manifest.effective_timeout(default), default);

        manifest.timeout_seconds = Some(600);
        assert_eq!(manifest.effective_timeout(default), default);

        manifest.timeout_seconds = Some(3600);
        assert_eq!(
            manifest.effective_timeout(default),
            chrono::Duration::hours(1)
        );
    }
}
