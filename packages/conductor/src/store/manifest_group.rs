//! Manifest group: the coarse concurrency and ownership unit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// A named group of manifests sharing an active-job ceiling and a priority.
///
/// When a group is disabled, no member manifest may be dispatched.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ManifestGroup {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    /// Unique group name.
    pub name: String,

    /// Ceiling on metadatas in `{Pending, InProgress}`; `None` = unbounded.
    #[builder(default, setter(strip_option))]
    pub max_active_jobs: Option<i32>,

    #[builder(default = 0)]
    pub priority: i32,

    #[builder(default = true)]
    pub is_enabled: bool,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl ManifestGroup {
    pub fn named(name: &str) -> Self {
        Self::builder().name(name.to_string()).build()
    }

    /// Whether another job fits under the ceiling, counting both committed
    /// active jobs and enqueues already admitted this cycle.
    pub fn has_capacity(&self, active: i64, admitted_this_cycle: i64) -> bool {
        match self.max_active_jobs {
            None => true,
            Some(max) => active + admitted_this_cycle < i64::from(max),
        }
    }
}
