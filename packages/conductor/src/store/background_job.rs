//! Background-job records: dashboard visibility into task-server handles.
//!
//! These rows mirror opaque task-server handles so operators can see what a
//! host is holding. The lifecycle belongs to the adapter; the core only
//! appends and closes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct BackgroundJob {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    /// The task server's opaque handle.
    pub task_handle: String,

    /// Execution record the handle is running, when it is a workflow run.
    #[builder(default, setter(strip_option))]
    pub metadata_id: Option<Uuid>,

    /// Handle kind: `workflow` or `recurring`.
    #[builder(default = "workflow".to_string())]
    pub kind: String,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,

    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
}
