use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use crate::common::{IterationId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "iteration_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl IterationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IterationStatus::Completed | IterationStatus::Failed)
    }
}

/// One provider run covering `[start_page, end_page]` of a session.
///
/// A failed iteration is retried as a new row with the same
/// `iteration_number` and the next `attempt`. Rows are immutable once
/// completed or failed.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Iteration {
    #[builder(default)]
    pub id: IterationId,
    pub session_id: SessionId,
    pub iteration_number: i32,
    #[builder(default = 1)]
    pub attempt: i32,

    pub start_page: i32,
    pub end_page: i32,
    #[builder(default, setter(strip_option))]
    pub target_url: Option<String>,

    #[builder(default, setter(strip_option))]
    pub run_token: Option<String>,
    #[builder(default = 0)]
    pub record_count: i64,

    #[builder(default)]
    pub status: IterationStatus,
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Iteration {
    pub fn page_count(&self) -> i32 {
        self.end_page - self.start_page + 1
    }
}
