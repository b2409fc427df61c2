//! Stall-recovery operation model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use crate::common::{IterationId, RecoveryOperationId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "recovery_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Why a run was judged to need recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryReason {
    /// No progress for longer than the stall window (or reported `stuck`).
    Stalled,
    /// Provider reported the run cancelled.
    Cancelled,
    /// Completed with suspiciously little output.
    Suspicious,
}

impl RecoveryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryReason::Stalled => "stalled",
            RecoveryReason::Cancelled => "cancelled",
            RecoveryReason::Suspicious => "suspicious",
        }
    }
}

/// One recovery run started to resume a stalled or cut-short provider run.
///
/// Monitor-triggered operations have no `iteration_id`. The attempt number
/// never exceeds the configured recovery cap.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct RecoveryOperation {
    #[builder(default)]
    pub id: RecoveryOperationId,
    pub project_token: String,
    pub original_run_token: String,
    #[builder(default, setter(strip_option))]
    pub recovery_run_token: Option<String>,
    #[builder(default, setter(strip_option))]
    pub iteration_id: Option<IterationId>,

    // Last observed position
    #[builder(default, setter(strip_option))]
    pub last_record_url: Option<String>,
    #[builder(default, setter(strip_option))]
    pub last_record_name: Option<String>,
    pub resume_page: i32,
    pub resume_url: String,

    pub reason: String,
    #[builder(default)]
    pub status: RecoveryStatus,
    pub attempt_number: i32,

    // Counts
    #[builder(default = 0)]
    pub original_count: i64,
    #[builder(default = 0)]
    pub recovered_count: i64,
    #[builder(default = 0)]
    pub final_count: i64,
    #[builder(default = 0)]
    pub duplicates_removed: i64,

    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,

    // Timestamps
    #[builder(default = Utc::now())]
    pub stop_detected_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub triggered_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RecoveryOperation {
    /// Record the outcome of the recovery run.
    pub fn finish(&mut self, recovered: i64, duplicates: i64, error: Option<String>) {
        self.recovered_count = recovered;
        self.duplicates_removed = duplicates;
        self.final_count = self.original_count + recovered;
        self.completed_at = Some(Utc::now());
        self.status = if error.is_some() {
            RecoveryStatus::Failed
        } else {
            RecoveryStatus::Completed
        };
        self.error_message = error;
    }
}
