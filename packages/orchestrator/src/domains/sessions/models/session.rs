//! Scraping session (campaign) model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use crate::common::SessionId;
use crate::domains::consolidation::{compare_pages, DedupStrategy};

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "session_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Session Model
// ============================================================================

/// A multi-run scraping campaign over `total_pages_target` pages.
///
/// Invariants: `pages_completed <= total_pages_target`, and `status` is
/// `Completed` only once `pages_completed >= total_pages_target`. Sessions are
/// never deleted, only stamped terminal. The target URL lives in the
/// session-URL registry, not on this row.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Session {
    #[builder(default)]
    pub id: SessionId,

    pub project_token: String,
    pub project_name: String,
    pub total_pages_target: i32,

    // Progress
    #[builder(default = 0)]
    pub pages_completed: i32,
    #[builder(default = 1)]
    pub current_iteration: i32,
    #[builder(default = 10)]
    pub pages_per_iteration: i32,

    #[builder(default)]
    #[sqlx(try_from = "String")]
    pub dedup_strategy: DedupStrategy,

    // State
    #[builder(default)]
    pub status: SessionStatus,
    #[builder(default = 0)]
    pub consecutive_failures: i32,
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,

    // Timestamps
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_complete(&self) -> bool {
        self.pages_completed >= self.total_pages_target
    }

    /// Inclusive page range of the next iteration, or `None` when every
    /// target page is done.
    pub fn next_range(&self) -> Option<(i32, i32)> {
        if self.is_complete() {
            return None;
        }
        let start = self.pages_completed + 1;
        let end = (self.pages_completed + self.pages_per_iteration.max(1)).min(self.total_pages_target);
        Some((start, end))
    }

    pub fn percentage(&self) -> f64 {
        compare_pages(
            self.pages_completed.max(0) as u64,
            self.total_pages_target.max(0) as u64,
        )
        .percentage
    }

    /// Iterations needed to cover the whole target.
    pub fn total_iterations_needed(&self) -> i32 {
        let per = self.pages_per_iteration.max(1);
        (self.total_pages_target + per - 1) / per
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(total: i32, done: i32, per: i32) -> Session {
        Session::builder()
            .project_token("tProj")
            .project_name("Shop")
            .total_pages_target(total)
            .pages_completed(done)
            .pages_per_iteration(per)
            .build()
    }

    #[test]
    fn test_ranges_cover_target_without_overlap() {
        assert_eq!(session(25, 0, 10).next_range(), Some((1, 10)));
        assert_eq!(session(25, 10, 10).next_range(), Some((11, 20)));
        assert_eq!(session(25, 20, 10).next_range(), Some((21, 25)));
        assert_eq!(session(25, 25, 10).next_range(), None);
    }

    #[test]
    fn test_iterations_needed_rounds_up() {
        assert_eq!(session(25, 0, 10).total_iterations_needed(), 3);
        assert_eq!(session(20, 0, 10).total_iterations_needed(), 2);
        assert_eq!(session(1, 0, 10).total_iterations_needed(), 1);
    }

    #[test]
    fn test_percentage() {
        assert_eq!(session(25, 10, 10).percentage(), 40.0);
        assert_eq!(session(3, 1, 10).percentage(), 33.3);
    }
}
