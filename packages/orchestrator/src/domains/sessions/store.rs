use async_trait::async_trait;
use std::time::Duration;

use super::models::{Iteration, IterationStatus, ResultRecord, RunCheckpoint, Session, SessionStatus};
use crate::common::{IterationId, Result, SessionId};
use crate::domains::recovery::models::RecoveryOperation;

/// Persistence for sessions and everything hanging off them.
///
/// Session progress is only ever moved through [`SessionStore::advance_session`],
/// a conditional update on the expected `pages_completed`; a writer that lost
/// the race gets `OrchestratorError::StateConflict`.
#[async_trait]
pub trait SessionStore: Send + Sync {
    // Sessions
    async fn create_session(&self, session: &Session, target_url: &str) -> Result<()>;
    async fn get_session(&self, id: SessionId) -> Result<Option<Session>>;
    async fn list_sessions(&self, status: Option<SessionStatus>) -> Result<Vec<Session>>;

    /// Move `pages_completed` from `expected_pages_completed` to
    /// `new_pages_completed`, bump `current_iteration` and clear the failure
    /// counter. Only applies to running sessions.
    async fn advance_session(
        &self,
        id: SessionId,
        expected_pages_completed: i32,
        new_pages_completed: i32,
    ) -> Result<Session>;

    /// Mark a running session completed. No-op unless every target page is done.
    async fn complete_session(&self, id: SessionId) -> Result<bool>;

    /// Bump the consecutive failure counter and store the error; returns the new count.
    async fn record_session_failure(&self, id: SessionId, error: &str) -> Result<i32>;

    /// Move a running session to `Failed` or `Cancelled`.
    async fn close_session(
        &self,
        id: SessionId,
        status: SessionStatus,
        error: Option<&str>,
    ) -> Result<Session>;

    // Session-URL registry
    async fn get_session_url(&self, id: SessionId) -> Result<Option<String>>;
    async fn set_session_url(&self, id: SessionId, url: &str) -> Result<()>;

    // Iterations
    async fn insert_iteration(&self, iteration: &Iteration) -> Result<()>;
    async fn get_iteration(&self, id: IterationId) -> Result<Option<Iteration>>;
    /// Ordered by iteration number, then attempt.
    async fn list_iterations(&self, session_id: SessionId) -> Result<Vec<Iteration>>;
    async fn start_iteration(&self, id: IterationId, run_token: &str, target_url: &str) -> Result<()>;
    async fn update_iteration_progress(
        &self,
        id: IterationId,
        run_token: &str,
        record_count: i64,
    ) -> Result<()>;
    /// Terminal transition. Ignored when the iteration is already terminal.
    async fn finish_iteration(
        &self,
        id: IterationId,
        status: IterationStatus,
        record_count: i64,
        error: Option<&str>,
    ) -> Result<()>;

    // Records
    /// Insert records, skipping any whose `(session_id, fingerprint)` exists.
    /// Returns how many were inserted.
    async fn insert_records(&self, records: &[ResultRecord]) -> Result<u64>;
    async fn list_records(&self, session_id: SessionId) -> Result<Vec<ResultRecord>>;
    async fn count_records(&self, session_id: SessionId) -> Result<i64>;

    // Recovery
    async fn insert_recovery_operation(&self, operation: &RecoveryOperation) -> Result<()>;
    async fn update_recovery_operation(&self, operation: &RecoveryOperation) -> Result<()>;
    async fn list_recovery_operations(&self, project_token: Option<&str>) -> Result<Vec<RecoveryOperation>>;
    /// Whether a provider run is already accounted for: polled by an
    /// iteration, started as a recovery run, or already recovered.
    async fn is_run_tracked(&self, run_token: &str) -> Result<bool>;
    async fn recovery_attempts(&self, project_token: &str) -> Result<u32>;
    /// Increment the project's counter unless it already reached
    /// `max_attempts`. Returns the new count, or None when capped. The check
    /// and the increment are one atomic step.
    async fn increment_recovery_attempts(&self, project_token: &str, max_attempts: u32) -> Result<Option<u32>>;
    async fn reset_recovery_attempts(&self, project_token: &str) -> Result<()>;
    async fn list_recovery_attempts(&self) -> Result<Vec<(String, u32)>>;

    // Checkpoints
    async fn save_checkpoint(&self, checkpoint: &RunCheckpoint) -> Result<()>;
    async fn get_checkpoint(&self, run_token: &str) -> Result<Option<RunCheckpoint>>;

    // Leader lease
    /// Take or renew the control-loop lease. Returns false while another
    /// holder's lease is live.
    async fn try_acquire_leadership(&self, holder: &str, ttl: Duration) -> Result<bool>;
    async fn release_leadership(&self, holder: &str) -> Result<()>;
}
