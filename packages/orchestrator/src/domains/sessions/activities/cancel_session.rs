//! Operator cancellation of a running session.

use tracing::info;

use crate::common::{OrchestratorError, Result, SessionId};
use crate::domains::sessions::models::{Session, SessionStatus};
use crate::kernel::OrchestratorDeps;

/// Stamp a running session cancelled. An executor polling one of its runs
/// notices before its next poll and gives up the iteration.
pub async fn cancel_session(session_id: SessionId, deps: &OrchestratorDeps) -> Result<Session> {
    let session = deps
        .store
        .get_session(session_id)
        .await?
        .ok_or_else(|| OrchestratorError::not_found("session", session_id))?;

    if session.status.is_terminal() {
        return Err(OrchestratorError::Validation(format!(
            "session {} is already {}",
            session_id, session.status
        )));
    }

    let session = deps
        .store
        .close_session(session_id, SessionStatus::Cancelled, None)
        .await?;
    info!(session_id = %session_id, pages_completed = session.pages_completed, "Session cancelled");
    Ok(session)
}
