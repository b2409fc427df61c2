//! Typed errors for the orchestration engine.
//!
//! Every failure the engine can surface falls into one of these classes. Each
//! class has a fixed propagation rule, see [`OrchestratorError::is_retryable`].

use thiserror::Error;

use super::entity_ids::SessionId;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Provider unreachable or timed out. Retried on the next poll.
    #[error("provider unreachable: {0}")]
    Transport(String),

    /// Provider run ended as `failed` or `cancelled`. Terminal for the iteration.
    #[error("provider run {run_token} ended as {status}: {message}")]
    ProviderJob {
        run_token: String,
        status: String,
        message: String,
    },

    /// Malformed batch or row. Skipped at row level, never aborts a merge.
    #[error("malformed data: {0}")]
    Data(String),

    /// Recovery attempt cap reached. Needs an operator reset.
    #[error("recovery cap reached for project {project_token} ({attempts}/{max_attempts})")]
    Capacity {
        project_token: String,
        attempts: u32,
        max_attempts: u32,
    },

    /// Another writer advanced the session first.
    #[error("session {session_id} was modified concurrently")]
    StateConflict { session_id: SessionId },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl OrchestratorError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        OrchestratorError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether retrying the same operation later can succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Transport(_)
                | OrchestratorError::ProviderJob { .. }
                | OrchestratorError::StateConflict { .. }
                | OrchestratorError::Storage(_)
        )
    }
}

impl From<sqlx::Error> for OrchestratorError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => OrchestratorError::NotFound {
                entity: "row",
                id: "?".to_string(),
            },
            other => OrchestratorError::Storage(Box::new(other)),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for OrchestratorError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        OrchestratorError::Storage(Box::new(err))
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Data(err.to_string())
    }
}

impl From<csv::Error> for OrchestratorError {
    fn from(err: csv::Error) -> Self {
        OrchestratorError::Data(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
