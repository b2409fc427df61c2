// Trait definitions for dependency injection
//
// These are INFRASTRUCTURE traits only - no orchestration logic.
// Orchestration (polling, recovery decisions) lives in the domains and uses these traits.
//
// Naming convention: Base* for trait names (e.g., BaseScrapingProvider)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::Result;

// =============================================================================
// Scraping Provider Trait (Infrastructure - remote job API)
// =============================================================================

/// Normalized lifecycle state of a provider run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Stuck,
    Unknown,
}

impl RunState {
    /// Map a raw provider status string onto the normalized state.
    pub fn from_provider(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" | "initialized" | "queued" => RunState::Running,
            "complete" | "completed" | "succeeded" => RunState::Succeeded,
            "error" | "failed" => RunState::Failed,
            "cancelled" | "canceled" => RunState::Cancelled,
            "stuck" => RunState::Stuck,
            _ => RunState::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
            RunState::Stuck => "stuck",
            RunState::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One poll's view of a provider run. Never cached beyond a single poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRunStatus {
    pub state: RunState,
    pub record_count: u64,
    pub page_count: u64,
    pub current_url: Option<String>,
    pub error: Option<String>,
}

impl ProviderRunStatus {
    /// Status reported when the provider could not be reached.
    pub fn unreachable(error: impl Into<String>) -> Self {
        Self {
            state: RunState::Unknown,
            record_count: 0,
            page_count: 0,
            current_url: None,
            error: Some(error.into()),
        }
    }
}

/// A provider project together with a snapshot of its latest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub token: String,
    pub title: String,
    pub main_site: Option<String>,
    pub last_run_token: Option<String>,
    pub last_run_state: RunState,
    pub pages_scraped: u64,
    pub data_count: u64,
}

#[async_trait]
pub trait BaseScrapingProvider: Send + Sync {
    /// Start a run of `project_token` beginning at `start_url`; returns the run token.
    async fn start_run(&self, project_token: &str, start_url: &str) -> Result<String>;

    /// Current run status. Transport failures come back as `RunState::Unknown`
    /// with the error text set, never as `Err`.
    async fn get_run_status(&self, run_token: &str) -> ProviderRunStatus;

    /// Fetch one chunk of run results; returns `(records, total_count)`.
    async fn fetch_page(&self, run_token: &str, offset: u64, limit: u64)
        -> Result<(Vec<Value>, u64)>;

    async fn list_projects(&self) -> Result<Vec<ProjectSummary>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_statuses_normalize() {
        assert_eq!(RunState::from_provider("initialized"), RunState::Running);
        assert_eq!(RunState::from_provider("complete"), RunState::Succeeded);
        assert_eq!(RunState::from_provider("ERROR"), RunState::Failed);
        assert_eq!(RunState::from_provider("cancelled"), RunState::Cancelled);
        assert_eq!(RunState::from_provider("stuck"), RunState::Stuck);
        assert_eq!(RunState::from_provider("weird"), RunState::Unknown);
    }

    #[test]
    fn only_finished_states_are_terminal() {
        assert!(RunState::Succeeded.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
        assert!(!RunState::Stuck.is_terminal());
        assert!(!RunState::Unknown.is_terminal());
    }
}
