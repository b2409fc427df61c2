//! Orchestrator dependencies (using traits for testability)
//!
//! This module provides the dependency container handed to every activity.
//! The provider and the store are trait objects so tests can swap in mocks.

use async_trait::async_trait;
use parsehub_client::{ParseHubClient, ParseHubError};
use serde_json::Value;
use std::sync::Arc;

use crate::common::{OrchestratorError, Result};
use crate::domains::sessions::SessionStore;
use crate::kernel::{BaseScrapingProvider, ProjectSummary, ProviderRunStatus, RunState};

// =============================================================================
// ParseHubClient Adapter (implements BaseScrapingProvider trait)
// =============================================================================

/// Wrapper around ParseHubClient that implements BaseScrapingProvider
pub struct ParseHubAdapter(pub Arc<ParseHubClient>);

impl ParseHubAdapter {
    pub fn new(client: Arc<ParseHubClient>) -> Self {
        Self(client)
    }
}

fn classify(err: ParseHubError) -> OrchestratorError {
    match err {
        ParseHubError::Transport(e) => OrchestratorError::Transport(e.to_string()),
        ParseHubError::Api { status, message } => OrchestratorError::ProviderJob {
            run_token: String::new(),
            status: status.to_string(),
            message,
        },
        ParseHubError::Decode(e) => OrchestratorError::Data(e.to_string()),
    }
}

#[async_trait]
impl BaseScrapingProvider for ParseHubAdapter {
    async fn start_run(&self, project_token: &str, start_url: &str) -> Result<String> {
        let run = self
            .0
            .start_run(project_token, start_url)
            .await
            .map_err(classify)?;

        if run.run_token.is_empty() {
            return Err(OrchestratorError::Data(format!(
                "provider returned no run token for project {}",
                project_token
            )));
        }
        Ok(run.run_token)
    }

    async fn get_run_status(&self, run_token: &str) -> ProviderRunStatus {
        match self.0.get_run(run_token).await {
            Ok(run) => ProviderRunStatus {
                state: RunState::from_provider(&run.status),
                record_count: run.data_count,
                page_count: run.pages_crawled,
                current_url: run.page_crawled_url,
                error: run.error_log.filter(|e| !e.is_empty()),
            },
            Err(e) => {
                tracing::warn!(run_token, error = %e, "Provider status request failed");
                ProviderRunStatus::unreachable(e.to_string())
            }
        }
    }

    async fn fetch_page(
        &self,
        run_token: &str,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<Value>, u64)> {
        let chunk = self
            .0
            .get_run_data(run_token, offset, limit)
            .await
            .map_err(classify)?;
        Ok((chunk.data, chunk.total_count))
    }

    async fn list_projects(&self) -> Result<Vec<ProjectSummary>> {
        let projects = self.0.list_projects().await.map_err(classify)?;

        Ok(projects
            .into_iter()
            .map(|p| {
                let last_run = p.last_run.unwrap_or_default();
                ProjectSummary {
                    title: p.title.unwrap_or_else(|| p.token.clone()),
                    token: p.token,
                    main_site: p.main_site,
                    last_run_token: last_run.run_token,
                    last_run_state: last_run
                        .status
                        .as_deref()
                        .map(RunState::from_provider)
                        .unwrap_or(RunState::Unknown),
                    pages_scraped: last_run.pages_scraped,
                    data_count: last_run.data_count,
                }
            })
            .collect())
    }
}

// =============================================================================
// OrchestratorDeps
// =============================================================================

/// Dependencies accessible to activities
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub store: Arc<dyn SessionStore>,
    pub provider: Arc<dyn BaseScrapingProvider>,
}

impl OrchestratorDeps {
    pub fn new(store: Arc<dyn SessionStore>, provider: Arc<dyn BaseScrapingProvider>) -> Self {
        Self { store, provider }
    }
}
