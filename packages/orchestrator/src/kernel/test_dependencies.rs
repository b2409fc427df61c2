// Test dependencies - mock implementations for testing
//
// Provides a scripted scraping provider that can be injected into
// OrchestratorDeps for tests and dry runs.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use super::{BaseScrapingProvider, ProjectSummary, ProviderRunStatus, RunState};
use crate::common::{OrchestratorError, Result};

// =============================================================================
// Mock Scraping Provider
// =============================================================================

/// Arguments captured from a start_run call
#[derive(Debug, Clone, PartialEq)]
pub struct StartRunCall {
    pub project_token: String,
    pub start_url: String,
}

/// Arguments captured from a fetch_page call
#[derive(Debug, Clone, PartialEq)]
pub struct FetchCall {
    pub run_token: String,
    pub offset: u64,
    pub limit: u64,
}

struct ScriptedRun {
    token: String,
    statuses: VecDeque<ProviderRunStatus>,
    records: Vec<Value>,
    /// Record count reported by the most recent status; caps what fetch_page returns.
    visible: Option<u64>,
}

/// Scripted provider.
///
/// Each `with_run` queues one run. `start_run` hands them out in order; every
/// `get_run_status` pops the next scripted status and the last one repeats.
/// `fetch_page` only exposes as many records as the last status reported.
pub struct MockScrapingProvider {
    pending: Arc<Mutex<VecDeque<String>>>,
    runs: Arc<Mutex<HashMap<String, ScriptedRun>>>,
    projects: Arc<Mutex<Vec<ProjectSummary>>>,
    start_failures: Arc<Mutex<u32>>,
    /// (first failing offset, remaining failures)
    fetch_failures: Arc<Mutex<(u64, u32)>>,
    start_calls: Arc<Mutex<Vec<StartRunCall>>>,
    status_calls: Arc<Mutex<Vec<String>>>,
    fetch_calls: Arc<Mutex<Vec<FetchCall>>>,
}

impl Default for MockScrapingProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockScrapingProvider {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(VecDeque::new())),
            runs: Arc::new(Mutex::new(HashMap::new())),
            projects: Arc::new(Mutex::new(Vec::new())),
            start_failures: Arc::new(Mutex::new(0)),
            fetch_failures: Arc::new(Mutex::new((0, 0))),
            start_calls: Arc::new(Mutex::new(Vec::new())),
            status_calls: Arc::new(Mutex::new(Vec::new())),
            fetch_calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a run that will be handed out by the next unclaimed `start_run`.
    pub fn with_run(self, token: &str, statuses: Vec<ProviderRunStatus>, records: Vec<Value>) -> Self {
        self.pending.lock().unwrap().push_back(token.to_string());
        self.with_external_run(token, statuses, records)
    }

    /// Register a run that already exists on the provider side (started
    /// elsewhere). It is never handed out by `start_run`.
    pub fn with_external_run(
        self,
        token: &str,
        statuses: Vec<ProviderRunStatus>,
        records: Vec<Value>,
    ) -> Self {
        self.runs.lock().unwrap().insert(
            token.to_string(),
            ScriptedRun {
                token: token.to_string(),
                statuses: statuses.into(),
                records,
                visible: None,
            },
        );
        self
    }

    /// Queue a run that succeeds on the first poll with all `records` available.
    pub fn with_completed_run(self, token: &str, records: Vec<Value>) -> Self {
        let status = Self::status(RunState::Succeeded, records.len() as u64, 1);
        self.with_run(token, vec![status], records)
    }

    pub fn with_project(self, project: ProjectSummary) -> Self {
        self.projects.lock().unwrap().push(project);
        self
    }

    /// Make the next `count` calls to `start_run` fail with a transport error.
    pub fn with_start_failures(self, count: u32) -> Self {
        *self.start_failures.lock().unwrap() = count;
        self
    }

    /// Make the next `count` calls to `fetch_page` at or past `from_offset`
    /// fail with a transport error.
    pub fn with_fetch_failures(self, from_offset: u64, count: u32) -> Self {
        *self.fetch_failures.lock().unwrap() = (from_offset, count);
        self
    }

    /// Shorthand for building scripted statuses.
    pub fn status(state: RunState, record_count: u64, page_count: u64) -> ProviderRunStatus {
        ProviderRunStatus {
            state,
            record_count,
            page_count,
            current_url: None,
            error: None,
        }
    }

    pub fn start_calls(&self) -> Vec<StartRunCall> {
        self.start_calls.lock().unwrap().clone()
    }

    pub fn status_calls(&self) -> Vec<String> {
        self.status_calls.lock().unwrap().clone()
    }

    pub fn fetch_calls(&self) -> Vec<FetchCall> {
        self.fetch_calls.lock().unwrap().clone()
    }

    /// Check if a run was started from this URL
    pub fn was_started_at(&self, url: &str) -> bool {
        self.start_calls
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.start_url == url)
    }
}

#[async_trait]
impl BaseScrapingProvider for MockScrapingProvider {
    async fn start_run(&self, project_token: &str, start_url: &str) -> Result<String> {
        self.start_calls.lock().unwrap().push(StartRunCall {
            project_token: project_token.to_string(),
            start_url: start_url.to_string(),
        });

        {
            let mut failures = self.start_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(OrchestratorError::Transport("mock start failure".into()));
            }
        }

        if let Some(token) = self.pending.lock().unwrap().pop_front() {
            return Ok(token);
        }

        // Unscripted runs finish immediately with no data.
        let token = format!("mock-run-{}", self.start_calls.lock().unwrap().len());
        self.runs.lock().unwrap().insert(
            token.clone(),
            ScriptedRun {
                token: token.clone(),
                statuses: VecDeque::from(vec![Self::status(RunState::Succeeded, 0, 0)]),
                records: Vec::new(),
                visible: None,
            },
        );
        Ok(token)
    }

    async fn get_run_status(&self, run_token: &str) -> ProviderRunStatus {
        self.status_calls.lock().unwrap().push(run_token.to_string());

        let mut runs = self.runs.lock().unwrap();
        let Some(run) = runs.get_mut(run_token) else {
            return ProviderRunStatus::unreachable(format!("unknown run {}", run_token));
        };

        let status = if run.statuses.len() > 1 {
            run.statuses.pop_front()
        } else {
            run.statuses.front().cloned()
        };

        match status {
            Some(status) => {
                if status.state != RunState::Unknown {
                    run.visible = Some(status.record_count);
                }
                status
            }
            None => ProviderRunStatus::unreachable(format!("no script for {}", run.token)),
        }
    }

    async fn fetch_page(
        &self,
        run_token: &str,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<Value>, u64)> {
        self.fetch_calls.lock().unwrap().push(FetchCall {
            run_token: run_token.to_string(),
            offset,
            limit,
        });

        {
            let mut failures = self.fetch_failures.lock().unwrap();
            if failures.1 > 0 && offset >= failures.0 {
                failures.1 -= 1;
                return Err(OrchestratorError::Transport("mock fetch failure".into()));
            }
        }

        let runs = self.runs.lock().unwrap();
        let run = runs
            .get(run_token)
            .ok_or_else(|| OrchestratorError::not_found("run", run_token))?;

        let total = run
            .visible
            .map(|v| v.min(run.records.len() as u64))
            .unwrap_or(run.records.len() as u64);
        let start = offset.min(total) as usize;
        let end = offset.saturating_add(limit).min(total) as usize;

        Ok((run.records[start..end].to_vec(), total))
    }

    async fn list_projects(&self) -> Result<Vec<ProjectSummary>> {
        Ok(self.projects.lock().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn scripted_statuses_advance_and_last_repeats() {
        let mock = MockScrapingProvider::new().with_run(
            "r1",
            vec![
                MockScrapingProvider::status(RunState::Running, 1, 1),
                MockScrapingProvider::status(RunState::Succeeded, 2, 1),
            ],
            vec![json!({"a": 1}), json!({"a": 2})],
        );

        let token = mock.start_run("p", "https://x.com").await.unwrap();
        assert_eq!(token, "r1");

        assert_eq!(mock.get_run_status("r1").await.state, RunState::Running);
        let (rows, total) = mock.fetch_page("r1", 0, 10).await.unwrap();
        assert_eq!((rows.len(), total), (1, 1));

        assert_eq!(mock.get_run_status("r1").await.state, RunState::Succeeded);
        assert_eq!(mock.get_run_status("r1").await.state, RunState::Succeeded);
        let (rows, total) = mock.fetch_page("r1", 1, 10).await.unwrap();
        assert_eq!((rows.len(), total), (1, 2));
    }

    #[tokio::test]
    async fn fetch_failures_only_hit_later_offsets() {
        let mock = MockScrapingProvider::new()
            .with_completed_run("r1", vec![json!({"a": 1}), json!({"a": 2})])
            .with_fetch_failures(1, 1);
        mock.get_run_status("r1").await;

        assert!(mock.fetch_page("r1", 0, 1).await.is_ok());
        assert!(mock.fetch_page("r1", 1, 1).await.is_err());
        let (rows, _) = mock.fetch_page("r1", 1, 1).await.unwrap();
        assert_eq!(rows, vec![json!({"a": 2})]);
    }

    #[tokio::test]
    async fn unknown_run_reports_unreachable() {
        let mock = MockScrapingProvider::new();
        let status = mock.get_run_status("missing").await;
        assert_eq!(status.state, RunState::Unknown);
        assert!(status.error.is_some());
    }
}
