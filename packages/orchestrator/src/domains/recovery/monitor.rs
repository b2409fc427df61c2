//! Project monitor.
//!
//! Lower-frequency scan over every provider project, catching runs that
//! stalled or stopped outside the iteration executor's watch.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::detector::{RecoveryDecision, RecoveryDetector, RecoveryRequest};
use super::models::RecoveryStatus;
use super::policy::RunObservation;
use crate::common::{OrchestratorError, RecoveryOperationId, Result};
use crate::domains::consolidation::RecordBatch;
use crate::domains::pagination::Paginator;
use crate::domains::sessions::models::RunCheckpoint;
use crate::kernel::{OrchestratorDeps, ProjectSummary, RunState};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MonitorAction {
    None,
    RecoveryStarted {
        operation_id: RecoveryOperationId,
        run_token: Option<String>,
    },
    CapReached,
    Skipped { reason: String },
    Error { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectCheck {
    pub project_token: String,
    pub title: String,
    pub state: RunState,
    pub decision: RecoveryDecision,
    pub action: MonitorAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringStatus {
    pub check_interval_secs: u64,
    pub stall_window_secs: u64,
    pub max_recovery_attempts: u32,
    pub recovery_attempts: BTreeMap<String, u32>,
    pub in_progress_operations: usize,
}

pub struct ProjectMonitor {
    deps: OrchestratorDeps,
    detector: Arc<RecoveryDetector>,
    check_interval: Duration,
    paginator: Paginator,
}

impl ProjectMonitor {
    pub fn new(deps: OrchestratorDeps, detector: Arc<RecoveryDetector>, check_interval: Duration) -> Self {
        let paginator = Paginator::new(detector.policy().items_per_page);
        Self {
            deps,
            detector,
            check_interval,
            paginator,
        }
    }

    /// Check every project until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(interval_secs = self.check_interval.as_secs(), "Project monitor started");
        loop {
            if let Err(e) = self.check_all().await {
                tracing::error!(error = %e, "Project monitor cycle failed");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.check_interval) => {}
            }
        }
        tracing::info!("Project monitor stopped");
    }

    /// One pass: settle finished recovery runs, then check each project.
    /// A failing project never stops the others.
    pub async fn check_all(&self) -> Result<Vec<ProjectCheck>> {
        if let Err(e) = self.reconcile_operations().await {
            tracing::warn!(error = %e, "Failed to reconcile recovery operations");
        }

        let projects = self.deps.provider.list_projects().await?;
        let mut checks = Vec::with_capacity(projects.len());

        for project in projects {
            let check = match self.check_project(&project).await {
                Ok(check) => check,
                Err(e) => {
                    tracing::error!(project_token = %project.token, error = %e, "Project check failed");
                    ProjectCheck {
                        project_token: project.token.clone(),
                        title: project.title.clone(),
                        state: project.last_run_state,
                        decision: RecoveryDecision::Healthy,
                        action: MonitorAction::Error {
                            message: e.to_string(),
                        },
                    }
                }
            };
            checks.push(check);
        }

        Ok(checks)
    }

    pub async fn check_project(&self, project: &ProjectSummary) -> Result<ProjectCheck> {
        let mut check = ProjectCheck {
            project_token: project.token.clone(),
            title: project.title.clone(),
            state: project.last_run_state,
            decision: RecoveryDecision::Healthy,
            action: MonitorAction::None,
        };

        let Some(run_token) = project.last_run_token.as_deref() else {
            return Ok(check);
        };
        // Iteration runs are watched by the executor; recovery runs and
        // already-recovered runs are settled through their operation.
        if self.deps.store.is_run_tracked(run_token).await? {
            tracing::debug!(project_token = %project.token, run_token, "Run already tracked, skipping");
            return Ok(check);
        }

        let status = self.deps.provider.get_run_status(run_token).await;
        let state = if status.state == RunState::Unknown {
            project.last_run_state
        } else {
            status.state
        };
        let record_count = status.record_count.max(project.data_count);
        let page_count = status.page_count.max(project.pages_scraped);
        check.state = state;

        let now = Utc::now();
        let checkpoint = match self.deps.store.get_checkpoint(run_token).await? {
            Some(previous) => previous.observe(record_count as i64, page_count as i64, now),
            None => RunCheckpoint::first(run_token, record_count as i64, page_count as i64, now),
        };
        self.deps.store.save_checkpoint(&checkpoint).await?;

        let observation = RunObservation {
            state,
            record_count,
            page_count,
            idle_for: checkpoint.idle_for(now).to_std().unwrap_or_default(),
        };

        check.decision = self.detector.evaluate(&project.token, &observation).await?;
        let reason = match check.decision {
            RecoveryDecision::Healthy => return Ok(check),
            RecoveryDecision::CapReached { .. } => {
                check.action = MonitorAction::CapReached;
                return Ok(check);
            }
            RecoveryDecision::Recover { reason, .. } => reason,
        };

        // Resume from the page the run was on, or from the project's start page.
        let (base_url, last_page) = match (status.current_url.as_deref(), project.main_site.as_deref()) {
            (Some(current), _) if !current.is_empty() => {
                (current.to_string(), self.paginator.extract_page_number(current))
            }
            (_, Some(site)) if !site.is_empty() => (site.to_string(), page_count.max(1)),
            _ => {
                tracing::warn!(project_token = %project.token, "No URL to resume from, skipping recovery");
                check.action = MonitorAction::Skipped {
                    reason: "no resume URL".to_string(),
                };
                return Ok(check);
            }
        };

        let last_record = self.last_record(run_token, record_count).await;

        let recovered = self
            .detector
            .recover(RecoveryRequest {
                project_token: project.token.clone(),
                original_run_token: run_token.to_string(),
                iteration_id: None,
                reason,
                base_url,
                last_page,
                last_record,
                original_count: record_count as i64,
            })
            .await;
        let operation = match recovered {
            Ok(operation) => operation,
            // Another recovery took the last attempt since `evaluate`.
            Err(OrchestratorError::Capacity {
                attempts, max_attempts, ..
            }) => {
                check.decision = RecoveryDecision::CapReached {
                    reason,
                    attempts,
                    max_attempts,
                };
                check.action = MonitorAction::CapReached;
                return Ok(check);
            }
            Err(e) => return Err(e),
        };

        check.action = MonitorAction::RecoveryStarted {
            operation_id: operation.id,
            run_token: operation.recovery_run_token.clone(),
        };
        Ok(check)
    }

    /// Close out monitor-started recovery operations whose run has finished.
    pub async fn reconcile_operations(&self) -> Result<usize> {
        let mut settled = 0;
        for mut operation in self.deps.store.list_recovery_operations(None).await? {
            if operation.status != RecoveryStatus::InProgress || operation.iteration_id.is_some() {
                continue;
            }
            let Some(run_token) = operation.recovery_run_token.clone() else {
                continue;
            };

            let status = self.deps.provider.get_run_status(&run_token).await;
            if !status.state.is_terminal() {
                continue;
            }

            let error = match status.state {
                RunState::Succeeded => None,
                other => Some(status.error.unwrap_or_else(|| format!("recovery run {}", other))),
            };
            self.detector
                .complete(&mut operation, status.record_count as i64, 0, error)
                .await?;
            settled += 1;
        }
        Ok(settled)
    }

    pub async fn status(&self) -> Result<MonitoringStatus> {
        let attempts = self.deps.store.list_recovery_attempts().await?;
        let in_progress = self
            .deps
            .store
            .list_recovery_operations(None)
            .await?
            .iter()
            .filter(|o| o.status == RecoveryStatus::InProgress)
            .count();

        Ok(MonitoringStatus {
            check_interval_secs: self.check_interval.as_secs(),
            stall_window_secs: self.detector.policy().stall_window.as_secs(),
            max_recovery_attempts: self.detector.policy().max_attempts,
            recovery_attempts: attempts.into_iter().collect(),
            in_progress_operations: in_progress,
        })
    }

    async fn last_record(&self, run_token: &str, record_count: u64) -> Option<crate::domains::consolidation::Record> {
        if record_count == 0 {
            return None;
        }
        match self.deps.provider.fetch_page(run_token, record_count - 1, 1).await {
            Ok((rows, _)) => RecordBatch::from_json(rows).records.pop(),
            Err(e) => {
                tracing::debug!(run_token, error = %e, "Could not fetch last record");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::recovery::RecoveryPolicy;
    use crate::domains::sessions::stores::MemorySessionStore;
    use crate::domains::sessions::SessionStore;
    use crate::kernel::MockScrapingProvider;
    use serde_json::json;

    fn project(state: RunState, pages: u64, records: u64) -> ProjectSummary {
        ProjectSummary {
            token: "tProj".into(),
            title: "Shop".into(),
            main_site: Some("https://x.com/items?page=1".into()),
            last_run_token: Some("run-1".into()),
            last_run_state: state,
            pages_scraped: pages,
            data_count: records,
        }
    }

    fn monitor(store: Arc<MemorySessionStore>, provider: Arc<MockScrapingProvider>) -> ProjectMonitor {
        let deps = OrchestratorDeps::new(store, provider);
        let detector = RecoveryDetector::new(deps.clone(), RecoveryPolicy::default());
        ProjectMonitor::new(deps, detector, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_cancelled_project_gets_recovery_run() {
        let mut cancelled = MockScrapingProvider::status(RunState::Cancelled, 2, 3);
        cancelled.current_url = Some("https://x.com/items?page=3".into());
        let provider = Arc::new(
            MockScrapingProvider::new()
                .with_external_run("run-1", vec![cancelled], vec![json!({"name": "a"}), json!({"name": "b"})])
                .with_completed_run("run-2", vec![]),
        );
        let store = Arc::new(MemorySessionStore::new());
        let monitor = monitor(store.clone(), provider.clone());

        let check = monitor
            .check_project(&project(RunState::Cancelled, 3, 2))
            .await
            .unwrap();

        assert!(matches!(
            check.action,
            MonitorAction::RecoveryStarted { ref run_token, .. } if run_token.as_deref() == Some("run-2")
        ));
        assert!(provider.was_started_at("https://x.com/items?page=4"));
        let ops = store.list_recovery_operations(Some("tProj")).await.unwrap();
        assert_eq!(ops[0].last_record_name.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_healthy_project_untouched() {
        let provider = Arc::new(MockScrapingProvider::new().with_external_run(
            "run-1",
            vec![MockScrapingProvider::status(RunState::Running, 50, 3)],
            vec![],
        ));
        let store = Arc::new(MemorySessionStore::new());
        let monitor = monitor(store.clone(), provider.clone());

        let check = monitor
            .check_project(&project(RunState::Running, 3, 50))
            .await
            .unwrap();
        assert_eq!(check.decision, RecoveryDecision::Healthy);
        assert!(provider.start_calls().is_empty());
        assert!(store.get_checkpoint("run-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_status_reports_attempts() {
        let store = Arc::new(MemorySessionStore::new());
        store.set_recovery_attempts("tProj", 2);
        let monitor = monitor(store, Arc::new(MockScrapingProvider::new()));

        let status = monitor.status().await.unwrap();
        assert_eq!(status.max_recovery_attempts, 3);
        assert_eq!(status.recovery_attempts.get("tProj"), Some(&2));
    }
}
