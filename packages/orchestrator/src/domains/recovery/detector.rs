//! Recovery detector.
//!
//! Decides whether a stalled or cut-short provider run gets a recovery run,
//! and starts one. Per-project attempt counters are persisted in the store and
//! only an explicit operator reset clears them.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use super::models::{RecoveryOperation, RecoveryReason, RecoveryStatus};
use super::policy::{RecoveryPolicy, RunObservation};
use crate::common::{IterationId, OrchestratorError, Result};
use crate::domains::consolidation::batch::value_to_cell;
use crate::domains::consolidation::Record;
use crate::domains::pagination::Paginator;
use crate::kernel::OrchestratorDeps;

/// Keys tried, in order, when reading a record's URL.
const URL_KEYS: [&str; 3] = ["url", "product_url", "link"];
/// Keys tried, in order, when reading a record's name.
const NAME_KEYS: [&str; 2] = ["name", "title"];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RecoveryDecision {
    /// Nothing wrong with the run.
    Healthy,
    /// Recovery is warranted and allowed; `attempt` is the number it would get.
    Recover { reason: RecoveryReason, attempt: u32 },
    /// Recovery is warranted but the project has used up its attempts.
    CapReached {
        reason: RecoveryReason,
        attempts: u32,
        max_attempts: u32,
    },
}

/// Everything needed to resume a run from its last known position.
#[derive(Debug, Clone)]
pub struct RecoveryRequest {
    pub project_token: String,
    pub original_run_token: String,
    pub iteration_id: Option<IterationId>,
    pub reason: RecoveryReason,
    /// URL the resume URL is derived from (the run's start or current URL).
    pub base_url: String,
    /// Last page known to be scraped; recovery resumes at the page after it.
    pub last_page: u64,
    pub last_record: Option<Record>,
    pub original_count: i64,
}

pub struct RecoveryDetector {
    deps: OrchestratorDeps,
    policy: RecoveryPolicy,
    paginator: Paginator,
}

impl RecoveryDetector {
    pub fn new(deps: OrchestratorDeps, policy: RecoveryPolicy) -> Arc<Self> {
        Arc::new(Self {
            paginator: Paginator::new(policy.items_per_page),
            deps,
            policy,
        })
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    /// Classify the observation and check it against the attempt cap.
    pub async fn evaluate(&self, project_token: &str, observation: &RunObservation) -> Result<RecoveryDecision> {
        let Some(reason) = self.policy.classify(observation) else {
            return Ok(RecoveryDecision::Healthy);
        };

        let attempts = self.deps.store.recovery_attempts(project_token).await?;
        if attempts >= self.policy.max_attempts {
            tracing::warn!(
                project_token,
                reason = reason.as_str(),
                attempts,
                max_attempts = self.policy.max_attempts,
                "Recovery cap reached, leaving run as is"
            );
            return Ok(RecoveryDecision::CapReached {
                reason,
                attempts,
                max_attempts: self.policy.max_attempts,
            });
        }

        Ok(RecoveryDecision::Recover {
            reason,
            attempt: attempts + 1,
        })
    }

    /// Start a recovery run resuming at `last_page + 1`.
    ///
    /// Fails with `Capacity` and changes nothing when the cap is reached.
    /// Otherwise the attempt counter is incremented before the run is
    /// started, so a failing start still consumes an attempt. Concurrent
    /// callers never push the counter past the cap.
    pub async fn recover(&self, request: RecoveryRequest) -> Result<RecoveryOperation> {
        let store = &self.deps.store;
        let max_attempts = self.policy.max_attempts;

        let Some(attempt) = store
            .increment_recovery_attempts(&request.project_token, max_attempts)
            .await?
        else {
            let attempts = store.recovery_attempts(&request.project_token).await?;
            return Err(OrchestratorError::Capacity {
                project_token: request.project_token,
                attempts,
                max_attempts,
            });
        };

        let resume_page = request.last_page + 1;
        let resume_url = self
            .paginator
            .next_page_url(&request.base_url, resume_page, None);
        let (last_record_url, last_record_name) = request
            .last_record
            .as_ref()
            .map(|r| (first_text(r, &URL_KEYS), first_text(r, &NAME_KEYS)))
            .unwrap_or((None, None));

        let mut operation = RecoveryOperation::builder()
            .project_token(request.project_token.clone())
            .original_run_token(request.original_run_token.clone())
            .resume_page(i32::try_from(resume_page).unwrap_or(i32::MAX))
            .resume_url(resume_url.clone())
            .reason(request.reason.as_str())
            .attempt_number(attempt as i32)
            .original_count(request.original_count)
            .triggered_at(Utc::now())
            .build();
        operation.iteration_id = request.iteration_id;
        operation.last_record_url = last_record_url;
        operation.last_record_name = last_record_name;

        store.insert_recovery_operation(&operation).await?;

        tracing::info!(
            project_token = %request.project_token,
            original_run_token = %request.original_run_token,
            reason = request.reason.as_str(),
            resume_page,
            resume_url = %resume_url,
            attempt,
            "Starting recovery run"
        );

        match self
            .deps
            .provider
            .start_run(&request.project_token, &resume_url)
            .await
        {
            Ok(run_token) => {
                operation.recovery_run_token = Some(run_token);
                operation.status = RecoveryStatus::InProgress;
                operation.started_at = Some(Utc::now());
                store.update_recovery_operation(&operation).await?;
                Ok(operation)
            }
            Err(e) => {
                tracing::error!(
                    project_token = %request.project_token,
                    error = %e,
                    "Recovery run failed to start"
                );
                operation.finish(0, 0, Some(e.to_string()));
                store.update_recovery_operation(&operation).await?;
                Err(e)
            }
        }
    }

    /// Record the outcome of a recovery run.
    pub async fn complete(
        &self,
        operation: &mut RecoveryOperation,
        recovered: i64,
        duplicates: i64,
        error: Option<String>,
    ) -> Result<()> {
        operation.finish(recovered, duplicates, error);
        self.deps.store.update_recovery_operation(operation).await?;

        tracing::info!(
            operation_id = %operation.id,
            status = ?operation.status,
            recovered,
            duplicates,
            final_count = operation.final_count,
            "Recovery operation finished"
        );
        Ok(())
    }

    /// Operator action: clear a project's attempt counter.
    pub async fn reset_attempts(&self, project_token: &str) -> Result<()> {
        self.deps.store.reset_recovery_attempts(project_token).await?;
        tracing::info!(project_token, "Recovery attempts reset");
        Ok(())
    }
}

fn first_text(record: &Record, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| record.get(*k))
        .map(value_to_cell)
        .find(|v| !v.is_empty())
}
