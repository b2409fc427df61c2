//! Iteration executor.
//!
//! Runs one iteration of a session: starts a provider run at the iteration's
//! first page, polls it until it reaches a terminal state and ingests records
//! as they appear. Stalls and provider-side cancellations go to the recovery
//! detector; an approved recovery run replaces the original and its records
//! land in the same iteration.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::fetch::{drain_run, RunCursor};
use crate::common::{IterationId, OrchestratorError, Result, SessionId};
use crate::domains::consolidation::{Consolidator, Record, RecordBatch};
use crate::domains::pagination::{Paginator, PatternKind, DEFAULT_ITEMS_PER_PAGE};
use crate::domains::recovery::{
    RecoveryDecision, RecoveryDetector, RecoveryOperation, RecoveryReason, RecoveryRequest,
    RunObservation,
};
use crate::domains::sessions::models::{
    Iteration, IterationStatus, ResultRecord, RunCheckpoint, Session, SessionStatus,
};
use crate::kernel::{OrchestratorDeps, ProviderRunStatus, RunState};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub poll_interval: Duration,
    /// Upper bound for the backoff applied while the provider is unreachable.
    pub max_poll_backoff: Duration,
    /// Total time one iteration may spend polling.
    pub max_poll_duration: Duration,
    pub fetch_page_limit: u64,
    pub max_fetch_chunks_per_poll: u32,
    pub items_per_page: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_poll_backoff: Duration::from_secs(30),
            max_poll_duration: Duration::from_secs(2 * 60 * 60),
            fetch_page_limit: 100,
            max_fetch_chunks_per_poll: 50,
            items_per_page: DEFAULT_ITEMS_PER_PAGE,
        }
    }
}

impl ExecutorConfig {
    /// Delay before the next poll after `failures` consecutive unreachable polls.
    pub fn poll_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.poll_interval;
        }
        let factor = 2u32.saturating_pow(failures.min(16));
        self.poll_interval
            .saturating_mul(factor)
            .min(self.max_poll_backoff.max(self.poll_interval))
    }
}

/// Outcome of one executed iteration.
#[derive(Debug, Clone, Serialize)]
pub struct IterationReport {
    pub iteration_id: IterationId,
    pub status: IterationStatus,
    /// Token of the last run polled (a recovery run if one took over).
    pub run_token: Option<String>,
    /// Unique records this iteration added to the session.
    pub record_count: i64,
    pub duplicates: u64,
    pub recoveries: u32,
    pub error: Option<String>,
}

impl IterationReport {
    pub fn is_success(&self) -> bool {
        self.status == IterationStatus::Completed
    }
}

enum RunEnd {
    Completed,
    Failed(String),
}

/// Records ingested so far across every run of the iteration.
struct Ingest {
    consolidator: Consolidator,
    record_count: i64,
    duplicates: u64,
    recoveries: u32,
}

/// The provider run currently being polled.
struct ActiveRun {
    cursor: RunCursor,
    /// Page the run was started at.
    first_page: u64,
    operation: Option<RecoveryOperation>,
    checkpoint: Option<RunCheckpoint>,
    record_count: u64,
    page_count: u64,
    current_url: Option<String>,
    max_page_seen: u64,
    last_record: Option<Record>,
    inserted: i64,
    duplicates: u64,
}

impl ActiveRun {
    fn new(run_token: String, first_page: u64) -> Self {
        Self {
            cursor: RunCursor::new(run_token),
            first_page,
            operation: None,
            checkpoint: None,
            record_count: 0,
            page_count: 0,
            current_url: None,
            max_page_seen: 0,
            last_record: None,
            inserted: 0,
            duplicates: 0,
        }
    }

    fn token(&self) -> &str {
        &self.cursor.run_token
    }

    fn observe(&mut self, status: &ProviderRunStatus) {
        self.record_count = self.record_count.max(status.record_count);
        self.page_count = self.page_count.max(status.page_count);
        if let Some(url) = status.current_url.as_ref().filter(|u| !u.is_empty()) {
            self.current_url = Some(url.clone());
        }
    }

    fn note_batch(&mut self, batch: &RecordBatch) {
        if batch.page_column().is_some() {
            self.max_page_seen = self.max_page_seen.max(batch.max_page_number());
        }
        if let Some(last) = batch.records.last() {
            self.last_record = Some(last.clone());
        }
    }

    /// Last page this run is known to have scraped: the records' page column,
    /// then the page in the provider's current URL, then the provider's page
    /// count counted from the first page.
    fn last_page(&self, paginator: &Paginator) -> u64 {
        if self.max_page_seen > 0 {
            return self.max_page_seen;
        }
        if let Some(url) = &self.current_url {
            let info = paginator.detect_pattern(url);
            if !matches!(info.kind, PatternKind::Unknown | PatternKind::QueryCustom(_)) {
                return info.current_page;
            }
        }
        self.first_page.saturating_sub(1) + self.page_count
    }
}

pub struct IterationExecutor {
    deps: OrchestratorDeps,
    detector: Arc<RecoveryDetector>,
    config: ExecutorConfig,
    paginator: Paginator,
}

impl IterationExecutor {
    pub fn new(deps: OrchestratorDeps, detector: Arc<RecoveryDetector>, config: ExecutorConfig) -> Self {
        let paginator = Paginator::new(config.items_per_page);
        Self {
            deps,
            detector,
            config,
            paginator,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run `iteration` (already inserted as pending) to a terminal state.
    ///
    /// Provider-side failures finish the iteration as failed and are reported
    /// in the returned [`IterationReport`]. Cancellation (of the session or of
    /// `shutdown`) and storage errors also fail the iteration but are
    /// returned as errors.
    pub async fn execute(
        &self,
        session: &Session,
        iteration: &Iteration,
        base_url: &str,
        shutdown: &CancellationToken,
    ) -> Result<IterationReport> {
        let store = &self.deps.store;
        let start_page = iteration.start_page.max(1) as u64;
        let target_url = self.paginator.next_page_url(base_url, start_page, None);

        let mut report = IterationReport {
            iteration_id: iteration.id,
            status: IterationStatus::Failed,
            run_token: None,
            record_count: 0,
            duplicates: 0,
            recoveries: 0,
            error: None,
        };

        let run_token = match self
            .deps
            .provider
            .start_run(&session.project_token, &target_url)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                tracing::error!(
                    session_id = %session.id,
                    iteration = iteration.iteration_number,
                    error = %e,
                    "Failed to start provider run"
                );
                let message = e.to_string();
                store
                    .finish_iteration(iteration.id, IterationStatus::Failed, 0, Some(&message))
                    .await?;
                report.error = Some(message);
                return Ok(report);
            }
        };

        store
            .start_iteration(iteration.id, &run_token, &target_url)
            .await?;
        tracing::info!(
            session_id = %session.id,
            iteration = iteration.iteration_number,
            attempt = iteration.attempt,
            start_page = iteration.start_page,
            end_page = iteration.end_page,
            run_token = %run_token,
            target_url = %target_url,
            "Iteration started"
        );

        let known = store
            .list_records(session.id)
            .await?
            .into_iter()
            .map(|r| r.fingerprint);
        let mut ingest = Ingest {
            consolidator: Consolidator::new(session.dedup_strategy.clone()).with_known_keys(known),
            record_count: 0,
            duplicates: 0,
            recoveries: 0,
        };
        let mut run = ActiveRun::new(run_token, start_page);

        let outcome = self
            .poll(session, iteration, &target_url, &mut run, &mut ingest, shutdown)
            .await;

        report.run_token = Some(run.token().to_string());
        report.record_count = ingest.record_count;
        report.duplicates = ingest.duplicates;
        report.recoveries = ingest.recoveries;

        let end = match outcome {
            Ok(end) => end,
            Err(e) => {
                let message = match &e {
                    OrchestratorError::Cancelled => "cancelled before the run finished".to_string(),
                    other => other.to_string(),
                };
                tracing::warn!(
                    session_id = %session.id,
                    iteration = iteration.iteration_number,
                    error = %message,
                    "Iteration aborted"
                );
                if let Err(finish_err) = self.settle_recovery(&mut run, Some(message.clone())).await {
                    tracing::warn!(error = %finish_err, "Failed to close recovery operation");
                }
                if let Err(finish_err) = store
                    .finish_iteration(
                        iteration.id,
                        IterationStatus::Failed,
                        ingest.record_count,
                        Some(&message),
                    )
                    .await
                {
                    tracing::warn!(error = %finish_err, "Failed to mark aborted iteration");
                }
                return Err(e);
            }
        };

        match end {
            RunEnd::Completed => {
                report.status = IterationStatus::Completed;
                tracing::info!(
                    session_id = %session.id,
                    iteration = iteration.iteration_number,
                    records = ingest.record_count,
                    duplicates = ingest.duplicates,
                    recoveries = ingest.recoveries,
                    "Iteration completed"
                );
            }
            RunEnd::Failed(message) => {
                tracing::warn!(
                    session_id = %session.id,
                    iteration = iteration.iteration_number,
                    error = %message,
                    "Iteration failed"
                );
                report.error = Some(message);
            }
        }

        store
            .finish_iteration(
                iteration.id,
                report.status,
                report.record_count,
                report.error.as_deref(),
            )
            .await?;
        Ok(report)
    }

    async fn poll(
        &self,
        session: &Session,
        iteration: &Iteration,
        target_url: &str,
        run: &mut ActiveRun,
        ingest: &mut Ingest,
        shutdown: &CancellationToken,
    ) -> Result<RunEnd> {
        let started = Instant::now();
        let mut unreachable = 0u32;
        let mut fetch_failures = 0u32;
        // Set while a finished run still has records the drain could not fetch.
        let mut data_pending = false;

        loop {
            self.ensure_active(session.id, shutdown).await?;

            if started.elapsed() > self.config.max_poll_duration {
                let message = if data_pending {
                    format!(
                        "run {} finished but records from offset {} were not fetched after {}s",
                        run.token(),
                        run.cursor.offset,
                        self.config.max_poll_duration.as_secs()
                    )
                } else {
                    format!(
                        "no terminal status for run {} after {}s",
                        run.token(),
                        self.config.max_poll_duration.as_secs()
                    )
                };
                self.settle_recovery(run, Some(message.clone())).await?;
                return Ok(RunEnd::Failed(message));
            }

            let status = self.deps.provider.get_run_status(run.token()).await;
            if status.state == RunState::Unknown {
                unreachable += 1;
                tracing::debug!(
                    run_token = %run.token(),
                    failures = unreachable,
                    error = status.error.as_deref().unwrap_or_default(),
                    "Provider unreachable"
                );
            } else {
                unreachable = 0;
                run.observe(&status);
                let interrupted = self
                    .ingest(session, iteration, run, ingest, status.state.is_terminal())
                    .await?;
                fetch_failures = if interrupted { fetch_failures.saturating_add(1) } else { 0 };
                data_pending = status.state.is_terminal()
                    && status.state != RunState::Failed
                    && (interrupted || !run.cursor.is_drained());
            }

            let idle_for = self.checkpoint(run).await?;

            if data_pending {
                tracing::info!(
                    run_token = %run.token(),
                    state = %status.state,
                    offset = run.cursor.offset,
                    total = run.cursor.total_count,
                    "Run finished with records left to fetch"
                );
                self.pause(shutdown, unreachable.max(fetch_failures)).await?;
                continue;
            }

            match status.state {
                RunState::Succeeded => {
                    self.settle_recovery(run, None).await?;
                    return Ok(RunEnd::Completed);
                }
                RunState::Failed => {
                    let message = status
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("provider run {} failed", run.token()));
                    self.settle_recovery(run, Some(message.clone())).await?;
                    return Ok(RunEnd::Failed(message));
                }
                _ => {}
            }

            let observation = RunObservation {
                state: status.state,
                record_count: run.record_count,
                page_count: run.page_count,
                idle_for,
            };
            let decision = self
                .detector
                .evaluate(&session.project_token, &observation)
                .await?;

            if decision != RecoveryDecision::Healthy
                && run.last_page(&self.paginator) >= iteration.end_page.max(0) as u64
            {
                tracing::info!(
                    run_token = %run.token(),
                    state = %status.state,
                    "Run stopped after covering the iteration range"
                );
                self.settle_recovery(run, None).await?;
                return Ok(RunEnd::Completed);
            }

            match decision {
                RecoveryDecision::Healthy => {}
                RecoveryDecision::CapReached {
                    reason,
                    attempts,
                    max_attempts,
                } => {
                    let message = format!(
                        "run {} {} and recovery cap reached ({}/{})",
                        run.token(),
                        reason.as_str(),
                        attempts,
                        max_attempts
                    );
                    self.settle_recovery(run, Some(message.clone())).await?;
                    return Ok(RunEnd::Failed(message));
                }
                RecoveryDecision::Recover { reason, .. } => {
                    if let Err(message) = self
                        .hand_off(session, iteration, target_url, run, ingest, reason)
                        .await?
                    {
                        return Ok(RunEnd::Failed(message));
                    }
                    unreachable = 0;
                }
            }

            self.pause(shutdown, unreachable.max(fetch_failures)).await?;
        }
    }

    async fn pause(&self, shutdown: &CancellationToken, failures: u32) -> Result<()> {
        tokio::select! {
            _ = shutdown.cancelled() => Err(OrchestratorError::Cancelled),
            _ = tokio::time::sleep(self.config.poll_delay(failures)) => Ok(()),
        }
    }

    /// Replace `run` with a recovery run resuming after its last page.
    /// The inner error is a job-level failure message.
    async fn hand_off(
        &self,
        session: &Session,
        iteration: &Iteration,
        target_url: &str,
        run: &mut ActiveRun,
        ingest: &mut Ingest,
        reason: RecoveryReason,
    ) -> Result<std::result::Result<(), String>> {
        let last_page = run.last_page(&self.paginator);
        self.settle_recovery(run, Some(format!("recovery run {}", reason.as_str())))
            .await?;

        let request = RecoveryRequest {
            project_token: session.project_token.clone(),
            original_run_token: run.token().to_string(),
            iteration_id: Some(iteration.id),
            reason,
            base_url: target_url.to_string(),
            last_page,
            last_record: run.last_record.clone(),
            original_count: ingest.record_count,
        };

        let operation = match self.detector.recover(request).await {
            Ok(operation) => operation,
            Err(e @ OrchestratorError::Storage(_)) => return Err(e),
            Err(e) => return Ok(Err(e.to_string())),
        };
        let Some(token) = operation.recovery_run_token.clone() else {
            return Ok(Err(format!("recovery operation {} has no run", operation.id)));
        };

        self.deps
            .store
            .update_iteration_progress(iteration.id, &token, ingest.record_count)
            .await?;

        tracing::info!(
            session_id = %session.id,
            iteration = iteration.iteration_number,
            original_run_token = %run.token(),
            recovery_run_token = %token,
            resume_page = operation.resume_page,
            "Recovery run took over"
        );

        let mut next = ActiveRun::new(token, last_page + 1);
        next.operation = Some(operation);
        *run = next;
        ingest.recoveries += 1;
        Ok(Ok(()))
    }

    /// Pull newly available records and persist the ones not seen before.
    /// A finished run is drained to the end; otherwise one bounded drain.
    /// Returns whether a fetch failed, leaving rows for the next poll.
    async fn ingest(
        &self,
        session: &Session,
        iteration: &Iteration,
        run: &mut ActiveRun,
        ingest: &mut Ingest,
        to_end: bool,
    ) -> Result<bool> {
        loop {
            let drained = drain_run(
                self.deps.provider.as_ref(),
                &mut run.cursor,
                self.config.fetch_page_limit,
                self.config.max_fetch_chunks_per_poll,
            )
            .await;
            let progressed = !drained.rows.is_empty();

            if progressed {
                self.absorb(session, iteration, run, ingest, drained.rows)
                    .await?;
            }

            if drained.interrupted {
                return Ok(true);
            }
            if !to_end || !progressed || run.cursor.is_drained() {
                return Ok(false);
            }
        }
    }

    async fn absorb(
        &self,
        session: &Session,
        iteration: &Iteration,
        run: &mut ActiveRun,
        ingest: &mut Ingest,
        rows: Vec<serde_json::Value>,
    ) -> Result<()> {
        let batch = RecordBatch::from_json(rows);
        run.note_batch(&batch);
        let page_column = batch.page_column().map(str::to_string);
        let fetched = batch.len();

        let added = ingest.consolidator.absorb(batch);
        let duplicates = (fetched - added.len()) as u64;
        run.duplicates += duplicates;
        ingest.duplicates += duplicates;

        if added.is_empty() {
            return Ok(());
        }

        let records: Vec<ResultRecord> = added
            .into_iter()
            .map(|(key, record)| {
                ResultRecord::from_record(session.id, iteration.id, key, record, page_column.as_deref())
            })
            .collect();
        let inserted = self.deps.store.insert_records(&records).await? as i64;
        run.inserted += inserted;
        ingest.record_count += inserted;

        self.deps
            .store
            .update_iteration_progress(iteration.id, run.token(), ingest.record_count)
            .await?;

        tracing::debug!(
            run_token = %run.token(),
            fetched,
            inserted,
            duplicates,
            total = ingest.record_count,
            "Ingested records"
        );
        Ok(())
    }

    /// Persist the run's progress and return how long it has been idle.
    async fn checkpoint(&self, run: &mut ActiveRun) -> Result<Duration> {
        let now = Utc::now();
        let records = run.record_count as i64;
        let pages = run.page_count as i64;

        let previous = match run.checkpoint.take() {
            Some(previous) => Some(previous),
            None => self.deps.store.get_checkpoint(run.token()).await?,
        };
        let checkpoint = match previous {
            Some(previous) => previous.observe(records, pages, now),
            None => RunCheckpoint::first(run.token(), records, pages, now),
        };

        self.deps.store.save_checkpoint(&checkpoint).await?;
        let idle_for = checkpoint.idle_for(now).to_std().unwrap_or_default();
        run.checkpoint = Some(checkpoint);
        Ok(idle_for)
    }

    async fn settle_recovery(&self, run: &mut ActiveRun, error: Option<String>) -> Result<()> {
        if let Some(mut operation) = run.operation.take() {
            self.detector
                .complete(&mut operation, run.inserted, run.duplicates as i64, error)
                .await?;
        }
        Ok(())
    }

    async fn ensure_active(&self, session_id: SessionId, shutdown: &CancellationToken) -> Result<()> {
        if shutdown.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        match self.deps.store.get_session(session_id).await? {
            Some(session) if session.status == SessionStatus::Cancelled => {
                Err(OrchestratorError::Cancelled)
            }
            Some(_) => Ok(()),
            None => Err(OrchestratorError::not_found("session", session_id)),
        }
    }
}
