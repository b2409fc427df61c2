//! Session control loop.
//!
//! Single-leader scheduler: each cycle lists running sessions and advances
//! each one by at most one iteration, strictly one session at a time.

use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::common::{OrchestratorError, Result};
use crate::domains::iterations::IterationExecutor;
use crate::domains::sessions::models::{Iteration, Session, SessionStatus};
use crate::kernel::OrchestratorDeps;

#[derive(Debug, Clone)]
pub struct ControlLoopConfig {
    pub interval: Duration,
    pub inter_session_pause: Duration,
    /// A session fails once its consecutive failed iterations exceed this.
    pub max_consecutive_failures: u32,
    /// Leader lease lifetime. Must outlast one full iteration.
    pub lease_ttl: Duration,
}

impl Default for ControlLoopConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            inter_session_pause: Duration::from_secs(2),
            max_consecutive_failures: 3,
            lease_ttl: Duration::from_secs(5 * 6 + 2 * 60 * 60),
        }
    }
}

/// What one cycle did to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStep {
    Completed,
    Advanced,
    IterationFailed,
    SessionFailed,
    Skipped,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleSummary {
    pub leader: bool,
    pub sessions: usize,
    pub completed: usize,
    pub advanced: usize,
    pub iteration_failures: usize,
    pub sessions_failed: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl CycleSummary {
    fn record(&mut self, step: SessionStep) {
        match step {
            SessionStep::Completed => self.completed += 1,
            SessionStep::Advanced => self.advanced += 1,
            SessionStep::IterationFailed => self.iteration_failures += 1,
            SessionStep::SessionFailed => self.sessions_failed += 1,
            SessionStep::Skipped => self.skipped += 1,
        }
    }
}

pub struct SessionControlLoop {
    deps: OrchestratorDeps,
    executor: IterationExecutor,
    config: ControlLoopConfig,
    holder: String,
}

impl SessionControlLoop {
    pub fn new(deps: OrchestratorDeps, executor: IterationExecutor, config: ControlLoopConfig) -> Self {
        Self {
            deps,
            executor,
            config,
            holder: format!("control-loop-{}", Uuid::now_v7()),
        }
    }

    /// Lease holder name of this instance.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Run cycles until `shutdown` fires, then give up the lease.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            holder = %self.holder,
            interval_secs = self.config.interval.as_secs(),
            "Session control loop started"
        );

        loop {
            match self.run_cycle(&shutdown).await {
                Ok(summary) if summary.leader && summary.sessions > 0 => {
                    info!(
                        sessions = summary.sessions,
                        advanced = summary.advanced,
                        completed = summary.completed,
                        iteration_failures = summary.iteration_failures,
                        sessions_failed = summary.sessions_failed,
                        skipped = summary.skipped,
                        errors = summary.errors,
                        "Control loop cycle finished"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Control loop cycle failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        if let Err(e) = self.deps.store.release_leadership(&self.holder).await {
            warn!(error = %e, "Failed to release control loop lease");
        }
        info!("Session control loop stopped");
    }

    /// One pass over the running sessions. Errors in one session are logged
    /// and counted; they never stop the others.
    pub async fn run_cycle(&self, shutdown: &CancellationToken) -> Result<CycleSummary> {
        let store = &self.deps.store;
        let mut summary = CycleSummary::default();

        if !store
            .try_acquire_leadership(&self.holder, self.config.lease_ttl)
            .await?
        {
            debug!(holder = %self.holder, "Another control loop holds the lease");
            return Ok(summary);
        }
        summary.leader = true;

        let sessions = store.list_sessions(Some(SessionStatus::Running)).await?;
        summary.sessions = sessions.len();

        for (index, session) in sessions.iter().enumerate() {
            if shutdown.is_cancelled() {
                break;
            }
            if index > 0 && !self.config.inter_session_pause.is_zero() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.inter_session_pause) => {}
                }
            }
            // A single iteration may take up to the executor's poll cap, so the
            // lease is renewed before every session rather than once per cycle.
            if index > 0
                && !store
                    .try_acquire_leadership(&self.holder, self.config.lease_ttl)
                    .await?
            {
                warn!(holder = %self.holder, "Lost the control loop lease, ending cycle");
                break;
            }

            match self.step(session, shutdown).await {
                Ok(step) => summary.record(step),
                Err(OrchestratorError::Cancelled) => {
                    info!(session_id = %session.id, "Iteration cancelled");
                    summary.record(SessionStep::Skipped);
                }
                Err(e) => {
                    error!(session_id = %session.id, error = %e, "Session step failed");
                    summary.errors += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Advance one session by at most one iteration.
    pub async fn step(&self, listed: &Session, shutdown: &CancellationToken) -> Result<SessionStep> {
        let store = &self.deps.store;

        // Re-read: an operator may have cancelled it since the listing.
        let Some(session) = store.get_session(listed.id).await? else {
            return Ok(SessionStep::Skipped);
        };
        if session.status != SessionStatus::Running {
            return Ok(SessionStep::Skipped);
        }

        let Some((start_page, end_page)) = session.next_range() else {
            return self.complete(&session).await;
        };

        let Some(target_url) = store.get_session_url(session.id).await? else {
            warn!(session_id = %session.id, "No target URL registered for session, skipping");
            return Ok(SessionStep::Skipped);
        };

        let attempt = store
            .list_iterations(session.id)
            .await?
            .iter()
            .filter(|i| i.iteration_number == session.current_iteration)
            .count() as i32
            + 1;

        let iteration = Iteration::builder()
            .session_id(session.id)
            .iteration_number(session.current_iteration)
            .attempt(attempt)
            .start_page(start_page)
            .end_page(end_page)
            .build();
        store.insert_iteration(&iteration).await?;

        let report = self
            .executor
            .execute(&session, &iteration, &target_url, shutdown)
            .await?;

        if report.is_success() {
            let advanced = store
                .advance_session(session.id, session.pages_completed, end_page)
                .await?;
            info!(
                session_id = %session.id,
                pages_completed = advanced.pages_completed,
                total_pages = advanced.total_pages_target,
                records = report.record_count,
                "Session advanced"
            );
            if advanced.is_complete() {
                return self.complete(&advanced).await;
            }
            return Ok(SessionStep::Advanced);
        }

        let message = report
            .error
            .unwrap_or_else(|| format!("iteration {} failed", iteration.iteration_number));
        let failures = store.record_session_failure(session.id, &message).await?;

        if failures.max(0) as u32 > self.config.max_consecutive_failures {
            store
                .close_session(session.id, SessionStatus::Failed, Some(&message))
                .await?;
            error!(
                session_id = %session.id,
                failures,
                error = %message,
                "Session failed after repeated iteration failures"
            );
            return Ok(SessionStep::SessionFailed);
        }

        warn!(
            session_id = %session.id,
            failures,
            start_page,
            end_page,
            "Iteration failed, range will be retried"
        );
        Ok(SessionStep::IterationFailed)
    }

    async fn complete(&self, session: &Session) -> Result<SessionStep> {
        if self.deps.store.complete_session(session.id).await? {
            info!(
                session_id = %session.id,
                pages_completed = session.pages_completed,
                "Session completed"
            );
        }
        Ok(SessionStep::Completed)
    }
}
