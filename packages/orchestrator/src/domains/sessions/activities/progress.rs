//! Session progress report.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;

use crate::common::{OrchestratorError, Result, SessionId};
use crate::domains::sessions::models::{IterationStatus, SessionStatus};
use crate::kernel::OrchestratorDeps;

#[derive(Debug, Clone, Serialize)]
pub struct IterationProgress {
    pub iteration_number: i32,
    pub attempt: i32,
    pub pages: String,
    pub record_count: i64,
    pub status: IterationStatus,
    pub run_token: Option<String>,
    pub error_message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionProgress {
    pub session_id: SessionId,
    pub project_name: String,
    pub project_token: String,
    pub target_url: Option<String>,
    pub percentage: f64,
    pub pages_completed: i32,
    pub total_pages_target: i32,
    pub current_iteration: i32,
    pub status: SessionStatus,
    pub iterations: Vec<IterationProgress>,
    pub iterations_completed: i32,
    pub total_iterations_needed: i32,
    pub record_count: i64,
    pub estimated_remaining_time: String,
    pub error_message: Option<String>,
}

/// Best-known state of a session, including while an iteration is failing.
pub async fn get_progress(
    session_id: SessionId,
    minutes_per_iteration: u32,
    deps: &OrchestratorDeps,
) -> Result<SessionProgress> {
    let store = &deps.store;
    let session = store
        .get_session(session_id)
        .await?
        .ok_or_else(|| OrchestratorError::not_found("session", session_id))?;

    let iterations = store.list_iterations(session_id).await?;
    let record_count = store.count_records(session_id).await?;
    let target_url = store.get_session_url(session_id).await?;

    // Retries share an iteration number; count each number once.
    let iterations_completed = iterations
        .iter()
        .filter(|i| i.status == IterationStatus::Completed)
        .map(|i| i.iteration_number)
        .collect::<BTreeSet<_>>()
        .len() as i32;
    let total_iterations_needed = session.total_iterations_needed();

    let estimated_remaining_time = if session.status.is_terminal() {
        format_eta(0)
    } else {
        let remaining = (total_iterations_needed - iterations_completed).max(0) as u64;
        format_eta(remaining * minutes_per_iteration as u64)
    };

    // Surface the newest iteration error while the session is still running.
    let error_message = session.error_message.clone().or_else(|| {
        iterations
            .iter()
            .rev()
            .find_map(|i| i.error_message.clone())
    });

    Ok(SessionProgress {
        session_id,
        percentage: session.percentage(),
        project_name: session.project_name,
        project_token: session.project_token,
        target_url,
        pages_completed: session.pages_completed,
        total_pages_target: session.total_pages_target,
        current_iteration: session.current_iteration,
        status: session.status,
        iterations: iterations
            .into_iter()
            .map(|i| IterationProgress {
                iteration_number: i.iteration_number,
                attempt: i.attempt,
                pages: format!("{}-{}", i.start_page, i.end_page),
                record_count: i.record_count,
                status: i.status,
                run_token: i.run_token,
                error_message: i.error_message,
                completed_at: i.completed_at,
            })
            .collect(),
        iterations_completed,
        total_iterations_needed,
        record_count,
        estimated_remaining_time,
        error_message,
    })
}

/// `"< 1 minute"`, `"N minutes"` under an hour, else `"Hh Mm"`.
pub fn format_eta(minutes: u64) -> String {
    match minutes {
        0 => "< 1 minute".to_string(),
        m if m < 60 => format!("{} minutes", m),
        m => format!("{}h {}m", m / 60, m % 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::sessions::models::{Iteration, Session};
    use crate::domains::sessions::stores::MemorySessionStore;
    use crate::kernel::MockScrapingProvider;
    use std::sync::Arc;
    use crate::domains::sessions::store::SessionStore;

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(0), "< 1 minute");
        assert_eq!(format_eta(9), "9 minutes");
        assert_eq!(format_eta(60), "1h 0m");
        assert_eq!(format_eta(135), "2h 15m");
    }

    #[tokio::test]
    async fn test_progress_counts_retried_iteration_once() {
        let store = Arc::new(MemorySessionStore::new());
        let deps = OrchestratorDeps::new(store.clone(), Arc::new(MockScrapingProvider::new()));

        let session = Session::builder()
            .project_token("tProj")
            .project_name("Shop")
            .total_pages_target(25)
            .build();
        store
            .create_session(&session, "https://x.com/items?page=1")
            .await
            .unwrap();

        let failed = Iteration::builder()
            .session_id(session.id)
            .iteration_number(1)
            .start_page(1)
            .end_page(10)
            .build();
        store.insert_iteration(&failed).await.unwrap();
        store
            .finish_iteration(failed.id, IterationStatus::Failed, 0, Some("provider run failed"))
            .await
            .unwrap();

        let retried = Iteration::builder()
            .session_id(session.id)
            .iteration_number(1)
            .attempt(2)
            .start_page(1)
            .end_page(10)
            .build();
        store.insert_iteration(&retried).await.unwrap();
        store
            .finish_iteration(retried.id, IterationStatus::Completed, 40, None)
            .await
            .unwrap();
        store.advance_session(session.id, 0, 10).await.unwrap();

        let progress = get_progress(session.id, 3, &deps).await.unwrap();
        assert_eq!(progress.iterations.len(), 2);
        assert_eq!(progress.iterations_completed, 1);
        assert_eq!(progress.total_iterations_needed, 3);
        assert_eq!(progress.percentage, 40.0);
        assert_eq!(progress.estimated_remaining_time, "6 minutes");
        assert_eq!(progress.iterations[0].pages, "1-10");
    }
}
