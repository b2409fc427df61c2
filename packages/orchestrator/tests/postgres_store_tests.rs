//! PostgreSQL store against a real database.
//!
//! Needs Docker: `cargo test --test postgres_store_tests -- --ignored`

mod common;

use std::time::Duration;

use chrono::Utc;
use common::PgHarness;
use orchestrator_core::common::OrchestratorError;
use orchestrator_core::domains::consolidation::Record;
use orchestrator_core::domains::recovery::{RecoveryOperation, RecoveryStatus};
use orchestrator_core::domains::sessions::models::{
    Iteration, IterationStatus, ResultRecord, RunCheckpoint, Session, SessionStatus,
};
use orchestrator_core::domains::sessions::SessionStore;
use serde_json::json;
use test_context::test_context;
use uuid::Uuid;

/// Project tokens are unique per test since the database is shared.
fn project_token() -> String {
    format!("t{}", Uuid::new_v4().simple())
}

async fn new_session(ctx: &PgHarness, total_pages: i32) -> Session {
    let session = Session::builder()
        .project_token(project_token())
        .project_name("Shop")
        .total_pages_target(total_pages)
        .build();
    ctx.store
        .create_session(&session, "https://x.com/items?page=1")
        .await
        .unwrap();
    session
}

#[test_context(PgHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_session_round_trip(ctx: &PgHarness) {
    let session = new_session(ctx, 25).await;

    let stored = ctx.store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(stored.project_token, session.project_token);
    assert_eq!(stored.status, SessionStatus::Running);
    assert_eq!(stored.dedup_strategy, session.dedup_strategy);
    assert_eq!(stored.next_range(), Some((1, 10)));

    assert_eq!(
        ctx.store.get_session_url(session.id).await.unwrap().as_deref(),
        Some("https://x.com/items?page=1")
    );

    let running = ctx.store.list_sessions(Some(SessionStatus::Running)).await.unwrap();
    assert!(running.iter().any(|s| s.id == session.id));
}

#[test_context(PgHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_stale_advance_is_rejected(ctx: &PgHarness) {
    let session = new_session(ctx, 25).await;

    let advanced = ctx.store.advance_session(session.id, 0, 10).await.unwrap();
    assert_eq!(advanced.pages_completed, 10);
    assert_eq!(advanced.current_iteration, 2);

    let err = ctx.store.advance_session(session.id, 0, 10).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::StateConflict { .. }));

    // Progress is clamped to the target.
    let advanced = ctx.store.advance_session(session.id, 10, 40).await.unwrap();
    assert_eq!(advanced.pages_completed, 25);
    assert!(ctx.store.complete_session(session.id).await.unwrap());
    let completed = ctx.store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(completed.status, SessionStatus::Completed);
    assert!(completed.completed_at.is_some());
}

#[test_context(PgHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_failures_are_counted_until_advance(ctx: &PgHarness) {
    let session = new_session(ctx, 20).await;

    assert_eq!(ctx.store.record_session_failure(session.id, "boom").await.unwrap(), 1);
    assert_eq!(ctx.store.record_session_failure(session.id, "boom").await.unwrap(), 2);

    let advanced = ctx.store.advance_session(session.id, 0, 10).await.unwrap();
    assert_eq!(advanced.consecutive_failures, 0);

    ctx.store
        .close_session(session.id, SessionStatus::Cancelled, None)
        .await
        .unwrap();
    let err = ctx.store.advance_session(session.id, 10, 20).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::StateConflict { .. }));
}

#[test_context(PgHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_iteration_lifecycle_and_records(ctx: &PgHarness) {
    let session = new_session(ctx, 10).await;
    let iteration = Iteration::builder()
        .session_id(session.id)
        .iteration_number(1)
        .start_page(1)
        .end_page(10)
        .build();
    ctx.store.insert_iteration(&iteration).await.unwrap();
    ctx.store
        .start_iteration(iteration.id, "run-1", "https://x.com/items?page=1")
        .await
        .unwrap();

    let record = |name: &str, fingerprint: &str| {
        let mut row = Record::new();
        row.insert("name".into(), json!(name));
        row.insert("page".into(), json!(2));
        ResultRecord::from_record(session.id, iteration.id, fingerprint.into(), row, Some("page"))
    };
    let inserted = ctx
        .store
        .insert_records(&[record("a", "fp-a"), record("b", "fp-b"), record("a again", "fp-a")])
        .await
        .unwrap();
    assert_eq!(inserted, 2);
    assert_eq!(ctx.store.count_records(session.id).await.unwrap(), 2);

    let stored = ctx.store.list_records(session.id).await.unwrap();
    assert_eq!(stored[0].page_number, Some(2));
    assert_eq!(stored[0].to_record()["name"], json!("a"));

    ctx.store
        .update_iteration_progress(iteration.id, "run-2", 2)
        .await
        .unwrap();
    ctx.store
        .finish_iteration(iteration.id, IterationStatus::Completed, 2, None)
        .await
        .unwrap();

    let finished = ctx.store.get_iteration(iteration.id).await.unwrap().unwrap();
    assert_eq!(finished.status, IterationStatus::Completed);
    assert_eq!(finished.run_token.as_deref(), Some("run-2"));
    assert_eq!(finished.record_count, 2);
    assert!(finished.started_at.is_some());
    assert!(finished.completed_at.is_some());
}

#[test_context(PgHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_recovery_attempts_and_operations(ctx: &PgHarness) {
    let token = project_token();

    assert_eq!(ctx.store.recovery_attempts(&token).await.unwrap(), 0);
    assert_eq!(ctx.store.increment_recovery_attempts(&token, 3).await.unwrap(), Some(1));
    assert_eq!(ctx.store.increment_recovery_attempts(&token, 3).await.unwrap(), Some(2));
    let all = ctx.store.list_recovery_attempts().await.unwrap();
    assert!(all.contains(&(token.clone(), 2)));

    ctx.store.reset_recovery_attempts(&token).await.unwrap();
    assert_eq!(ctx.store.recovery_attempts(&token).await.unwrap(), 0);

    let mut operation = RecoveryOperation::builder()
        .project_token(token.clone())
        .original_run_token("run-1")
        .resume_page(4)
        .resume_url("https://x.com/items?page=4")
        .reason("stalled")
        .attempt_number(1)
        .original_count(30)
        .build();
    ctx.store.insert_recovery_operation(&operation).await.unwrap();

    operation.recovery_run_token = Some("run-2".into());
    operation.finish(12, 3, None);
    ctx.store.update_recovery_operation(&operation).await.unwrap();

    let ops = ctx.store.list_recovery_operations(Some(&token)).await.unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].status, RecoveryStatus::Completed);
    assert_eq!(ops[0].recovery_run_token.as_deref(), Some("run-2"));
    assert_eq!((ops[0].final_count, ops[0].duplicates_removed), (42, 3));
}

#[test_context(PgHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_concurrent_increments_respect_cap(ctx: &PgHarness) {
    let token = project_token();

    let store = &ctx.store;
    let (a, b, c, d, e) = tokio::join!(
        store.increment_recovery_attempts(&token, 3),
        store.increment_recovery_attempts(&token, 3),
        store.increment_recovery_attempts(&token, 3),
        store.increment_recovery_attempts(&token, 3),
        store.increment_recovery_attempts(&token, 3),
    );

    let mut granted: Vec<u32> = [a, b, c, d, e]
        .into_iter()
        .filter_map(|r| r.unwrap())
        .collect();
    granted.sort();
    assert_eq!(granted, vec![1, 2, 3]);
    assert_eq!(ctx.store.recovery_attempts(&token).await.unwrap(), 3);
}

#[test_context(PgHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_tracked_runs(ctx: &PgHarness) {
    let session = new_session(ctx, 10).await;
    let polled = format!("run-{}", Uuid::new_v4());
    let stalled = format!("run-{}", Uuid::new_v4());
    let resumed = format!("run-{}", Uuid::new_v4());
    let external = format!("run-{}", Uuid::new_v4());

    let iteration = Iteration::builder()
        .session_id(session.id)
        .iteration_number(1)
        .start_page(1)
        .end_page(10)
        .build();
    ctx.store.insert_iteration(&iteration).await.unwrap();
    ctx.store
        .start_iteration(iteration.id, &polled, "https://x.com/items?page=1")
        .await
        .unwrap();

    let mut operation = RecoveryOperation::builder()
        .project_token(session.project_token.clone())
        .original_run_token(stalled.clone())
        .resume_page(2)
        .resume_url("https://x.com/items?page=2")
        .reason("stalled")
        .attempt_number(1)
        .original_count(3)
        .build();
    operation.recovery_run_token = Some(resumed.clone());
    ctx.store.insert_recovery_operation(&operation).await.unwrap();

    assert!(ctx.store.is_run_tracked(&polled).await.unwrap());
    assert!(ctx.store.is_run_tracked(&stalled).await.unwrap());
    assert!(ctx.store.is_run_tracked(&resumed).await.unwrap());
    assert!(!ctx.store.is_run_tracked(&external).await.unwrap());
}

#[test_context(PgHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_checkpoint_is_overwritten(ctx: &PgHarness) {
    let run_token = format!("run-{}", Uuid::new_v4());
    let now = Utc::now();
    let first = RunCheckpoint::first(&run_token, 10, 1, now);
    ctx.store.save_checkpoint(&first).await.unwrap();

    let next = first.observe(25, 2, now + chrono::Duration::seconds(30));
    ctx.store.save_checkpoint(&next).await.unwrap();

    let stored = ctx.store.get_checkpoint(&run_token).await.unwrap().unwrap();
    assert_eq!((stored.record_count, stored.page_count), (25, 2));
    assert!(stored.items_per_minute > 0.0);
}

#[test_context(PgHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn test_single_lease_holder(ctx: &PgHarness) {
    let ttl = Duration::from_secs(60);
    let leader = format!("leader-{}", Uuid::new_v4());
    let follower = format!("follower-{}", Uuid::new_v4());

    assert!(ctx.store.try_acquire_leadership(&leader, ttl).await.unwrap());
    assert!(ctx.store.try_acquire_leadership(&leader, ttl).await.unwrap());
    assert!(!ctx.store.try_acquire_leadership(&follower, ttl).await.unwrap());

    ctx.store.release_leadership(&leader).await.unwrap();
    assert!(ctx.store.try_acquire_leadership(&follower, ttl).await.unwrap());
    ctx.store.release_leadership(&follower).await.unwrap();
}
