//! PostgreSQL session store.

use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;

use crate::common::{IterationId, OrchestratorError, Result, SessionId};
use crate::domains::recovery::models::RecoveryOperation;
use crate::domains::sessions::models::{
    Iteration, IterationStatus, ResultRecord, RunCheckpoint, Session, SessionStatus,
};
use crate::domains::sessions::SessionStore;

const LEASE_NAME: &str = "control_loop";

pub struct PostgresSessionStore {
    pool: PgPool,
}

impl PostgresSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn require_session(&self, id: SessionId) -> Result<Session> {
        self.get_session(id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("session", id))
    }
}

#[async_trait]
impl SessionStore for PostgresSessionStore {
    async fn create_session(&self, session: &Session, target_url: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, project_token, project_name, total_pages_target, pages_completed,
                current_iteration, pages_per_iteration, dedup_strategy, status,
                consecutive_failures, error_message, created_at, updated_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(session.id)
        .bind(&session.project_token)
        .bind(&session.project_name)
        .bind(session.total_pages_target)
        .bind(session.pages_completed)
        .bind(session.current_iteration)
        .bind(session.pages_per_iteration)
        .bind(session.dedup_strategy.to_string())
        .bind(session.status)
        .bind(session.consecutive_failures)
        .bind(&session.error_message)
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(session.completed_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO session_urls (session_id, url) VALUES ($1, $2)")
            .bind(session.id)
            .bind(target_url)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>> {
        Ok(sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_sessions(&self, status: Option<SessionStatus>) -> Result<Vec<Session>> {
        Ok(sqlx::query_as::<_, Session>(
            r#"
            SELECT * FROM sessions
            WHERE ($1::session_status IS NULL OR status = $1)
            ORDER BY created_at, id
            "#,
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn advance_session(
        &self,
        id: SessionId,
        expected_pages_completed: i32,
        new_pages_completed: i32,
    ) -> Result<Session> {
        let updated = sqlx::query_as::<_, Session>(
            r#"
            UPDATE sessions
            SET pages_completed = LEAST($3, total_pages_target),
                current_iteration = current_iteration + 1,
                consecutive_failures = 0,
                updated_at = NOW()
            WHERE id = $1
              AND pages_completed = $2
              AND status = 'running'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(expected_pages_completed)
        .bind(new_pages_completed)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(session) => Ok(session),
            None => {
                // Distinguish a lost race from a missing row.
                self.require_session(id).await?;
                Err(OrchestratorError::StateConflict { session_id: id })
            }
        }
    }

    async fn complete_session(&self, id: SessionId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET status = 'completed', completed_at = NOW(), updated_at = NOW()
            WHERE id = $1
              AND status = 'running'
              AND pages_completed >= total_pages_target
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_session_failure(&self, id: SessionId, error: &str) -> Result<i32> {
        let count: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE sessions
            SET consecutive_failures = consecutive_failures + 1,
                error_message = $2,
                updated_at = NOW()
            WHERE id = $1
            RETURNING consecutive_failures
            "#,
        )
        .bind(id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        count.ok_or_else(|| OrchestratorError::not_found("session", id))
    }

    async fn close_session(
        &self,
        id: SessionId,
        status: SessionStatus,
        error: Option<&str>,
    ) -> Result<Session> {
        let updated = sqlx::query_as::<_, Session>(
            r#"
            UPDATE sessions
            SET status = $2,
                error_message = COALESCE($3, error_message),
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(session) => Ok(session),
            None => {
                self.require_session(id).await?;
                Err(OrchestratorError::StateConflict { session_id: id })
            }
        }
    }

    async fn get_session_url(&self, id: SessionId) -> Result<Option<String>> {
        Ok(
            sqlx::query_scalar("SELECT url FROM session_urls WHERE session_id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn set_session_url(&self, id: SessionId, url: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO session_urls (session_id, url) VALUES ($1, $2)
            ON CONFLICT (session_id) DO UPDATE SET url = EXCLUDED.url, updated_at = NOW()
            "#,
        )
        .bind(id)
        .bind(url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_iteration(&self, iteration: &Iteration) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO iterations (
                id, session_id, iteration_number, attempt, start_page, end_page,
                target_url, run_token, record_count, status, error_message,
                created_at, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (session_id, iteration_number, attempt) DO NOTHING
            "#,
        )
        .bind(iteration.id)
        .bind(iteration.session_id)
        .bind(iteration.iteration_number)
        .bind(iteration.attempt)
        .bind(iteration.start_page)
        .bind(iteration.end_page)
        .bind(&iteration.target_url)
        .bind(&iteration.run_token)
        .bind(iteration.record_count)
        .bind(iteration.status)
        .bind(&iteration.error_message)
        .bind(iteration.created_at)
        .bind(iteration.started_at)
        .bind(iteration.completed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::StateConflict {
                session_id: iteration.session_id,
            });
        }
        Ok(())
    }

    async fn get_iteration(&self, id: IterationId) -> Result<Option<Iteration>> {
        Ok(sqlx::query_as::<_, Iteration>("SELECT * FROM iterations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_iterations(&self, session_id: SessionId) -> Result<Vec<Iteration>> {
        Ok(sqlx::query_as::<_, Iteration>(
            "SELECT * FROM iterations WHERE session_id = $1 ORDER BY iteration_number, attempt",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn start_iteration(&self, id: IterationId, run_token: &str, target_url: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE iterations
            SET status = 'running', run_token = $2, target_url = $3, started_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(id)
        .bind(run_token)
        .bind(target_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_iteration_progress(
        &self,
        id: IterationId,
        run_token: &str,
        record_count: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE iterations
            SET run_token = $2, record_count = $3
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(id)
        .bind(run_token)
        .bind(record_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_iteration(
        &self,
        id: IterationId,
        status: IterationStatus,
        record_count: i64,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE iterations
            SET status = $2, record_count = $3, error_message = $4, completed_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(record_count)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_records(&self, records: &[ResultRecord]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for record in records {
            let result = sqlx::query(
                r#"
                INSERT INTO result_records (
                    id, session_id, iteration_id, page_number, fingerprint, data, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (session_id, fingerprint) DO NOTHING
                "#,
            )
            .bind(record.id)
            .bind(record.session_id)
            .bind(record.iteration_id)
            .bind(record.page_number)
            .bind(&record.fingerprint)
            .bind(&record.data)
            .bind(record.created_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn list_records(&self, session_id: SessionId) -> Result<Vec<ResultRecord>> {
        Ok(sqlx::query_as::<_, ResultRecord>(
            "SELECT * FROM result_records WHERE session_id = $1 ORDER BY created_at, id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn count_records(&self, session_id: SessionId) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM result_records WHERE session_id = $1")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    async fn insert_recovery_operation(&self, op: &RecoveryOperation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO recovery_operations (
                id, project_token, original_run_token, recovery_run_token, iteration_id,
                last_record_url, last_record_name, resume_page, resume_url, reason, status,
                attempt_number, original_count, recovered_count, final_count,
                duplicates_removed, error_message, stop_detected_at, triggered_at,
                started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, $21)
            "#,
        )
        .bind(op.id)
        .bind(&op.project_token)
        .bind(&op.original_run_token)
        .bind(&op.recovery_run_token)
        .bind(op.iteration_id)
        .bind(&op.last_record_url)
        .bind(&op.last_record_name)
        .bind(op.resume_page)
        .bind(&op.resume_url)
        .bind(&op.reason)
        .bind(op.status)
        .bind(op.attempt_number)
        .bind(op.original_count)
        .bind(op.recovered_count)
        .bind(op.final_count)
        .bind(op.duplicates_removed)
        .bind(&op.error_message)
        .bind(op.stop_detected_at)
        .bind(op.triggered_at)
        .bind(op.started_at)
        .bind(op.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_recovery_operation(&self, op: &RecoveryOperation) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE recovery_operations
            SET recovery_run_token = $2,
                status = $3,
                recovered_count = $4,
                final_count = $5,
                duplicates_removed = $6,
                error_message = $7,
                triggered_at = $8,
                started_at = $9,
                completed_at = $10
            WHERE id = $1
            "#,
        )
        .bind(op.id)
        .bind(&op.recovery_run_token)
        .bind(op.status)
        .bind(op.recovered_count)
        .bind(op.final_count)
        .bind(op.duplicates_removed)
        .bind(&op.error_message)
        .bind(op.triggered_at)
        .bind(op.started_at)
        .bind(op.completed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::not_found("recovery operation", op.id));
        }
        Ok(())
    }

    async fn list_recovery_operations(&self, project_token: Option<&str>) -> Result<Vec<RecoveryOperation>> {
        Ok(sqlx::query_as::<_, RecoveryOperation>(
            r#"
            SELECT * FROM recovery_operations
            WHERE ($1::TEXT IS NULL OR project_token = $1)
            ORDER BY stop_detected_at, id
            "#,
        )
        .bind(project_token)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn is_run_tracked(&self, run_token: &str) -> Result<bool> {
        let tracked: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (SELECT 1 FROM iterations WHERE run_token = $1)
                OR EXISTS (
                    SELECT 1 FROM recovery_operations
                    WHERE original_run_token = $1 OR recovery_run_token = $1
                )
            "#,
        )
        .bind(run_token)
        .fetch_one(&self.pool)
        .await?;
        Ok(tracked)
    }

    async fn recovery_attempts(&self, project_token: &str) -> Result<u32> {
        let attempts: Option<i32> =
            sqlx::query_scalar("SELECT attempts FROM recovery_attempts WHERE project_token = $1")
                .bind(project_token)
                .fetch_optional(&self.pool)
                .await?;
        Ok(attempts.unwrap_or(0).max(0) as u32)
    }

    async fn increment_recovery_attempts(&self, project_token: &str, max_attempts: u32) -> Result<Option<u32>> {
        if max_attempts == 0 {
            return Ok(None);
        }
        let attempts: Option<i32> = sqlx::query_scalar(
            r#"
            INSERT INTO recovery_attempts (project_token, attempts) VALUES ($1, 1)
            ON CONFLICT (project_token)
            DO UPDATE SET attempts = recovery_attempts.attempts + 1, updated_at = NOW()
            WHERE recovery_attempts.attempts < $2
            RETURNING attempts
            "#,
        )
        .bind(project_token)
        .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
        .fetch_optional(&self.pool)
        .await?;
        Ok(attempts.map(|a| a.max(0) as u32))
    }

    async fn reset_recovery_attempts(&self, project_token: &str) -> Result<()> {
        sqlx::query("DELETE FROM recovery_attempts WHERE project_token = $1")
            .bind(project_token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_recovery_attempts(&self) -> Result<Vec<(String, u32)>> {
        let rows: Vec<(String, i32)> =
            sqlx::query_as("SELECT project_token, attempts FROM recovery_attempts ORDER BY project_token")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(token, attempts)| (token, attempts.max(0) as u32))
            .collect())
    }

    async fn save_checkpoint(&self, cp: &RunCheckpoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO run_checkpoints (
                run_token, record_count, page_count, items_per_minute, last_progress_at, observed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (run_token) DO UPDATE SET
                record_count = EXCLUDED.record_count,
                page_count = EXCLUDED.page_count,
                items_per_minute = EXCLUDED.items_per_minute,
                last_progress_at = EXCLUDED.last_progress_at,
                observed_at = EXCLUDED.observed_at
            "#,
        )
        .bind(&cp.run_token)
        .bind(cp.record_count)
        .bind(cp.page_count)
        .bind(cp.items_per_minute)
        .bind(cp.last_progress_at)
        .bind(cp.observed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_checkpoint(&self, run_token: &str) -> Result<Option<RunCheckpoint>> {
        Ok(
            sqlx::query_as::<_, RunCheckpoint>("SELECT * FROM run_checkpoints WHERE run_token = $1")
                .bind(run_token)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn try_acquire_leadership(&self, holder: &str, ttl: Duration) -> Result<bool> {
        let acquired: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO control_loop_leases (name, holder, expires_at)
            VALUES ($1, $2, NOW() + ($3 || ' milliseconds')::INTERVAL)
            ON CONFLICT (name) DO UPDATE
                SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
                WHERE control_loop_leases.holder = EXCLUDED.holder
                   OR control_loop_leases.expires_at <= NOW()
            RETURNING holder
            "#,
        )
        .bind(LEASE_NAME)
        .bind(holder)
        .bind(ttl.as_millis().to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(acquired.is_some())
    }

    async fn release_leadership(&self, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM control_loop_leases WHERE name = $1 AND holder = $2")
            .bind(LEASE_NAME)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
