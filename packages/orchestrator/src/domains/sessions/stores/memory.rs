//! In-memory session store for tests and dry runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;

use crate::common::{IterationId, OrchestratorError, RecoveryOperationId, Result, SessionId};
use crate::domains::recovery::models::RecoveryOperation;
use crate::domains::sessions::models::{
    Iteration, IterationStatus, ResultRecord, RunCheckpoint, Session, SessionStatus,
};
use crate::domains::sessions::SessionStore;

struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

/// In-memory storage for every orchestration entity.
///
/// Not suitable for production as data is lost on restart.
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
    session_urls: RwLock<HashMap<SessionId, String>>,
    iterations: RwLock<HashMap<IterationId, Iteration>>,
    records: RwLock<Vec<ResultRecord>>,
    fingerprints: RwLock<HashSet<(SessionId, String)>>,
    recovery_operations: RwLock<Vec<RecoveryOperation>>,
    recovery_attempts: RwLock<HashMap<String, u32>>,
    checkpoints: RwLock<HashMap<String, RunCheckpoint>>,
    lease: RwLock<Option<Lease>>,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            session_urls: RwLock::new(HashMap::new()),
            iterations: RwLock::new(HashMap::new()),
            records: RwLock::new(Vec::new()),
            fingerprints: RwLock::new(HashSet::new()),
            recovery_operations: RwLock::new(Vec::new()),
            recovery_attempts: RwLock::new(HashMap::new()),
            checkpoints: RwLock::new(HashMap::new()),
            lease: RwLock::new(None),
        }
    }

    /// Drop a session's registered URL, as if it was never registered.
    pub fn remove_session_url(&self, id: SessionId) {
        self.session_urls.write().unwrap().remove(&id);
    }

    /// Overwrite the persisted attempt counter for a project.
    pub fn set_recovery_attempts(&self, project_token: &str, attempts: u32) {
        self.recovery_attempts
            .write()
            .unwrap()
            .insert(project_token.to_string(), attempts);
    }

    fn with_session<F>(&self, id: SessionId, f: F) -> Result<Session>
    where
        F: FnOnce(&mut Session) -> Result<()>,
    {
        let mut sessions = self.sessions.write().unwrap();
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::not_found("session", id))?;
        f(session)?;
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    fn with_iteration<F>(&self, id: IterationId, f: F) -> Result<()>
    where
        F: FnOnce(&mut Iteration),
    {
        let mut iterations = self.iterations.write().unwrap();
        let iteration = iterations
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::not_found("iteration", id))?;
        if !iteration.status.is_terminal() {
            f(iteration);
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self, session: &Session, target_url: &str) -> Result<()> {
        self.sessions
            .write()
            .unwrap()
            .insert(session.id, session.clone());
        self.session_urls
            .write()
            .unwrap()
            .insert(session.id, target_url.to_string());
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>> {
        Ok(self.sessions.read().unwrap().get(&id).cloned())
    }

    async fn list_sessions(&self, status: Option<SessionStatus>) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .unwrap()
            .values()
            .filter(|s| status.map(|st| s.status == st).unwrap_or(true))
            .cloned()
            .collect();
        sessions.sort_by_key(|s| (s.created_at, s.id));
        Ok(sessions)
    }

    async fn advance_session(
        &self,
        id: SessionId,
        expected_pages_completed: i32,
        new_pages_completed: i32,
    ) -> Result<Session> {
        self.with_session(id, |s| {
            if s.status != SessionStatus::Running || s.pages_completed != expected_pages_completed {
                return Err(OrchestratorError::StateConflict { session_id: id });
            }
            s.pages_completed = new_pages_completed.min(s.total_pages_target);
            s.current_iteration += 1;
            s.consecutive_failures = 0;
            Ok(())
        })
    }

    async fn complete_session(&self, id: SessionId) -> Result<bool> {
        let mut completed = false;
        self.with_session(id, |s| {
            if s.status == SessionStatus::Running && s.pages_completed >= s.total_pages_target {
                s.status = SessionStatus::Completed;
                s.completed_at = Some(Utc::now());
                completed = true;
            }
            Ok(())
        })?;
        Ok(completed)
    }

    async fn record_session_failure(&self, id: SessionId, error: &str) -> Result<i32> {
        let session = self.with_session(id, |s| {
            s.consecutive_failures += 1;
            s.error_message = Some(error.to_string());
            Ok(())
        })?;
        Ok(session.consecutive_failures)
    }

    async fn close_session(
        &self,
        id: SessionId,
        status: SessionStatus,
        error: Option<&str>,
    ) -> Result<Session> {
        self.with_session(id, |s| {
            if s.status != SessionStatus::Running {
                return Err(OrchestratorError::StateConflict { session_id: id });
            }
            s.status = status;
            s.completed_at = Some(Utc::now());
            if let Some(error) = error {
                s.error_message = Some(error.to_string());
            }
            Ok(())
        })
    }

    async fn get_session_url(&self, id: SessionId) -> Result<Option<String>> {
        Ok(self.session_urls.read().unwrap().get(&id).cloned())
    }

    async fn set_session_url(&self, id: SessionId, url: &str) -> Result<()> {
        self.session_urls
            .write()
            .unwrap()
            .insert(id, url.to_string());
        Ok(())
    }

    async fn insert_iteration(&self, iteration: &Iteration) -> Result<()> {
        let mut iterations = self.iterations.write().unwrap();
        let duplicate = iterations.values().any(|i| {
            i.session_id == iteration.session_id
                && i.iteration_number == iteration.iteration_number
                && i.attempt == iteration.attempt
        });
        if duplicate {
            return Err(OrchestratorError::StateConflict {
                session_id: iteration.session_id,
            });
        }
        iterations.insert(iteration.id, iteration.clone());
        Ok(())
    }

    async fn get_iteration(&self, id: IterationId) -> Result<Option<Iteration>> {
        Ok(self.iterations.read().unwrap().get(&id).cloned())
    }

    async fn list_iterations(&self, session_id: SessionId) -> Result<Vec<Iteration>> {
        let mut iterations: Vec<Iteration> = self
            .iterations
            .read()
            .unwrap()
            .values()
            .filter(|i| i.session_id == session_id)
            .cloned()
            .collect();
        iterations.sort_by_key(|i| (i.iteration_number, i.attempt));
        Ok(iterations)
    }

    async fn start_iteration(&self, id: IterationId, run_token: &str, target_url: &str) -> Result<()> {
        self.with_iteration(id, |i| {
            i.status = IterationStatus::Running;
            i.run_token = Some(run_token.to_string());
            i.target_url = Some(target_url.to_string());
            i.started_at = Some(Utc::now());
        })
    }

    async fn update_iteration_progress(
        &self,
        id: IterationId,
        run_token: &str,
        record_count: i64,
    ) -> Result<()> {
        self.with_iteration(id, |i| {
            i.run_token = Some(run_token.to_string());
            i.record_count = record_count;
        })
    }

    async fn finish_iteration(
        &self,
        id: IterationId,
        status: IterationStatus,
        record_count: i64,
        error: Option<&str>,
    ) -> Result<()> {
        self.with_iteration(id, |i| {
            i.status = status;
            i.record_count = record_count;
            i.error_message = error.map(|e| e.to_string());
            i.completed_at = Some(Utc::now());
        })
    }

    async fn insert_records(&self, records: &[ResultRecord]) -> Result<u64> {
        let mut fingerprints = self.fingerprints.write().unwrap();
        let mut stored = self.records.write().unwrap();
        let mut inserted = 0;
        for record in records {
            if fingerprints.insert((record.session_id, record.fingerprint.clone())) {
                stored.push(record.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn list_records(&self, session_id: SessionId) -> Result<Vec<ResultRecord>> {
        Ok(self
            .records
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn count_records(&self, session_id: SessionId) -> Result<i64> {
        Ok(self
            .records
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.session_id == session_id)
            .count() as i64)
    }

    async fn insert_recovery_operation(&self, operation: &RecoveryOperation) -> Result<()> {
        self.recovery_operations
            .write()
            .unwrap()
            .push(operation.clone());
        Ok(())
    }

    async fn update_recovery_operation(&self, operation: &RecoveryOperation) -> Result<()> {
        let mut operations = self.recovery_operations.write().unwrap();
        let id: RecoveryOperationId = operation.id;
        match operations.iter_mut().find(|o| o.id == id) {
            Some(existing) => {
                *existing = operation.clone();
                Ok(())
            }
            None => Err(OrchestratorError::not_found("recovery operation", id)),
        }
    }

    async fn list_recovery_operations(&self, project_token: Option<&str>) -> Result<Vec<RecoveryOperation>> {
        Ok(self
            .recovery_operations
            .read()
            .unwrap()
            .iter()
            .filter(|o| project_token.map(|p| o.project_token == p).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn is_run_tracked(&self, run_token: &str) -> Result<bool> {
        let polled = self
            .iterations
            .read()
            .unwrap()
            .values()
            .any(|i| i.run_token.as_deref() == Some(run_token));
        if polled {
            return Ok(true);
        }
        Ok(self.recovery_operations.read().unwrap().iter().any(|o| {
            o.original_run_token == run_token || o.recovery_run_token.as_deref() == Some(run_token)
        }))
    }

    async fn recovery_attempts(&self, project_token: &str) -> Result<u32> {
        Ok(self
            .recovery_attempts
            .read()
            .unwrap()
            .get(project_token)
            .copied()
            .unwrap_or(0))
    }

    async fn increment_recovery_attempts(&self, project_token: &str, max_attempts: u32) -> Result<Option<u32>> {
        let mut attempts = self.recovery_attempts.write().unwrap();
        let count = attempts.entry(project_token.to_string()).or_insert(0);
        if *count >= max_attempts {
            return Ok(None);
        }
        *count += 1;
        Ok(Some(*count))
    }

    async fn reset_recovery_attempts(&self, project_token: &str) -> Result<()> {
        self.recovery_attempts.write().unwrap().remove(project_token);
        Ok(())
    }

    async fn list_recovery_attempts(&self) -> Result<Vec<(String, u32)>> {
        let mut attempts: Vec<(String, u32)> = self
            .recovery_attempts
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        attempts.sort();
        Ok(attempts)
    }

    async fn save_checkpoint(&self, checkpoint: &RunCheckpoint) -> Result<()> {
        self.checkpoints
            .write()
            .unwrap()
            .insert(checkpoint.run_token.clone(), checkpoint.clone());
        Ok(())
    }

    async fn get_checkpoint(&self, run_token: &str) -> Result<Option<RunCheckpoint>> {
        Ok(self.checkpoints.read().unwrap().get(run_token).cloned())
    }

    async fn try_acquire_leadership(&self, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let mut lease = self.lease.write().unwrap();
        let free = match lease.as_ref() {
            None => true,
            Some(l) => l.holder == holder || l.expires_at <= now,
        };
        if free {
            let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(1));
            *lease = Some(Lease {
                holder: holder.to_string(),
                expires_at: now + ttl,
            });
        }
        Ok(free)
    }

    async fn release_leadership(&self, holder: &str) -> Result<()> {
        let mut lease = self.lease.write().unwrap();
        if lease.as_ref().map(|l| l.holder == holder).unwrap_or(false) {
            *lease = None;
        }
        Ok(())
    }
}
