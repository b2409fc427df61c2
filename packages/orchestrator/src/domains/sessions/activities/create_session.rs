//! Create session action - validates a campaign request and registers it

use tracing::info;
use typed_builder::TypedBuilder;

use crate::common::{OrchestratorError, Result};
use crate::domains::consolidation::DedupStrategy;
use crate::domains::pagination::validate_url;
use crate::domains::sessions::models::Session;
use crate::kernel::OrchestratorDeps;

#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct CreateSession {
    pub project_token: String,
    pub project_name: String,
    pub target_url: String,
    pub total_pages: i32,
    #[builder(default = 10)]
    pub pages_per_iteration: i32,
    #[builder(default)]
    pub dedup_strategy: DedupStrategy,
}

impl CreateSession {
    pub fn validate(&self) -> Result<()> {
        if self.project_token.trim().is_empty() {
            return Err(OrchestratorError::Validation("project token is required".into()));
        }
        if self.project_name.trim().is_empty() {
            return Err(OrchestratorError::Validation("project name is required".into()));
        }
        if !validate_url(self.target_url.trim()) {
            return Err(OrchestratorError::Validation(format!(
                "invalid target URL: {:?}",
                self.target_url
            )));
        }
        if self.total_pages <= 0 {
            return Err(OrchestratorError::Validation(
                "total pages must be greater than 0".into(),
            ));
        }
        if self.pages_per_iteration <= 0 {
            return Err(OrchestratorError::Validation(
                "pages per iteration must be greater than 0".into(),
            ));
        }
        if let DedupStrategy::KeyColumn(column) = &self.dedup_strategy {
            if column.trim().is_empty() {
                return Err(OrchestratorError::Validation(
                    "key column dedup needs a column name".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Register a new running session and its target URL.
pub async fn create_session(input: CreateSession, deps: &OrchestratorDeps) -> Result<Session> {
    input.validate()?;

    let session = Session::builder()
        .project_token(input.project_token.trim())
        .project_name(input.project_name.trim())
        .total_pages_target(input.total_pages)
        .pages_per_iteration(input.pages_per_iteration)
        .dedup_strategy(input.dedup_strategy)
        .build();

    deps.store
        .create_session(&session, input.target_url.trim())
        .await?;

    info!(
        session_id = %session.id,
        project_token = %session.project_token,
        total_pages = session.total_pages_target,
        pages_per_iteration = session.pages_per_iteration,
        dedup = %session.dedup_strategy,
        "Session created"
    );
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::sessions::stores::MemorySessionStore;
    use crate::kernel::MockScrapingProvider;
    use std::sync::Arc;

    fn input() -> CreateSession {
        CreateSession::builder()
            .project_token("tProj")
            .project_name("Shop")
            .target_url("https://x.com/items?page=1")
            .total_pages(25)
            .build()
    }

    #[tokio::test]
    async fn test_create_registers_url() {
        let store = Arc::new(MemorySessionStore::new());
        let deps = OrchestratorDeps::new(store.clone(), Arc::new(MockScrapingProvider::new()));

        let session = create_session(input(), &deps).await.unwrap();
        assert_eq!(session.pages_per_iteration, 10);
        assert_eq!(
            deps.store.get_session_url(session.id).await.unwrap().as_deref(),
            Some("https://x.com/items?page=1")
        );
    }

    #[test]
    fn test_validation_rejects_bad_input() {
        let mut bad = input();
        bad.total_pages = 0;
        assert!(matches!(bad.validate(), Err(OrchestratorError::Validation(_))));

        let mut bad = input();
        bad.target_url = "not a url".into();
        assert!(bad.validate().is_err());

        let mut bad = input();
        bad.pages_per_iteration = 0;
        assert!(bad.validate().is_err());

        let mut bad = input();
        bad.project_token = "  ".into();
        assert!(bad.validate().is_err());

        let mut bad = input();
        bad.dedup_strategy = DedupStrategy::KeyColumn(String::new());
        assert!(bad.validate().is_err());
    }
}
