//! In-memory wiring and fast timings for orchestration tests.

use std::sync::Arc;
use std::time::Duration;

use orchestrator_core::domains::iterations::{ExecutorConfig, IterationExecutor};
use orchestrator_core::domains::recovery::{RecoveryDetector, RecoveryPolicy};
use orchestrator_core::domains::sessions::models::Session;
use orchestrator_core::domains::sessions::stores::MemorySessionStore;
use orchestrator_core::domains::sessions::{
    create_session, ControlLoopConfig, CreateSession, SessionControlLoop,
};
use orchestrator_core::kernel::{MockScrapingProvider, OrchestratorDeps};
use serde_json::{json, Value};

pub const PROJECT: &str = "tProj";
pub const START_URL: &str = "https://x.com/items?page=1";

pub fn fast_executor_config() -> ExecutorConfig {
    ExecutorConfig {
        poll_interval: Duration::from_millis(5),
        max_poll_backoff: Duration::from_millis(20),
        max_poll_duration: Duration::from_secs(5),
        fetch_page_limit: 10,
        max_fetch_chunks_per_poll: 50,
        items_per_page: 20,
    }
}

pub fn fast_loop_config() -> ControlLoopConfig {
    ControlLoopConfig {
        interval: Duration::from_millis(5),
        inter_session_pause: Duration::ZERO,
        max_consecutive_failures: 3,
        lease_ttl: Duration::from_secs(60),
    }
}

/// Default policy with a stall window short enough for tests.
pub fn fast_policy(stall_window: Duration) -> RecoveryPolicy {
    RecoveryPolicy {
        stall_window,
        ..RecoveryPolicy::default()
    }
}

/// `n` distinct provider records tagged with `prefix`.
pub fn items(prefix: &str, n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| json!({ "name": format!("{}-{}", prefix, i), "url": format!("https://x.com/p/{}/{}", prefix, i) }))
        .collect()
}

pub struct TestContext {
    pub store: Arc<MemorySessionStore>,
    pub provider: Arc<MockScrapingProvider>,
    pub deps: OrchestratorDeps,
    pub detector: Arc<RecoveryDetector>,
}

impl TestContext {
    pub fn new(provider: MockScrapingProvider) -> Self {
        Self::with_policy(provider, RecoveryPolicy::default())
    }

    pub fn with_policy(provider: MockScrapingProvider, policy: RecoveryPolicy) -> Self {
        let store = Arc::new(MemorySessionStore::new());
        let provider = Arc::new(provider);
        let deps = OrchestratorDeps::new(store.clone(), provider.clone());
        let detector = RecoveryDetector::new(deps.clone(), policy);
        Self {
            store,
            provider,
            deps,
            detector,
        }
    }

    pub fn executor(&self) -> IterationExecutor {
        IterationExecutor::new(self.deps.clone(), self.detector.clone(), fast_executor_config())
    }

    pub fn control_loop(&self) -> SessionControlLoop {
        SessionControlLoop::new(self.deps.clone(), self.executor(), fast_loop_config())
    }

    pub async fn session(&self, total_pages: i32, pages_per_iteration: i32) -> Session {
        let input = CreateSession::builder()
            .project_token(PROJECT)
            .project_name("Shop")
            .target_url(START_URL)
            .total_pages(total_pages)
            .pages_per_iteration(pages_per_iteration)
            .build();
        create_session(input, &self.deps)
            .await
            .expect("Failed to create session")
    }
}
