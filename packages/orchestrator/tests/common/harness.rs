//! Postgres harness backed by testcontainers.
//!
//! One container is started on first use and shared by every test in the
//! binary; each test gets its own connection pool.

use anyhow::{Context, Result};
use orchestrator_core::domains::sessions::stores::PostgresSessionStore;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct SharedPostgres {
    db_url: String,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_POSTGRES: OnceCell<SharedPostgres> = OnceCell::const_new();

impl SharedPostgres {
    async fn init() -> Result<Self> {
        // RUST_LOG=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        Ok(Self {
            db_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_POSTGRES
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared Postgres container")
            })
            .await
    }
}

/// Per-test context holding a store connected to the shared container.
/// Migrations run when the store connects.
///
/// ```ignore
/// #[test_context(PgHarness)]
/// #[tokio::test]
/// async fn my_test(ctx: &PgHarness) {
///     ctx.store.list_sessions(None).await.unwrap();
/// }
/// ```
pub struct PgHarness {
    pub store: PostgresSessionStore,
}

impl AsyncTestContext for PgHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create Postgres harness")
    }

    async fn teardown(self) {
        self.store.pool().close().await;
    }
}

impl PgHarness {
    pub async fn new() -> Result<Self> {
        let shared = SharedPostgres::get().await;
        let store = PostgresSessionStore::connect(&shared.db_url)
            .await
            .context("Failed to connect to Postgres")?;
        Ok(Self { store })
    }
}
