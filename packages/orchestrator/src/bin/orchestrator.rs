//! Orchestrator CLI
//!
//! Session control surface plus the long-running `run` command that hosts
//! the session control loop and the project monitor.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orchestrator_core::common::SessionId;
use orchestrator_core::config::Config;
use orchestrator_core::domains::consolidation::DedupStrategy;
use orchestrator_core::domains::iterations::IterationExecutor;
use orchestrator_core::domains::recovery::{ProjectMonitor, RecoveryDetector};
use orchestrator_core::domains::sessions::stores::PostgresSessionStore;
use orchestrator_core::domains::sessions::{
    cancel_session, create_session, export_session, get_progress, CreateSession,
    SessionControlLoop,
};
use orchestrator_core::kernel::{OrchestratorDeps, ParseHubAdapter};
use parsehub_client::ParseHubClient;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "orchestrator")]
#[command(about = "Incremental scraping orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new scraping session
    CreateSession {
        #[arg(long)]
        project_token: String,
        #[arg(long)]
        project_name: String,
        /// URL of the first page to scrape
        #[arg(long)]
        url: String,
        /// Total number of pages to scrape
        #[arg(long)]
        pages: i32,
        /// Pages per provider run (defaults to PAGES_PER_ITERATION)
        #[arg(long)]
        pages_per_iteration: Option<i32>,
        /// `content_hash` or `key_column:<column>`
        #[arg(long, default_value = "content_hash")]
        dedup: String,
    },

    /// Show session progress as JSON
    Progress { session_id: String },

    /// Cancel a running session
    Cancel { session_id: String },

    /// Clear a project's recovery attempt counter
    ResetRecovery { project_token: String },

    /// Show project monitor settings and recovery counters
    MonitorStatus,

    /// Write a session's merged records as CSV
    Export {
        session_id: String,
        /// Output file (stdout when omitted)
        #[arg(long, short)]
        output: Option<std::path::PathBuf>,
        /// Add source_iteration and source_page columns
        #[arg(long)]
        include_source: bool,
    },

    /// Run the session control loop and the project monitor
    Run {
        /// Skip the project monitor
        #[arg(long)]
        no_monitor: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,orchestrator_core=debug,sqlx=warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;

    match cli.command {
        Commands::CreateSession {
            project_token,
            project_name,
            url,
            pages,
            pages_per_iteration,
            dedup,
        } => {
            let deps = build_deps(&config).await?;
            let dedup_strategy: DedupStrategy = dedup.parse().context("Invalid --dedup value")?;
            let input = CreateSession::builder()
                .project_token(project_token)
                .project_name(project_name)
                .target_url(url)
                .total_pages(pages)
                .pages_per_iteration(
                    pages_per_iteration.unwrap_or(config.pages_per_iteration as i32),
                )
                .dedup_strategy(dedup_strategy)
                .build();
            let session = create_session(input, &deps).await?;
            output(&session)
        }
        Commands::Progress { session_id } => {
            let deps = build_deps(&config).await?;
            let progress = get_progress(
                parse_session_id(&session_id)?,
                config.minutes_per_iteration_estimate,
                &deps,
            )
            .await?;
            output(&progress)
        }
        Commands::Cancel { session_id } => {
            let deps = build_deps(&config).await?;
            let session = cancel_session(parse_session_id(&session_id)?, &deps).await?;
            output(&session)
        }
        Commands::ResetRecovery { project_token } => {
            let deps = build_deps(&config).await?;
            let detector = RecoveryDetector::new(deps, config.recovery_policy());
            detector.reset_attempts(&project_token).await?;
            output(&serde_json::json!({ "project_token": project_token, "recovery_attempts": 0 }))
        }
        Commands::MonitorStatus => {
            let deps = build_deps(&config).await?;
            let detector = RecoveryDetector::new(deps.clone(), config.recovery_policy());
            let monitor = ProjectMonitor::new(deps, detector, config.monitor_check_interval);
            output(&monitor.status().await?)
        }
        Commands::Export {
            session_id,
            output: path,
            include_source,
        } => {
            let deps = build_deps(&config).await?;
            let merged =
                export_session(parse_session_id(&session_id)?, include_source, &deps).await?;
            let csv = merged.to_csv()?;
            match path {
                Some(path) => {
                    std::fs::write(&path, csv)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    tracing::info!(path = %path.display(), records = merged.record_count, "Export written");
                }
                None => print!("{}", csv),
            }
            Ok(())
        }
        Commands::Run { no_monitor } => run(&config, no_monitor).await,
    }
}

async fn run(config: &Config, no_monitor: bool) -> Result<()> {
    tracing::info!("Starting scraping orchestrator");
    config.require_api_key()?;
    let deps = build_deps(config).await?;
    let detector = RecoveryDetector::new(deps.clone(), config.recovery_policy());
    let executor = IterationExecutor::new(deps.clone(), detector.clone(), config.executor_config());
    let control_loop = SessionControlLoop::new(deps.clone(), executor, config.control_loop_config());

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
        }
        signal.cancel();
    });

    let monitor_handle = if no_monitor {
        None
    } else {
        let monitor = ProjectMonitor::new(deps, detector, config.monitor_check_interval);
        let token = shutdown.clone();
        Some(tokio::spawn(async move { monitor.run(token).await }))
    };

    control_loop.run(shutdown).await;

    if let Some(handle) = monitor_handle {
        handle.await.context("Project monitor task panicked")?;
    }
    Ok(())
}

async fn build_deps(config: &Config) -> Result<OrchestratorDeps> {
    let store = PostgresSessionStore::connect(config.require_database_url()?)
        .await
        .context("Failed to connect to database")?;

    // Commands that never reach the provider still get a client; the key is
    // only required once a request is made.
    let api_key = config.parsehub_api_key.clone().unwrap_or_default();
    let client = ParseHubClient::with_base_url(api_key, config.parsehub_base_url.clone())
        .context("Failed to build ParseHub client")?;

    Ok(OrchestratorDeps::new(
        Arc::new(store),
        Arc::new(ParseHubAdapter::new(Arc::new(client))),
    ))
}

fn parse_session_id(raw: &str) -> Result<SessionId> {
    SessionId::parse(raw.trim()).with_context(|| format!("Invalid session id: {}", raw))
}

fn output<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
