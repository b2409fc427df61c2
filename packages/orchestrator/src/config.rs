use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::domains::iterations::ExecutorConfig;
use crate::domains::recovery::{RecoveryPolicy, SuspicionPolicy};
use crate::domains::sessions::ControlLoopConfig;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub parsehub_api_key: Option<String>,
    pub parsehub_base_url: String,
    pub poll_interval: Duration,
    pub max_poll_backoff: Duration,
    pub max_poll_duration: Duration,
    pub stop_detection_window: Duration,
    pub max_recovery_attempts: u32,
    pub pages_per_iteration: u32,
    pub control_loop_interval: Duration,
    pub inter_session_pause: Duration,
    pub monitor_check_interval: Duration,
    pub fetch_page_limit: u64,
    pub max_fetch_chunks_per_poll: u32,
    pub items_per_page: u32,
    pub suspicious_max_pages: u64,
    pub suspicious_max_records: u64,
    pub minutes_per_iteration_estimate: u32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").ok(),
            parsehub_api_key: env::var("PARSEHUB_API_KEY").ok(),
            parsehub_base_url: env::var("PARSEHUB_BASE_URL")
                .unwrap_or_else(|_| parsehub_client::DEFAULT_BASE_URL.to_string()),
            poll_interval: Duration::from_secs(parse_or("POLL_INTERVAL_SECS", 2)?),
            max_poll_backoff: Duration::from_secs(parse_or("MAX_POLL_BACKOFF_SECS", 30)?),
            max_poll_duration: Duration::from_secs(parse_or("MAX_POLL_DURATION_SECS", 7200)?),
            stop_detection_window: Duration::from_secs(
                parse_or::<u64>("STOP_DETECTION_MINUTES", 5)? * 60,
            ),
            max_recovery_attempts: parse_or("MAX_RECOVERY_ATTEMPTS", 3)?,
            pages_per_iteration: parse_or("PAGES_PER_ITERATION", 10)?,
            control_loop_interval: Duration::from_secs(parse_or("CONTROL_LOOP_INTERVAL_SECS", 5)?),
            inter_session_pause: Duration::from_secs(parse_or("INTER_SESSION_PAUSE_SECS", 2)?),
            monitor_check_interval: Duration::from_secs(parse_or(
                "MONITOR_CHECK_INTERVAL_SECS",
                60,
            )?),
            fetch_page_limit: parse_or("FETCH_PAGE_LIMIT", 100)?,
            max_fetch_chunks_per_poll: parse_or("MAX_FETCH_CHUNKS_PER_POLL", 50)?,
            items_per_page: parse_or("ITEMS_PER_PAGE", 20)?,
            suspicious_max_pages: parse_or("SUSPICIOUS_MAX_PAGES", 5)?,
            suspicious_max_records: parse_or("SUSPICIOUS_MAX_RECORDS", 20)?,
            minutes_per_iteration_estimate: parse_or("MINUTES_PER_ITERATION_ESTIMATE", 3)?,
        })
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set")
    }

    pub fn require_api_key(&self) -> Result<&str> {
        self.parsehub_api_key
            .as_deref()
            .context("PARSEHUB_API_KEY must be set")
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            poll_interval: self.poll_interval,
            max_poll_backoff: self.max_poll_backoff,
            max_poll_duration: self.max_poll_duration,
            fetch_page_limit: self.fetch_page_limit,
            max_fetch_chunks_per_poll: self.max_fetch_chunks_per_poll,
            items_per_page: self.items_per_page,
        }
    }

    pub fn recovery_policy(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            max_attempts: self.max_recovery_attempts,
            stall_window: self.stop_detection_window,
            items_per_page: self.items_per_page,
            suspicion: SuspicionPolicy {
                max_pages: self.suspicious_max_pages,
                max_records: self.suspicious_max_records,
            },
        }
    }

    pub fn control_loop_config(&self) -> ControlLoopConfig {
        ControlLoopConfig {
            interval: self.control_loop_interval,
            inter_session_pause: self.inter_session_pause,
            max_consecutive_failures: self.max_recovery_attempts,
            lease_ttl: self.control_loop_interval * 6 + self.max_poll_duration,
        }
    }
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a valid number", key)),
        Err(_) => Ok(default),
    }
}
