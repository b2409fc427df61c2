//! Pure ParseHub REST API client.
//!
//! A minimal client for the ParseHub v2 API. Supports starting project runs,
//! reading run status, paging through run data, and listing projects.
//!
//! # Example
//!
//! ```rust,ignore
//! use parsehub_client::ParseHubClient;
//!
//! let client = ParseHubClient::new("your-api-key".into())?;
//!
//! let run = client.start_run("tXyz", "https://example.com/items?page=1").await?;
//! let status = client.get_run(&run.run_token).await?;
//! let chunk = client.get_run_data(&run.run_token, 0, 100).await?;
//! println!("{} of {} records", chunk.data.len(), chunk.total_count);
//! ```

pub mod error;
pub mod types;

pub use error::{ParseHubError, Result};
pub use types::{DataChunk, LastRun, Project, RunData, StartRunInput};

use std::time::Duration;

use serde::de::DeserializeOwned;
use types::ProjectList;

pub const DEFAULT_BASE_URL: &str = "https://www.parsehub.com/api/v2";

/// Per-request timeout. Status and data calls are expected to be fast.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ParseHubClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl ParseHubClient {
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL.to_string())
    }

    /// Point the client at a different API root (self-hosted proxy, test server).
    pub fn with_base_url(api_key: String, base_url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(ParseHubError::Transport)?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Start a new run of an existing project, beginning at `start_url`.
    pub async fn start_run(&self, project_token: &str, start_url: &str) -> Result<RunData> {
        let url = format!("{}/projects/{}/run", self.base_url, project_token);
        let input = StartRunInput {
            api_key: self.api_key.clone(),
            start_url: start_url.to_string(),
        };

        tracing::debug!(project_token, start_url, "Starting ParseHub run");
        let resp = self.client.post(&url).form(&input).send().await?;
        Self::decode(resp).await
    }

    /// Fetch the current state of a run.
    pub async fn get_run(&self, run_token: &str) -> Result<RunData> {
        let url = format!("{}/runs/{}", self.base_url, run_token);
        let resp = self
            .client
            .get(&url)
            .query(&[("api_key", self.api_key.as_str())])
            .send()
            .await?;

        let mut run: RunData = Self::decode(resp).await?;
        if run.run_token.is_empty() {
            run.run_token = run_token.to_string();
        }
        tracing::debug!(run_token, status = %run.status, data_count = run.data_count, "Run status");
        Ok(run)
    }

    /// Fetch one chunk of a run's results.
    ///
    /// The provider pages results itself; callers advance `offset` by `limit`
    /// until `offset + limit >= total_count`.
    pub async fn get_run_data(&self, run_token: &str, offset: u64, limit: u64) -> Result<DataChunk> {
        let url = format!("{}/runs/{}/data", self.base_url, run_token);
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("api_key", self.api_key.clone()),
                ("offset", offset.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?;

        Self::decode(resp).await
    }

    /// List every project visible to the API key, with last-run summaries.
    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let url = format!("{}/projects", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("api_key", self.api_key.as_str())])
            .send()
            .await?;

        let list: ProjectList = Self::decode(resp).await?;
        Ok(list.projects)
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ParseHubError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        resp.json::<T>().await.map_err(ParseHubError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_data_tolerates_missing_fields() {
        let run: RunData = serde_json::from_str(r#"{"status": "running"}"#).unwrap();
        assert_eq!(run.status, "running");
        assert_eq!(run.data_count, 0);
        assert!(run.page_crawled_url.is_none());
    }

    #[test]
    fn run_data_accepts_naive_timestamps() {
        let run: RunData = serde_json::from_str(
            r#"{"run_token": "r1", "status": "complete", "data_count": 8,
                "start_time": "2015-12-03T21:41:58.123456", "end_time": null}"#,
        )
        .unwrap();
        assert_eq!(run.status, "complete");
        assert_eq!(run.data_count, 8);
        assert_eq!(run.start_time.as_deref(), Some("2015-12-03T21:41:58.123456"));
        assert!(run.end_time.is_none());
    }

    #[test]
    fn data_chunk_parses_records_and_total() {
        let chunk: DataChunk = serde_json::from_str(
            r#"{"data": [{"name": "a"}, {"name": "b"}], "total_count": 250}"#,
        )
        .unwrap();
        assert_eq!(chunk.data.len(), 2);
        assert_eq!(chunk.total_count, 250);
    }

    #[test]
    fn project_list_parses_last_run() {
        let list: ProjectList = serde_json::from_str(
            r#"{"projects": [{"token": "t1", "last_run": {"pages_scraped": 3, "data_count": 12}}]}"#,
        )
        .unwrap();
        let last = list.projects[0].last_run.as_ref().unwrap();
        assert_eq!(last.pages_scraped, 3);
        assert_eq!(last.data_count, 12);
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client =
            ParseHubClient::with_base_url("k".into(), "http://localhost:9999/api/".into()).unwrap();
        assert_eq!(client.base_url(), "http://localhost:9999/api");
    }

    #[tokio::test]
    async fn unreachable_host_is_a_transport_error() {
        // Port 9 (discard) on localhost is closed in CI containers.
        let client =
            ParseHubClient::with_base_url("k".into(), "http://127.0.0.1:9".into()).unwrap();
        let err = client.get_run("r1").await.unwrap_err();
        assert!(err.is_transport(), "got {err:?}");
    }
}
