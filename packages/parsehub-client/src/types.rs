use serde::{Deserialize, Serialize};

/// Form body for `POST /projects/{token}/run`.
#[derive(Debug, Clone, Serialize)]
pub struct StartRunInput {
    pub api_key: String,
    pub start_url: String,
}

/// Run metadata returned by `GET /runs/{token}` and `POST /projects/{token}/run`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunData {
    #[serde(default)]
    pub run_token: String,
    #[serde(default)]
    pub project_token: Option<String>,
    /// Raw provider status string (`initialized`, `running`, `complete`, ...).
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub data_count: u64,
    #[serde(default)]
    pub pages_crawled: u64,
    #[serde(default)]
    pub page_crawled_url: Option<String>,
    #[serde(default)]
    pub error_log: Option<String>,
    /// Provider timestamps, kept verbatim: they usually carry no UTC offset.
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
}

/// One chunk of run results from `GET /runs/{token}/data`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataChunk {
    #[serde(default)]
    pub data: Vec<serde_json::Value>,
    #[serde(default)]
    pub total_count: u64,
}

/// Summary of the most recent run attached to a project listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LastRun {
    #[serde(default)]
    pub run_token: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub pages_scraped: u64,
    #[serde(default)]
    pub data_count: u64,
}

/// A project as listed by `GET /projects`.
#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    pub token: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub main_site: Option<String>,
    #[serde(default)]
    pub last_run: Option<LastRun>,
}

/// Wrapper for `GET /projects`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectList {
    #[serde(default)]
    pub projects: Vec<Project>,
}
