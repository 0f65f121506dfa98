use std::path::PathBuf;
use std::time::Duration;

use tracker_adapters::collaborators::{
    DEFAULT_CODE_EXEC_TIMEOUT, DEFAULT_OPENAI_BASE_URL, DEFAULT_OPENAI_MODEL, DEFAULT_LLM_TIMEOUT,
};
use tracker_adapters::polymarket::DEFAULT_GAMMA_URL;
use tracker_adapters::{FetcherConfig, OpenAiConfig};
use tracker_core::DEFAULT_FEED_BASE_URL;
use tracker_storage::{
    HttpClientConfig, DEFAULT_FEED_MAX_AGE, DEFAULT_HTTP_TIMEOUT, DEFAULT_MAX_IN_FLIGHT,
};

pub const DEFAULT_PYTHON_EXECUTION_URL: &str =
    "https://us-central1-sodhera-search.cloudfunctions.net/execute-python-code";
pub const DEFAULT_USER_AGENT: &str = "tracking-agents-backend/0.1";
pub const DEFAULT_SCHEDULER_CRON: &str = "0 * * * * *";
pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 4;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub http_timeout_secs: u64,
    pub http_max_in_flight: usize,
    pub user_agent: String,
    pub python_execution_url: String,
    pub code_exec_timeout_secs: u64,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: String,
    pub feed_cache_max_age_secs: u64,
    pub max_concurrent_runs: usize,
    pub scheduler_enabled: bool,
    pub scheduler_cron: String,
    pub templates_path: Option<PathBuf>,
    pub gamma_base_url: String,
    pub google_news_base_url: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`] over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        Self {
            database_url: non_empty("DATABASE_URL"),
            http_timeout_secs: number("TRACKER_HTTP_TIMEOUT_SECS")
                .unwrap_or(DEFAULT_HTTP_TIMEOUT.as_secs()),
            http_max_in_flight: number("TRACKER_HTTP_MAX_IN_FLIGHT")
                .map(|n| n.max(1) as usize)
                .unwrap_or(DEFAULT_MAX_IN_FLIGHT),
            user_agent: lookup("TRACKER_USER_AGENT")
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            python_execution_url: non_empty("PYTHON_EXECUTION_URL")
                .unwrap_or_else(|| DEFAULT_PYTHON_EXECUTION_URL.to_string()),
            code_exec_timeout_secs: number("TRACKER_CODE_EXEC_TIMEOUT_SECS")
                .unwrap_or(DEFAULT_CODE_EXEC_TIMEOUT.as_secs()),
            openai_api_key: non_empty("OPENAI_API_KEY"),
            openai_base_url: non_empty("OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            openai_model: non_empty("OPENAI_MODEL")
                .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            feed_cache_max_age_secs: number("TRACKER_FEED_CACHE_MAX_AGE_SECS")
                .unwrap_or(DEFAULT_FEED_MAX_AGE.as_secs()),
            max_concurrent_runs: number("TRACKER_MAX_CONCURRENT_RUNS")
                .map(|n| n.max(1) as usize)
                .unwrap_or(DEFAULT_MAX_CONCURRENT_RUNS),
            scheduler_enabled: lookup("TRACKER_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            scheduler_cron: non_empty("TRACKER_SCHEDULER_CRON")
                .unwrap_or_else(|| DEFAULT_SCHEDULER_CRON.to_string()),
            templates_path: non_empty("TRACKER_TEMPLATES_PATH").map(PathBuf::from),
            gamma_base_url: non_empty("POLYMARKET_GAMMA_URL")
                .unwrap_or_else(|| DEFAULT_GAMMA_URL.to_string()),
            google_news_base_url: non_empty("GOOGLE_NEWS_RSS_URL")
                .unwrap_or_else(|| DEFAULT_FEED_BASE_URL.to_string()),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            max_in_flight: self.http_max_in_flight,
        }
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            gamma_base_url: self.gamma_base_url.clone(),
            google_news_base_url: self.google_news_base_url.clone(),
            feed_max_age: Duration::from_secs(self.feed_cache_max_age_secs),
        }
    }

    pub fn code_exec_timeout(&self) -> Duration {
        Duration::from_secs(self.code_exec_timeout_secs)
    }

    /// `None` when no API key is configured.
    pub fn openai_config(&self) -> Option<OpenAiConfig> {
        self.openai_api_key.as_ref().map(|api_key| OpenAiConfig {
            api_key: api_key.clone(),
            base_url: self.openai_base_url.clone(),
            model: self.openai_model.clone(),
            timeout: DEFAULT_LLM_TIMEOUT,
        })
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}
