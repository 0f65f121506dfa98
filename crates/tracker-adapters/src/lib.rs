//! Source adapters: raw payload shapes, RSS parsing, normalization, target
//! fetching and the analysis collaborators.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracker_core::{QuerySpecError, RssItem, TrackerTarget};
use tracker_storage::FetchError;

pub mod collaborators;
pub mod fetcher;
pub mod normalize;
pub mod polymarket;
pub mod rss;

pub use collaborators::{
    ChatMessage, CodeExecutionRequest, CodeExecutionResult, CodeExecutor, HttpCodeExecutor,
    LlmClient, OpenAiChatClient, OpenAiConfig,
};
pub use fetcher::{DataFetcher, FetcherConfig};
pub use normalize::{normalize, normalize_all};
pub use polymarket::{PolymarketEvent, PolymarketMarket};
pub use rss::{parse_rss, RssClient};

pub const CRATE_NAME: &str = "tracker-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("google news rss rate limit: {status}")]
    RateLimited { status: u16 },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid feed document: {0}")]
    Parse(String),
    #[error(transparent)]
    QuerySpec(#[from] QuerySpecError),
    #[error("{0}")]
    Collaborator(String),
    #[error(transparent)]
    Cache(#[from] anyhow::Error),
}

/// One upstream record, typed by the source it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    PolymarketMarket(PolymarketMarket),
    PolymarketEvent(PolymarketEvent),
    Rss(RssItem),
    Http(JsonValue),
}

#[async_trait]
pub trait TargetFetcher: Send + Sync {
    /// Raw records for `target`. Only rate limiting and cache failures are errors.
    async fn fetch(&self, target: &TrackerTarget) -> Result<Vec<RawRecord>, AdapterError>;
}
