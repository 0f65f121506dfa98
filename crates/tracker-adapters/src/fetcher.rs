//! Target-type dispatch to upstream sources, with the shared feed cache in
//! front of news searches.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};
use tracker_core::{
    build_feed_url, compute_query_key, GoogleNewsQuerySpec, RssItem, TrackerTarget,
    DEFAULT_FEED_BASE_URL,
};
use tracker_storage::{feed_is_stale, FeedCache, HttpFetcher, KeyedLocks, DEFAULT_FEED_MAX_AGE};

use crate::polymarket::{
    event_url, market_url, PolymarketEvent, PolymarketMarket, DEFAULT_GAMMA_URL,
};
use crate::rss::RssClient;
use crate::{AdapterError, RawRecord, TargetFetcher};

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub gamma_base_url: String,
    pub google_news_base_url: String,
    pub feed_max_age: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            gamma_base_url: DEFAULT_GAMMA_URL.to_string(),
            google_news_base_url: DEFAULT_FEED_BASE_URL.to_string(),
            feed_max_age: DEFAULT_FEED_MAX_AGE,
        }
    }
}

pub struct DataFetcher {
    http: Arc<HttpFetcher>,
    rss: RssClient,
    cache: Arc<dyn FeedCache>,
    feed_locks: KeyedLocks,
    config: FetcherConfig,
}

impl DataFetcher {
    pub fn new(http: Arc<HttpFetcher>, cache: Arc<dyn FeedCache>, config: FetcherConfig) -> Self {
        Self {
            rss: RssClient::new(http.clone()),
            http,
            cache,
            feed_locks: KeyedLocks::new(),
            config,
        }
    }

    async fn get_json_or_warn(&self, url: &str, target_type: &str) -> Option<JsonValue> {
        match self.http.get_json::<JsonValue>(url).await {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(target_type, url, error = %err, "upstream fetch failed; treating as empty");
                None
            }
        }
    }

    async fn fetch_market(&self, market_id: &str) -> Vec<RawRecord> {
        let url = market_url(&self.config.gamma_base_url, market_id);
        let Some(value) = self.get_json_or_warn(&url, "polymarketMarket").await else {
            return Vec::new();
        };
        match PolymarketMarket::from_json(&value) {
            Some(market) => vec![RawRecord::PolymarketMarket(market)],
            None => {
                warn!(market_id, "market payload has no id; treating as empty");
                Vec::new()
            }
        }
    }

    async fn fetch_event(&self, event_id: &str) -> Vec<RawRecord> {
        let url = event_url(&self.config.gamma_base_url, event_id);
        let Some(value) = self.get_json_or_warn(&url, "polymarketEvent").await else {
            return Vec::new();
        };
        match PolymarketEvent::from_json(&value) {
            Some(event) => vec![RawRecord::PolymarketEvent(event)],
            None => {
                warn!(event_id, "event payload has no id; treating as empty");
                Vec::new()
            }
        }
    }

    async fn fetch_http_source(&self, url: &str) -> Vec<RawRecord> {
        match self.get_json_or_warn(url, "httpSource").await {
            Some(JsonValue::Array(records)) => records.into_iter().map(RawRecord::Http).collect(),
            Some(value) => vec![RawRecord::Http(value)],
            None => Vec::new(),
        }
    }

    /// Cache-first news search. The per-key lock spans check, fetch and write,
    /// so trackers sharing a query key trigger a single upstream request.
    async fn fetch_news_search(
        &self,
        spec: &GoogleNewsQuerySpec,
    ) -> Result<Vec<RssItem>, AdapterError> {
        let feed_url = build_feed_url(spec, &self.config.google_news_base_url)?;
        let query_key = compute_query_key(spec)?;

        let _guard = self.feed_locks.lock(&query_key).await;
        let now = Utc::now();
        if let Some(cached) = self.cache.get(&query_key).await? {
            if !feed_is_stale(&cached, self.config.feed_max_age, now) {
                debug!(query_key = %query_key, items = cached.items.len(), "feed cache hit");
                return Ok(cached.items);
            }
        }

        let items = self.rss.fetch_feed(&feed_url).await?;
        self.cache.set(&query_key, items.clone(), now).await?;
        info!(query_key = %query_key, items = items.len(), "feed cache refreshed");
        Ok(items)
    }

    async fn fetch_newsletter(&self, url: &str) -> Vec<RawRecord> {
        match self.rss.fetch_feed(url).await {
            Ok(items) => items.into_iter().map(RawRecord::Rss).collect(),
            Err(err) => {
                warn!(
                    target_type = "substackFeed",
                    url,
                    error = %err,
                    "feed fetch failed; treating as empty"
                );
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl TargetFetcher for DataFetcher {
    async fn fetch(&self, target: &TrackerTarget) -> Result<Vec<RawRecord>, AdapterError> {
        let records = match target {
            TrackerTarget::PolymarketMarket { market_id } => self.fetch_market(market_id).await,
            TrackerTarget::PolymarketEvent { event_id } => self.fetch_event(event_id).await,
            TrackerTarget::HttpSource { url } => self.fetch_http_source(url).await,
            TrackerTarget::GoogleNewsRssSearch { .. } => {
                let spec = target.effective_query_spec().unwrap_or_default();
                self.fetch_news_search(&spec)
                    .await?
                    .into_iter()
                    .map(RawRecord::Rss)
                    .collect()
            }
            TrackerTarget::SubstackFeed { url } => self.fetch_newsletter(url).await,
            TrackerTarget::Composite { .. } => Vec::new(),
        };
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{
        extract::{Path, State},
        http::{header, StatusCode},
        response::IntoResponse,
        routing::get,
        Json, Router,
    };
    use serde_json::json;
    use tokio::net::TcpListener;
    use tracker_storage::{HttpClientConfig, MemoryFeedCache};

    const FEED: &str = include_str!("../tests/fixtures/google_news_search.xml");

    #[derive(Clone, Default)]
    struct Hits {
        rss: Arc<AtomicUsize>,
    }

    async fn fixture_server(hits: Hits) -> String {
        async fn market(Path(id): Path<String>) -> impl IntoResponse {
            if id == "missing" {
                return StatusCode::NOT_FOUND.into_response();
            }
            Json(json!({
                "id": id,
                "question": "Will it rain?",
                "outcomes": "[\"Yes\",\"No\"]",
                "outcomePrices": "[\"0.4\",\"0.6\"]",
                "volume": "100"
            }))
            .into_response()
        }
        async fn rss(State(hits): State<Hits>) -> impl IntoResponse {
            hits.rss.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            ([(header::CONTENT_TYPE, "application/rss+xml")], FEED)
        }

        let app = Router::new()
            .route("/markets/{id}", get(market))
            .route(
                "/events/{id}",
                get(|Path(id): Path<String>| async move {
                    let markets = json!([{"id": "m1", "question": "Cut?"}]);
                    Json(json!({"id": id, "title": "Fed", "markets": markets}))
                }),
            )
            .route("/feed.json", get(|| async { Json(json!([{"id": "a"}, {"id": "b"}, 3])) }))
            .route("/object.json", get(|| async { Json(json!({"status": "ok"})) }))
            .route("/rss/search", get(rss))
            .route("/newsletter/feed", get(|| async { FEED }))
            .route("/limited/rss/search", get(|| async { StatusCode::TOO_MANY_REQUESTS }))
            .route("/broken/rss/search", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
            .with_state(hits);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn fetcher(base: &str, news_path: &str, cache: Arc<MemoryFeedCache>) -> DataFetcher {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        DataFetcher::new(
            http,
            cache,
            FetcherConfig {
                gamma_base_url: base.to_string(),
                google_news_base_url: format!("{base}{news_path}"),
                feed_max_age: DEFAULT_FEED_MAX_AGE,
            },
        )
    }

    fn news_target(all: &[&str]) -> TrackerTarget {
        TrackerTarget::GoogleNewsRssSearch {
            query_spec: GoogleNewsQuerySpec {
                all: all.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            edition: None,
        }
    }

    #[tokio::test]
    async fn market_event_and_http_sources() {
        let base = fixture_server(Hits::default()).await;
        let f = fetcher(&base, "/rss/search", Arc::new(MemoryFeedCache::new()));

        let market = f
            .fetch(&TrackerTarget::PolymarketMarket { market_id: "12345".into() })
            .await
            .unwrap();
        assert!(matches!(
            &market[..],
            [RawRecord::PolymarketMarket(m)] if m.outcome_prices == ["0.4", "0.6"]
        ));

        let event = f
            .fetch(&TrackerTarget::PolymarketEvent { event_id: "e1".into() })
            .await
            .unwrap();
        assert!(matches!(&event[..], [RawRecord::PolymarketEvent(e)] if e.markets.len() == 1));

        let list = f
            .fetch(&TrackerTarget::HttpSource { url: format!("{base}/feed.json") })
            .await
            .unwrap();
        assert_eq!(list.len(), 3);
        let single = f
            .fetch(&TrackerTarget::HttpSource { url: format!("{base}/object.json") })
            .await
            .unwrap();
        assert_eq!(single.len(), 1);

        let composite = f
            .fetch(&TrackerTarget::Composite { dependency_tracker_ids: vec!["x".into()] })
            .await
            .unwrap();
        assert!(composite.is_empty());
    }

    #[tokio::test]
    async fn upstream_failures_degrade_to_empty() {
        let base = fixture_server(Hits::default()).await;
        let f = fetcher(&base, "/rss/search", Arc::new(MemoryFeedCache::new()));

        let missing = f
            .fetch(&TrackerTarget::PolymarketMarket { market_id: "missing".into() })
            .await
            .unwrap();
        assert!(missing.is_empty());

        let unreachable = f
            .fetch(&TrackerTarget::HttpSource { url: "http://127.0.0.1:9/data.json".into() })
            .await
            .unwrap();
        assert!(unreachable.is_empty());
    }

    #[tokio::test]
    async fn news_search_is_served_from_cache_until_stale() {
        let hits = Hits::default();
        let base = fixture_server(hits.clone()).await;
        let cache = Arc::new(MemoryFeedCache::new());
        let f = fetcher(&base, "/rss/search", cache.clone());

        let first = f.fetch(&news_target(&["nigeria", "election"])).await.unwrap();
        assert_eq!(first.len(), 2);
        let second = f.fetch(&news_target(&["nigeria", "election"])).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(hits.rss.load(Ordering::SeqCst), 1);

        let spec = news_target(&["nigeria", "election"]).effective_query_spec().unwrap();
        let key = compute_query_key(&spec).unwrap();
        let stale_at = Utc::now() - chrono::TimeDelta::hours(4);
        cache.set(&key, vec![], stale_at).await.unwrap();

        let refreshed = f.fetch(&news_target(&["nigeria", "election"])).await.unwrap();
        assert_eq!(refreshed.len(), 2);
        assert_eq!(hits.rss.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_searches_for_one_key_fetch_once() {
        let hits = Hits::default();
        let base = fixture_server(hits.clone()).await;
        let f = Arc::new(fetcher(&base, "/rss/search", Arc::new(MemoryFeedCache::new())));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..5 {
            let f = f.clone();
            tasks.spawn(async move { f.fetch(&news_target(&["naira"])).await.unwrap().len() });
        }
        while let Some(len) = tasks.join_next().await {
            assert_eq!(len.unwrap(), 2);
        }
        assert_eq!(hits.rss.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limited_search_fails_without_caching() {
        let base = fixture_server(Hits::default()).await;
        let cache = Arc::new(MemoryFeedCache::new());
        let f = fetcher(&base, "/limited/rss/search", cache.clone());

        let err = f.fetch(&news_target(&["naira"])).await.unwrap_err();
        assert!(matches!(err, AdapterError::RateLimited { status: 429 }));

        let spec = news_target(&["naira"]).effective_query_spec().unwrap();
        assert!(cache.get(&compute_query_key(&spec).unwrap()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn other_search_errors_cache_an_empty_feed() {
        let base = fixture_server(Hits::default()).await;
        let cache = Arc::new(MemoryFeedCache::new());
        let f = fetcher(&base, "/broken/rss/search", cache.clone());

        assert!(f.fetch(&news_target(&["naira"])).await.unwrap().is_empty());
        let spec = news_target(&["naira"]).effective_query_spec().unwrap();
        let cached = cache.get(&compute_query_key(&spec).unwrap()).await.unwrap().unwrap();
        assert!(cached.items.is_empty());
    }

    #[tokio::test]
    async fn newsletter_feeds_bypass_the_cache() {
        let base = fixture_server(Hits::default()).await;
        let f = fetcher(&base, "/rss/search", Arc::new(MemoryFeedCache::new()));
        let items = f
            .fetch(&TrackerTarget::SubstackFeed { url: format!("{base}/newsletter/feed") })
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
        let limited = f
            .fetch(&TrackerTarget::SubstackFeed { url: format!("{base}/limited/rss/search") })
            .await
            .unwrap();
        assert!(limited.is_empty());
    }
}
