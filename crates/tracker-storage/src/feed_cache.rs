//! Staleness-aware cache of fetched RSS feeds, keyed by rendered query.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use tokio::sync::RwLock;
use tracker_core::{canonical_json, short_hash, CachedFeed, RssItem};

pub const DEFAULT_FEED_MAX_AGE: Duration = Duration::from_secs(3 * 60 * 60);

/// Short fingerprint of the fields that identify an RSS entry.
pub fn rss_item_fingerprint(item: &RssItem) -> String {
    let value = json!({
        "link": item.link,
        "title": item.title,
        "pubDate": item.pub_date,
    });
    short_hash(&canonical_json(&value))
}

pub fn feed_is_stale(feed: &CachedFeed, max_age: Duration, now: DateTime<Utc>) -> bool {
    let max_age = TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX);
    now.signed_duration_since(feed.fetched_at) > max_age
}

pub(crate) fn cached_feed(
    query_key: &str,
    items: Vec<RssItem>,
    fetched_at: DateTime<Utc>,
) -> CachedFeed {
    let fingerprints = items.iter().map(rss_item_fingerprint).collect();
    CachedFeed {
        query_key: query_key.to_string(),
        items,
        fingerprints,
        fetched_at,
    }
}

#[async_trait]
pub trait FeedCache: Send + Sync {
    async fn get(&self, query_key: &str) -> Result<Option<CachedFeed>>;
    /// Overwrites the entry for `query_key` and returns what was stored.
    async fn set(
        &self,
        query_key: &str,
        items: Vec<RssItem>,
        fetched_at: DateTime<Utc>,
    ) -> Result<CachedFeed>;
    async fn invalidate(&self, query_key: &str) -> Result<()>;

    /// Missing entries count as stale.
    async fn is_stale_at(
        &self,
        query_key: &str,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(match self.get(query_key).await? {
            Some(feed) => feed_is_stale(&feed, max_age, now),
            None => true,
        })
    }

    async fn is_stale(&self, query_key: &str, max_age: Duration) -> Result<bool> {
        self.is_stale_at(query_key, max_age, Utc::now()).await
    }
}

#[derive(Debug, Default)]
pub struct MemoryFeedCache {
    entries: RwLock<HashMap<String, CachedFeed>>,
}

impl MemoryFeedCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FeedCache for MemoryFeedCache {
    async fn get(&self, query_key: &str) -> Result<Option<CachedFeed>> {
        Ok(self.entries.read().await.get(query_key).cloned())
    }

    async fn set(
        &self,
        query_key: &str,
        items: Vec<RssItem>,
        fetched_at: DateTime<Utc>,
    ) -> Result<CachedFeed> {
        let feed = cached_feed(query_key, items, fetched_at);
        self.entries
            .write()
            .await
            .insert(query_key.to_string(), feed.clone());
        Ok(feed)
    }

    async fn invalidate(&self, query_key: &str) -> Result<()> {
        self.entries.write().await.remove(query_key);
        Ok(())
    }
}
