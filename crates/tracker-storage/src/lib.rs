//! HTTP fetch utilities, tracker persistence and the shared feed cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::{info_span, Instrument};

pub mod feed_cache;
pub mod postgres;
pub mod store;

pub use feed_cache::{
    feed_is_stale, rss_item_fingerprint, FeedCache, MemoryFeedCache, DEFAULT_FEED_MAX_AGE,
};
pub use postgres::{PgFeedCache, PgTrackingStore};
pub use store::{MemoryTrackingStore, TrackingStore};

pub const CRATE_NAME: &str = "tracker-storage";

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Upper bound on requests in flight across all hosts.
    pub max_in_flight: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_HTTP_TIMEOUT,
            user_agent: None,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("http client is shut down")]
    Closed,
}

impl FetchError {
    /// Upstream asked us to back off (429 or 503).
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::HttpStatus { status: 429 | 503, .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Request(err) if err.is_timeout())
    }
}

/// Shared outbound HTTP client. Each call is a single request; failures are
/// left to the caller's degrade policy.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
        })
    }

    async fn permit(&self) -> Result<OwnedSemaphorePermit, FetchError> {
        self.in_flight
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Closed)
    }

    /// One GET of `url`. Non-2xx is an error.
    pub async fn get_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self.permit().await?;
        let span = info_span!("http_fetch", method = "GET", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        Ok(self.get_bytes(url).await?.text())
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let resp = self.get_bytes(url).await?;
        Ok(serde_json::from_slice(&resp.body)?)
    }

    /// POST a JSON body and decode a JSON reply.
    ///
    /// `timeout` overrides the client-wide timeout for this request.
    pub async fn post_json<B, T>(
        &self,
        url: &str,
        body: &B,
        timeout: Option<Duration>,
        bearer_token: Option<&str>,
    ) -> Result<T, FetchError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let _permit = self.permit().await?;
        let span = info_span!("http_fetch", method = "POST", url);
        async {
            let mut request = self.client.post(url).json(body);
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }
            if let Some(token) = bearer_token {
                request = request.bearer_auth(token);
            }
            let resp = request.send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            let bytes = resp.bytes().await?;
            Ok::<T, FetchError>(serde_json::from_slice(&bytes)?)
        }
        .instrument(span)
        .await
    }
}

type LockMap = Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>;

fn lock_map(map: &LockMap) -> MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lazily created async mutex per string key. An entry is dropped once its
/// last guard is released with nobody else waiting on it.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: LockMap,
}

/// Holds one key of a [`KeyedLocks`] until dropped.
#[derive(Debug)]
pub struct KeyedGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: String,
    locks: LockMap,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let lock = lock_map(&self.locks)
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        KeyedGuard {
            guard: Some(guard),
            key: key.to_string(),
            locks: self.locks.clone(),
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        lock_map(&self.locks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = lock_map(&self.locks);
        // Only the map's own handle left: no holder and no waiter.
        if map.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            map.remove(&self.key);
        }
    }
}
