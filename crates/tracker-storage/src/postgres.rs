//! PostgreSQL-backed store and feed cache. Documents are stored as JSONB.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracker_core::{
    CachedFeed, NotificationRecord, RssItem, Snapshot, Subscription, Tracker, TrackerRun,
};

use crate::feed_cache::{cached_feed, FeedCache};
use crate::store::TrackingStore;

pub async fn connect(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(8)
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("running tracker migrations")
}

fn doc<T: DeserializeOwned>(row: &PgRow) -> Result<T> {
    let Json(value) = row.try_get::<Json<T>, _>("doc")?;
    Ok(value)
}

fn docs<T: DeserializeOwned>(rows: &[PgRow]) -> Result<Vec<T>> {
    rows.iter().map(doc).collect()
}

#[derive(Debug, Clone)]
pub struct PgTrackingStore {
    pool: PgPool,
}

impl PgTrackingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        Ok(Self::new(connect(database_url).await?))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TrackingStore for PgTrackingStore {
    async fn create_tracker(&self, tracker: &Tracker) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trackers (id, owner_id, status, doc, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&tracker.id)
        .bind(&tracker.owner_id)
        .bind(tracker.status.as_str())
        .bind(Json(tracker))
        .bind(tracker.created_at)
        .bind(tracker.updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting tracker {}", tracker.id))?;
        Ok(())
    }

    async fn get_tracker(&self, tracker_id: &str) -> Result<Option<Tracker>> {
        let row = sqlx::query("SELECT doc FROM trackers WHERE id = $1")
            .bind(tracker_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading tracker {tracker_id}"))?;
        row.as_ref().map(doc).transpose()
    }

    async fn update_tracker(&self, tracker: &Tracker) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE trackers
               SET owner_id = $2,
                   status = $3,
                   doc = $4,
                   updated_at = $5
             WHERE id = $1
            "#,
        )
        .bind(&tracker.id)
        .bind(&tracker.owner_id)
        .bind(tracker.status.as_str())
        .bind(Json(tracker))
        .bind(tracker.updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("updating tracker {}", tracker.id))?;
        if result.rows_affected() == 0 {
            bail!("tracker {} not found", tracker.id);
        }
        Ok(())
    }

    async fn list_trackers(&self, user_id: &str) -> Result<Vec<Tracker>> {
        let rows = sqlx::query(
            "SELECT doc FROM trackers WHERE owner_id = $1 ORDER BY created_at, id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("listing trackers")?;
        docs(&rows)
    }

    async fn list_all_active_trackers(&self) -> Result<Vec<Tracker>> {
        let rows = sqlx::query(
            "SELECT doc FROM trackers WHERE status = 'active' ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing active trackers")?;
        docs(&rows)
    }

    async fn add_subscription(&self, subscription: &Subscription) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (tracker_id, user_id, doc, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tracker_id, user_id) DO UPDATE SET doc = EXCLUDED.doc
            "#,
        )
        .bind(&subscription.tracker_id)
        .bind(&subscription.user_id)
        .bind(Json(subscription))
        .bind(subscription.created_at)
        .execute(&self.pool)
        .await
        .context("upserting subscription")?;
        Ok(())
    }

    async fn get_subscription(
        &self,
        tracker_id: &str,
        user_id: &str,
    ) -> Result<Option<Subscription>> {
        let row = sqlx::query(
            "SELECT doc FROM subscriptions WHERE tracker_id = $1 AND user_id = $2",
        )
        .bind(tracker_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading subscription")?;
        row.as_ref().map(doc).transpose()
    }

    async fn list_subscriptions(&self, tracker_id: &str) -> Result<Vec<Subscription>> {
        let rows = sqlx::query(
            "SELECT doc FROM subscriptions WHERE tracker_id = $1 ORDER BY created_at, user_id",
        )
        .bind(tracker_id)
        .fetch_all(&self.pool)
        .await
        .context("listing subscriptions")?;
        docs(&rows)
    }

    async fn list_subscriptions_for_user(&self, user_id: &str) -> Result<Vec<Subscription>> {
        let rows = sqlx::query(
            "SELECT doc FROM subscriptions WHERE user_id = $1 ORDER BY created_at, tracker_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("listing user subscriptions")?;
        docs(&rows)
    }

    async fn save_run(&self, run: &TrackerRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tracker_runs (id, tracker_id, run_at, status, doc)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&run.id)
        .bind(&run.tracker_id)
        .bind(run.timestamp)
        .bind(run.status.as_str())
        .bind(Json(run))
        .execute(&self.pool)
        .await
        .with_context(|| format!("saving run {}", run.id))?;
        Ok(())
    }

    async fn get_last_run(&self, tracker_id: &str) -> Result<Option<TrackerRun>> {
        let row = sqlx::query(
            r#"
            SELECT doc FROM tracker_runs
             WHERE tracker_id = $1
             ORDER BY run_at DESC, seq DESC
             LIMIT 1
            "#,
        )
        .bind(tracker_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading last run")?;
        row.as_ref().map(doc).transpose()
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (id, tracker_id, taken_at, doc)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&snapshot.id)
        .bind(&snapshot.tracker_id)
        .bind(snapshot.timestamp)
        .bind(Json(snapshot))
        .execute(&self.pool)
        .await
        .with_context(|| format!("saving snapshot {}", snapshot.id))?;
        Ok(())
    }

    async fn get_last_snapshot(&self, tracker_id: &str) -> Result<Option<Snapshot>> {
        let row = sqlx::query(
            r#"
            SELECT doc FROM snapshots
             WHERE tracker_id = $1
             ORDER BY taken_at DESC, seq DESC
             LIMIT 1
            "#,
        )
        .bind(tracker_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading last snapshot")?;
        row.as_ref().map(doc).transpose()
    }

    async fn save_notification_record(&self, record: &NotificationRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_records (id, tracker_id, run_id, user_id, sent_at, doc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&record.id)
        .bind(&record.tracker_id)
        .bind(&record.run_id)
        .bind(&record.user_id)
        .bind(record.timestamp)
        .bind(Json(record))
        .execute(&self.pool)
        .await
        .context("saving notification record")?;
        Ok(())
    }

    async fn list_notification_records(
        &self,
        tracker_id: &str,
    ) -> Result<Vec<NotificationRecord>> {
        let rows = sqlx::query(
            "SELECT doc FROM notification_records WHERE tracker_id = $1 ORDER BY seq",
        )
        .bind(tracker_id)
        .fetch_all(&self.pool)
        .await
        .context("listing notification records")?;
        docs(&rows)
    }
}

#[derive(Debug, Clone)]
pub struct PgFeedCache {
    pool: PgPool,
}

impl PgFeedCache {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FeedCache for PgFeedCache {
    async fn get(&self, query_key: &str) -> Result<Option<CachedFeed>> {
        let row = sqlx::query("SELECT doc FROM feed_cache WHERE query_key = $1")
            .bind(query_key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading cached feed {query_key}"))?;
        row.as_ref().map(doc).transpose()
    }

    async fn set(
        &self,
        query_key: &str,
        items: Vec<RssItem>,
        fetched_at: DateTime<Utc>,
    ) -> Result<CachedFeed> {
        let feed = cached_feed(query_key, items, fetched_at);
        sqlx::query(
            r#"
            INSERT INTO feed_cache (query_key, fetched_at, doc)
            VALUES ($1, $2, $3)
            ON CONFLICT (query_key) DO UPDATE
               SET fetched_at = EXCLUDED.fetched_at,
                   doc = EXCLUDED.doc
            "#,
        )
        .bind(query_key)
        .bind(fetched_at)
        .bind(Json(&feed))
        .execute(&self.pool)
        .await
        .with_context(|| format!("writing cached feed {query_key}"))?;
        Ok(feed)
    }

    async fn invalidate(&self, query_key: &str) -> Result<()> {
        sqlx::query("DELETE FROM feed_cache WHERE query_key = $1")
            .bind(query_key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("invalidating cached feed {query_key}"))?;
        Ok(())
    }
}
