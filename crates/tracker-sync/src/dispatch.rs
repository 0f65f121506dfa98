//! Fan-out of a positive notification decision to every subscriber.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use tracker_core::{
    AnalysisResult, DeliveryStatus, NotificationReason, NotificationRecord, Subscription, Tracker,
    DEFAULT_NOTIFICATION_CHANNEL,
};
use tracker_storage::TrackingStore;
use uuid::Uuid;

/// Delivers one notification over `channel`.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(
        &self,
        tracker: &Tracker,
        subscription: &Subscription,
        channel: &str,
        analysis: &AnalysisResult,
    ) -> Result<()>;
}

/// Delivery is the persisted record itself; callers poll for it.
#[derive(Debug, Default)]
pub struct RecordOnlySink;

#[async_trait]
impl NotificationSink for RecordOnlySink {
    async fn deliver(
        &self,
        _tracker: &Tracker,
        _subscription: &Subscription,
        _channel: &str,
        _analysis: &AnalysisResult,
    ) -> Result<()> {
        Ok(())
    }
}

/// Subscriber preference, then the tracker's first channel, then `mcp_callback`.
pub fn select_channel(tracker: &Tracker, subscription: &Subscription) -> String {
    subscription
        .delivery_prefs
        .as_ref()
        .and_then(|prefs| prefs.channels.as_ref())
        .and_then(|channels| channels.first())
        .or_else(|| tracker.notification.channels.first())
        .cloned()
        .unwrap_or_else(|| DEFAULT_NOTIFICATION_CHANNEL.to_string())
}

pub struct Dispatcher {
    store: Arc<dyn TrackingStore>,
    sink: Arc<dyn NotificationSink>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn TrackingStore>, sink: Arc<dyn NotificationSink>) -> Self {
        Self { store, sink }
    }

    /// One record per subscription. Sink failures produce `failed` records;
    /// failures to persist a record are logged and skipped. No retries.
    pub async fn dispatch(
        &self,
        tracker: &Tracker,
        analysis: &AnalysisResult,
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationRecord>> {
        let subscriptions = self
            .store
            .list_subscriptions(&tracker.id)
            .await
            .with_context(|| format!("listing subscriptions for tracker {}", tracker.id))?;
        let reason = if analysis.triggered {
            NotificationReason::Trigger
        } else {
            NotificationReason::Scheduled
        };

        let mut records = Vec::with_capacity(subscriptions.len());
        for subscription in &subscriptions {
            let channel = select_channel(tracker, subscription);
            let status = match self.sink.deliver(tracker, subscription, &channel, analysis).await {
                Ok(()) => DeliveryStatus::Sent,
                Err(err) => {
                    warn!(
                        tracker_id = %tracker.id,
                        user_id = %subscription.user_id,
                        channel = %channel,
                        error = %err,
                        "notification delivery failed"
                    );
                    DeliveryStatus::Failed
                }
            };
            let record = NotificationRecord {
                id: Uuid::new_v4().to_string(),
                tracker_id: tracker.id.clone(),
                run_id: analysis.run_id.clone(),
                user_id: subscription.user_id.clone(),
                timestamp: now,
                channel,
                reason,
                status,
            };

            if let Err(err) = self.store.save_notification_record(&record).await {
                warn!(
                    tracker_id = %tracker.id,
                    user_id = %record.user_id,
                    error = %err,
                    "failed to persist notification record"
                );
                continue;
            }
            info!(
                action = "notification_sent",
                tracker_id = %tracker.id,
                run_id = %record.run_id,
                user_id = %record.user_id,
                channel = %record.channel,
                status = ?record.status,
                summary = %analysis.summary
            );
            records.push(record);
        }
        Ok(records)
    }
}
