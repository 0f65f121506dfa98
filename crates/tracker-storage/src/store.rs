//! Tracker document store surface and its in-memory implementation.

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracker_core::{NotificationRecord, Snapshot, Subscription, Tracker, TrackerRun};

/// Persistence for trackers, subscriptions, snapshots, runs and notification records.
///
/// "Last" run/snapshot means greatest timestamp; among equal timestamps the
/// most recently saved wins.
#[async_trait]
pub trait TrackingStore: Send + Sync {
    async fn create_tracker(&self, tracker: &Tracker) -> Result<()>;
    async fn get_tracker(&self, tracker_id: &str) -> Result<Option<Tracker>>;
    /// Replaces an existing tracker document. Fails if the id is unknown.
    async fn update_tracker(&self, tracker: &Tracker) -> Result<()>;
    /// Trackers owned by `user_id`, oldest first.
    async fn list_trackers(&self, user_id: &str) -> Result<Vec<Tracker>>;
    async fn list_all_active_trackers(&self) -> Result<Vec<Tracker>>;

    /// Inserts or replaces the `(tracker_id, user_id)` subscription.
    async fn add_subscription(&self, subscription: &Subscription) -> Result<()>;
    async fn get_subscription(&self, tracker_id: &str, user_id: &str)
        -> Result<Option<Subscription>>;
    async fn list_subscriptions(&self, tracker_id: &str) -> Result<Vec<Subscription>>;
    async fn list_subscriptions_for_user(&self, user_id: &str) -> Result<Vec<Subscription>>;

    async fn save_run(&self, run: &TrackerRun) -> Result<()>;
    async fn get_last_run(&self, tracker_id: &str) -> Result<Option<TrackerRun>>;

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()>;
    async fn get_last_snapshot(&self, tracker_id: &str) -> Result<Option<Snapshot>>;

    async fn save_notification_record(&self, record: &NotificationRecord) -> Result<()>;
    async fn list_notification_records(&self, tracker_id: &str) -> Result<Vec<NotificationRecord>>;
}

#[derive(Debug, Default)]
struct MemoryState {
    trackers: HashMap<String, Tracker>,
    subscriptions: Vec<Subscription>,
    runs: HashMap<String, Vec<TrackerRun>>,
    snapshots: HashMap<String, Vec<Snapshot>>,
    notifications: Vec<NotificationRecord>,
}

/// Process-local store used by tests and `serve --memory`.
#[derive(Debug, Default)]
pub struct MemoryTrackingStore {
    state: RwLock<MemoryState>,
}

impl MemoryTrackingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_by_creation(mut trackers: Vec<Tracker>) -> Vec<Tracker> {
    trackers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    trackers
}

#[async_trait]
impl TrackingStore for MemoryTrackingStore {
    async fn create_tracker(&self, tracker: &Tracker) -> Result<()> {
        let mut state = self.state.write().await;
        if state.trackers.contains_key(&tracker.id) {
            bail!("tracker {} already exists", tracker.id);
        }
        state.trackers.insert(tracker.id.clone(), tracker.clone());
        Ok(())
    }

    async fn get_tracker(&self, tracker_id: &str) -> Result<Option<Tracker>> {
        Ok(self.state.read().await.trackers.get(tracker_id).cloned())
    }

    async fn update_tracker(&self, tracker: &Tracker) -> Result<()> {
        let mut state = self.state.write().await;
        match state.trackers.get_mut(&tracker.id) {
            Some(existing) => {
                *existing = tracker.clone();
                Ok(())
            }
            None => bail!("tracker {} not found", tracker.id),
        }
    }

    async fn list_trackers(&self, user_id: &str) -> Result<Vec<Tracker>> {
        let state = self.state.read().await;
        let owned = state
            .trackers
            .values()
            .filter(|t| t.owner_id == user_id)
            .cloned()
            .collect();
        Ok(sorted_by_creation(owned))
    }

    async fn list_all_active_trackers(&self) -> Result<Vec<Tracker>> {
        let state = self.state.read().await;
        let active = state
            .trackers
            .values()
            .filter(|t| t.is_active())
            .cloned()
            .collect();
        Ok(sorted_by_creation(active))
    }

    async fn add_subscription(&self, subscription: &Subscription) -> Result<()> {
        let mut state = self.state.write().await;
        match state.subscriptions.iter_mut().find(|s| {
            s.tracker_id == subscription.tracker_id && s.user_id == subscription.user_id
        }) {
            Some(existing) => *existing = subscription.clone(),
            None => state.subscriptions.push(subscription.clone()),
        }
        Ok(())
    }

    async fn get_subscription(
        &self,
        tracker_id: &str,
        user_id: &str,
    ) -> Result<Option<Subscription>> {
        let state = self.state.read().await;
        Ok(state
            .subscriptions
            .iter()
            .find(|s| s.tracker_id == tracker_id && s.user_id == user_id)
            .cloned())
    }

    async fn list_subscriptions(&self, tracker_id: &str) -> Result<Vec<Subscription>> {
        let state = self.state.read().await;
        Ok(state
            .subscriptions
            .iter()
            .filter(|s| s.tracker_id == tracker_id)
            .cloned()
            .collect())
    }

    async fn list_subscriptions_for_user(&self, user_id: &str) -> Result<Vec<Subscription>> {
        let state = self.state.read().await;
        Ok(state
            .subscriptions
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn save_run(&self, run: &TrackerRun) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .runs
            .entry(run.tracker_id.clone())
            .or_default()
            .push(run.clone());
        Ok(())
    }

    async fn get_last_run(&self, tracker_id: &str) -> Result<Option<TrackerRun>> {
        let state = self.state.read().await;
        Ok(state
            .runs
            .get(tracker_id)
            .and_then(|runs| runs.iter().max_by_key(|r| r.timestamp))
            .cloned())
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .snapshots
            .entry(snapshot.tracker_id.clone())
            .or_default()
            .push(snapshot.clone());
        Ok(())
    }

    async fn get_last_snapshot(&self, tracker_id: &str) -> Result<Option<Snapshot>> {
        let state = self.state.read().await;
        Ok(state
            .snapshots
            .get(tracker_id)
            .and_then(|snapshots| snapshots.iter().max_by_key(|s| s.timestamp))
            .cloned())
    }

    async fn save_notification_record(&self, record: &NotificationRecord) -> Result<()> {
        self.state.write().await.notifications.push(record.clone());
        Ok(())
    }

    async fn list_notification_records(&self, tracker_id: &str) -> Result<Vec<NotificationRecord>> {
        let state = self.state.read().await;
        Ok(state
            .notifications
            .iter()
            .filter(|n| n.tracker_id == tracker_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use tracker_core::{
        RunStatus, SubscriptionRole, TrackerAnalysis, TrackerMode, TrackerStatus, TrackerTarget,
    };

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, minute, 0).unwrap()
    }

    fn tracker(owner: &str, at: DateTime<Utc>) -> Tracker {
        Tracker::new(
            owner,
            TrackerTarget::PolymarketMarket {
                market_id: "12345".into(),
            },
            TrackerMode::Regular,
            TrackerAnalysis::Ai {
                prompt_template_id: None,
                persona_refs: None,
                input_projection_rules: None,
            },
            at,
        )
    }

    fn run(tracker_id: &str, at: DateTime<Utc>, id: &str) -> TrackerRun {
        TrackerRun {
            id: id.into(),
            tracker_id: tracker_id.into(),
            timestamp: at,
            snapshot_id: None,
            change_events: vec![],
            analysis_result: None,
            status: RunStatus::Completed,
            error: None,
        }
    }

    #[tokio::test]
    async fn tracker_crud_and_active_listing() {
        let store = MemoryTrackingStore::new();
        let first = tracker("alice", ts(0));
        let mut second = tracker("alice", ts(5));
        let other = tracker("bob", ts(1));
        for t in [&second, &first, &other] {
            store.create_tracker(t).await.unwrap();
        }
        assert!(store.create_tracker(&first).await.is_err());

        let owned = store.list_trackers("alice").await.unwrap();
        assert_eq!(owned.iter().map(|t| &t.id).collect::<Vec<_>>(), vec![&first.id, &second.id]);

        second.status = TrackerStatus::Paused;
        store.update_tracker(&second).await.unwrap();
        let active = store.list_all_active_trackers().await.unwrap();
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|t| t.id != second.id));

        let ghost = tracker("carol", ts(2));
        assert!(store.update_tracker(&ghost).await.is_err());
    }

    #[tokio::test]
    async fn subscriptions_upsert_by_tracker_and_user() {
        let store = MemoryTrackingStore::new();
        let sub = Subscription::new("t1", "alice", SubscriptionRole::Viewer, ts(0));
        store.add_subscription(&sub).await.unwrap();
        store.add_subscription(&sub).await.unwrap();
        store
            .add_subscription(&Subscription::new("t2", "alice", SubscriptionRole::Owner, ts(1)))
            .await
            .unwrap();

        assert_eq!(store.list_subscriptions("t1").await.unwrap().len(), 1);
        assert_eq!(store.list_subscriptions_for_user("alice").await.unwrap().len(), 2);
        assert!(store.get_subscription("t1", "bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn last_run_is_latest_timestamp_with_ties_to_newest_save() {
        let store = MemoryTrackingStore::new();
        assert!(store.get_last_run("t1").await.unwrap().is_none());

        store.save_run(&run("t1", ts(10), "late")).await.unwrap();
        store.save_run(&run("t1", ts(0), "early")).await.unwrap();
        assert_eq!(store.get_last_run("t1").await.unwrap().unwrap().id, "late");

        store.save_run(&run("t1", ts(10), "tie")).await.unwrap();
        assert_eq!(store.get_last_run("t1").await.unwrap().unwrap().id, "tie");

        let older = Snapshot::capture("t1", vec![], ts(0));
        let newer = Snapshot::capture("t1", vec![], ts(0) + Duration::minutes(1));
        store.save_snapshot(&newer).await.unwrap();
        store.save_snapshot(&older).await.unwrap();
        assert_eq!(store.get_last_snapshot("t1").await.unwrap().unwrap().id, newer.id);
    }
}
