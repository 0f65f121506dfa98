//! Tracker lifecycle and the run orchestrator: fetch, normalize, diff,
//! snapshot, analyze, notify, record.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use tracker_adapters::{normalize_all, TargetFetcher};
use tracker_core::{
    compute_change_set, should_notify, validate_query_spec, NotificationConfig, RunStatus,
    ScheduleType, Snapshot, Subscription, SubscriptionRole, Tracker, TrackerAnalysis, TrackerMode,
    TrackerRun, TrackerSchedule, TrackerStatus, TrackerTarget, TrackerVisibility,
};
use tracker_storage::{KeyedLocks, TrackingStore};
use uuid::Uuid;

use crate::analysis::AnalysisEngine;
use crate::config::DEFAULT_MAX_CONCURRENT_RUNS;
use crate::dispatch::Dispatcher;
use crate::error::TrackingError;

/// Caller-supplied fields of a new tracker.
#[derive(Debug, Clone)]
pub struct NewTracker {
    pub target: TrackerTarget,
    pub mode: TrackerMode,
    pub analysis: TrackerAnalysis,
    pub schedule: Option<TrackerSchedule>,
    pub visibility: Option<TrackerVisibility>,
    pub notification: Option<NotificationConfig>,
}

impl NewTracker {
    pub fn new(target: TrackerTarget, mode: TrackerMode, analysis: TrackerAnalysis) -> Self {
        Self {
            target,
            mode,
            analysis,
            schedule: None,
            visibility: None,
            notification: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerStatusView {
    pub status: TrackerStatus,
    pub last_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DueRunSummary {
    pub considered: usize,
    pub due: usize,
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Rejects malformed targets and schedules before anything is stored.
pub fn validate_new_tracker(new: &NewTracker) -> Result<(), TrackingError> {
    let blank = |s: &str| s.trim().is_empty();
    match &new.target {
        TrackerTarget::PolymarketMarket { market_id } if blank(market_id) => {
            return Err(TrackingError::validation("target.marketId must not be empty"));
        }
        TrackerTarget::PolymarketEvent { event_id } if blank(event_id) => {
            return Err(TrackingError::validation("target.eventId must not be empty"));
        }
        TrackerTarget::HttpSource { url } | TrackerTarget::SubstackFeed { url } => {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(TrackingError::validation(format!(
                    "target.url must be an http(s) url: {url}"
                )));
            }
        }
        TrackerTarget::GoogleNewsRssSearch { .. } => {
            if let Some(spec) = new.target.effective_query_spec() {
                validate_query_spec(&spec)?;
            }
        }
        _ => {}
    }
    if let Some(schedule) = &new.schedule {
        let positive = schedule.interval_secs().is_some_and(|s| s > 0);
        if schedule.kind == ScheduleType::Interval && !positive {
            return Err(TrackingError::validation(format!(
                "schedule.value must be a positive number of seconds: {}",
                schedule.value
            )));
        }
    }
    Ok(())
}

pub struct TrackingService {
    store: Arc<dyn TrackingStore>,
    fetcher: Arc<dyn TargetFetcher>,
    analysis: AnalysisEngine,
    dispatcher: Dispatcher,
    run_locks: KeyedLocks,
    max_concurrent_runs: usize,
}

impl TrackingService {
    pub fn new(
        store: Arc<dyn TrackingStore>,
        fetcher: Arc<dyn TargetFetcher>,
        analysis: AnalysisEngine,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            store,
            fetcher,
            analysis,
            dispatcher,
            run_locks: KeyedLocks::new(),
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
        }
    }

    pub fn with_max_concurrent_runs(mut self, max: usize) -> Self {
        self.max_concurrent_runs = max.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn TrackingStore> {
        &self.store
    }

    /// Stores the tracker and subscribes its owner.
    pub async fn create_tracker(
        &self,
        user_id: &str,
        new: NewTracker,
    ) -> Result<Tracker, TrackingError> {
        validate_new_tracker(&new)?;
        let now = Utc::now();
        let mut tracker = Tracker::new(user_id, new.target, new.mode, new.analysis, now);
        if let Some(schedule) = new.schedule {
            tracker.schedule = schedule;
        }
        if let Some(visibility) = new.visibility {
            tracker.visibility = visibility;
        }
        if let Some(notification) = new.notification {
            tracker.notification = notification;
        }
        tracker.created_by = Some(user_id.to_string());

        self.store
            .create_tracker(&tracker)
            .await
            .with_context(|| format!("creating tracker {}", tracker.id))?;
        let owner = Subscription::new(&tracker.id, user_id, SubscriptionRole::Owner, now);
        self.store
            .add_subscription(&owner)
            .await
            .with_context(|| format!("subscribing owner to tracker {}", tracker.id))?;

        info!(
            action = "tracker_created",
            tracker_id = %tracker.id,
            user_id,
            target_type = tracker.target.type_name()
        );
        Ok(tracker)
    }

    /// Owned trackers first (oldest first), then trackers the user subscribes to.
    pub async fn list_trackers(&self, user_id: &str) -> Result<Vec<Tracker>, TrackingError> {
        let mut trackers = self
            .store
            .list_trackers(user_id)
            .await
            .context("listing owned trackers")?;
        let mut seen: HashSet<String> = trackers.iter().map(|t| t.id.clone()).collect();
        let subscriptions = self
            .store
            .list_subscriptions_for_user(user_id)
            .await
            .context("listing subscriptions")?;
        for subscription in subscriptions {
            if !seen.insert(subscription.tracker_id.clone()) {
                continue;
            }
            if let Some(tracker) = self
                .store
                .get_tracker(&subscription.tracker_id)
                .await
                .context("loading subscribed tracker")?
            {
                trackers.push(tracker);
            }
        }
        Ok(trackers)
    }

    pub async fn get_tracker(&self, tracker_id: &str) -> Result<Tracker, TrackingError> {
        self.store
            .get_tracker(tracker_id)
            .await
            .with_context(|| format!("loading tracker {tracker_id}"))?
            .ok_or_else(|| TrackingError::NotFound(tracker_id.to_string()))
    }

    /// Loads a tracker and checks that `user_id` owns it.
    pub async fn get_owned_tracker(
        &self,
        user_id: &str,
        tracker_id: &str,
    ) -> Result<Tracker, TrackingError> {
        let tracker = self.get_tracker(tracker_id).await?;
        if tracker.owner_id != user_id {
            return Err(TrackingError::Forbidden);
        }
        Ok(tracker)
    }

    pub async fn update_tracker(&self, mut tracker: Tracker) -> Result<Tracker, TrackingError> {
        tracker.updated_at = Utc::now();
        self.store
            .update_tracker(&tracker)
            .await
            .with_context(|| format!("updating tracker {}", tracker.id))?;
        Ok(tracker)
    }

    pub async fn update_tracker_mode(
        &self,
        user_id: &str,
        tracker_id: &str,
        mode: TrackerMode,
    ) -> Result<Tracker, TrackingError> {
        let mut tracker = self.get_owned_tracker(user_id, tracker_id).await?;
        tracker.mode = mode;
        let tracker = self.update_tracker(tracker).await?;
        info!(action = "tracker_mode_updated", tracker_id, user_id, mode = ?mode);
        Ok(tracker)
    }

    pub async fn tracker_status(
        &self,
        user_id: &str,
        tracker_id: &str,
    ) -> Result<TrackerStatusView, TrackingError> {
        let tracker = self.get_owned_tracker(user_id, tracker_id).await?;
        let last_run = self
            .store
            .get_last_run(tracker_id)
            .await
            .context("loading last run")?;
        Ok(TrackerStatusView {
            status: tracker.status,
            last_run: last_run.map(|run| run.timestamp),
        })
    }

    /// Viewer subscription to a shared tracker (or any tracker the caller owns).
    /// Existing subscriptions are left untouched.
    pub async fn subscribe(
        &self,
        user_id: &str,
        tracker_id: &str,
    ) -> Result<Subscription, TrackingError> {
        let tracker = self.get_tracker(tracker_id).await?;
        let is_owner = tracker.owner_id == user_id;
        if !is_owner && tracker.visibility != TrackerVisibility::Shared {
            return Err(TrackingError::Forbidden);
        }
        if let Some(existing) = self
            .store
            .get_subscription(tracker_id, user_id)
            .await
            .context("loading subscription")?
        {
            return Ok(existing);
        }

        let role = if is_owner {
            SubscriptionRole::Owner
        } else {
            SubscriptionRole::Viewer
        };
        let subscription = Subscription::new(tracker_id, user_id, role, Utc::now());
        self.store
            .add_subscription(&subscription)
            .await
            .context("saving subscription")?;
        info!(action = "tracker_subscribed", tracker_id, user_id);
        Ok(subscription)
    }

    /// Interval trackers are due when they never ran or their interval has
    /// elapsed. Cron schedules are never due here.
    pub async fn is_due(&self, tracker: &Tracker, now: DateTime<Utc>) -> anyhow::Result<bool> {
        if tracker.schedule.kind != ScheduleType::Interval {
            return Ok(false);
        }
        let Some(interval_secs) = tracker.schedule.interval_secs() else {
            warn!(
                tracker_id = %tracker.id,
                value = %tracker.schedule.value,
                "unparsable interval; never due"
            );
            return Ok(false);
        };
        let last_run = self
            .store
            .get_last_run(&tracker.id)
            .await
            .with_context(|| format!("loading last run of {}", tracker.id))?;
        Ok(match last_run {
            None => true,
            Some(run) => {
                let interval =
                    TimeDelta::try_seconds(interval_secs as i64).unwrap_or(TimeDelta::MAX);
                run.timestamp
                    .checked_add_signed(interval)
                    .map_or(true, |due_at| due_at <= now)
            }
        })
    }

    /// One end-to-end run. Runs of the same tracker are serialized.
    pub async fn run_tracker_once(&self, tracker_id: &str) -> Result<TrackerRun, TrackingError> {
        let _guard = self.run_locks.lock(tracker_id).await;
        let tracker = self.get_tracker(tracker_id).await?;
        self.run_locked(&tracker).await
    }

    /// Scheduled variant of [`Self::run_tracker_once`]. Due-ness is decided
    /// again under the tracker's lock, so a run finished by an overlapping
    /// batch makes this one a no-op (`Ok(None)`).
    pub async fn run_if_due(
        &self,
        tracker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TrackerRun>, TrackingError> {
        let _guard = self.run_locks.lock(tracker_id).await;
        let tracker = self.get_tracker(tracker_id).await?;
        if !tracker.is_active() || !self.is_due(&tracker, now).await? {
            debug!(tracker_id, "no longer due; skipping");
            return Ok(None);
        }
        self.run_locked(&tracker).await.map(Some)
    }

    /// Caller holds the tracker's run lock.
    async fn run_locked(&self, tracker: &Tracker) -> Result<TrackerRun, TrackingError> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("tracker_run", tracker_id = %tracker.id, run_id = %run_id);

        async {
            match self.execute_run(tracker, &run_id).await {
                Ok(run) => Ok(run),
                Err(err) => {
                    self.record_failed_run(tracker, &run_id, &err).await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute_run(
        &self,
        tracker: &Tracker,
        run_id: &str,
    ) -> Result<TrackerRun, TrackingError> {
        let last_snapshot = self
            .store
            .get_last_snapshot(&tracker.id)
            .await
            .context("loading last snapshot")?;

        let raw = self.fetcher.fetch(&tracker.target).await?;
        let now = Utc::now();
        let items = normalize_all(&raw, now);
        let changes = compute_change_set(last_snapshot.as_ref(), &items);

        let snapshot = Snapshot::capture(&tracker.id, items, now);
        self.store
            .save_snapshot(&snapshot)
            .await
            .context("saving snapshot")?;

        let analysis = self
            .analysis
            .analyze(tracker, &snapshot.items, &changes, run_id, now)
            .await;

        let notified = if should_notify(tracker, &changes, analysis.triggered) {
            self.dispatcher.dispatch(tracker, &analysis, now).await?.len()
        } else {
            0
        };

        let run = TrackerRun {
            id: run_id.to_string(),
            tracker_id: tracker.id.clone(),
            timestamp: now,
            snapshot_id: Some(snapshot.id.clone()),
            change_events: changes,
            analysis_result: Some(analysis),
            status: RunStatus::Completed,
            error: None,
        };
        self.store.save_run(&run).await.context("saving run")?;

        info!(
            target_type = tracker.target.type_name(),
            items = snapshot.items.len(),
            changes = run.change_events.len(),
            triggered = run.analysis_result.as_ref().is_some_and(|a| a.triggered),
            notified,
            "tracker run completed"
        );
        Ok(run)
    }

    async fn record_failed_run(&self, tracker: &Tracker, run_id: &str, err: &TrackingError) {
        warn!(error = %err, "tracker run failed");
        let run = TrackerRun {
            id: run_id.to_string(),
            tracker_id: tracker.id.clone(),
            timestamp: Utc::now(),
            snapshot_id: None,
            change_events: Vec::new(),
            analysis_result: None,
            status: RunStatus::Failed,
            error: Some(format!("{err:#}")),
        };
        if let Err(save_err) = self.store.save_run(&run).await {
            warn!(error = %save_err, "could not record failed run");
        }
    }

    /// Runs every due active tracker on a bounded pool. A failing tracker is
    /// logged and counted; it never stops the batch. Trackers that stopped
    /// being due before their lock was acquired count as `skipped`.
    pub async fn run_due_trackers(self: &Arc<Self>) -> anyhow::Result<DueRunSummary> {
        let now = Utc::now();
        let trackers = self
            .store
            .list_all_active_trackers()
            .await
            .context("listing active trackers")?;
        let mut summary = DueRunSummary {
            considered: trackers.len(),
            ..Default::default()
        };

        let pool = Arc::new(Semaphore::new(self.max_concurrent_runs));
        let mut runs = JoinSet::new();
        for tracker in trackers {
            match self.is_due(&tracker, now).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    warn!(tracker_id = %tracker.id, error = %err, "due check failed");
                    continue;
                }
            }
            summary.due += 1;

            let permit = pool.clone().acquire_owned().await.context("run pool closed")?;
            let service = Arc::clone(self);
            runs.spawn(async move {
                let _permit = permit;
                let result = service.run_if_due(&tracker.id, now).await;
                (tracker.id, result)
            });
        }

        while let Some(joined) = runs.join_next().await {
            match joined {
                Ok((_, Ok(Some(_)))) => summary.succeeded += 1,
                Ok((_, Ok(None))) => summary.skipped += 1,
                Ok((tracker_id, Err(err))) => {
                    warn!(tracker_id = %tracker_id, error = %err, "due tracker run failed");
                    summary.failed += 1;
                }
                Err(err) => {
                    warn!(error = %err, "tracker run task aborted");
                    summary.failed += 1;
                }
            }
        }

        info!(
            considered = summary.considered,
            due = summary.due,
            skipped = summary.skipped,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "due tracker batch finished"
        );
        Ok(summary)
    }
}
