//! Core tracker domain model, change detection and notification policy.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub mod fingerprint;
pub mod news_query;

pub use fingerprint::{
    canonical_json, compute_change_set, fingerprint, fingerprint_value, sha256_hex, short_hash,
    snapshot_fingerprint,
};
pub use news_query::{
    build_feed_url, build_search_query, compute_query_key, resolve_edition, validate_query_spec,
    Edition, GoogleNewsQuerySpec, QuerySpecError, QueryTime, DEFAULT_EDITION, DEFAULT_FEED_BASE_URL,
    SUPPORTED_EDITIONS,
};

pub const CRATE_NAME: &str = "tracker-core";

pub type TrackerId = String;
pub type UserId = String;

/// Opaque key/value payload carried by a normalized item.
pub type ItemData = serde_json::Map<String, JsonValue>;

pub const DEFAULT_NOTIFICATION_CHANNEL: &str = "mcp_callback";
pub const DEFAULT_INTERVAL_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerVisibility {
    #[default]
    Personal,
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerMode {
    /// Notify on every run.
    Regular,
    /// Notify only when analysis triggers.
    Irregular,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerStatus {
    Active,
    Paused,
    Error,
}

impl TrackerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisType {
    Computational,
    Ai,
}

/// What external source a tracker observes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TrackerTarget {
    #[serde(rename_all = "camelCase")]
    PolymarketMarket { market_id: String },
    #[serde(rename_all = "camelCase")]
    PolymarketEvent { event_id: String },
    #[serde(rename_all = "camelCase")]
    HttpSource { url: String },
    #[serde(rename_all = "camelCase")]
    GoogleNewsRssSearch {
        query_spec: GoogleNewsQuerySpec,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        edition: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SubstackFeed { url: String },
    #[serde(rename_all = "camelCase")]
    Composite { dependency_tracker_ids: Vec<TrackerId> },
}

impl TrackerTarget {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::PolymarketMarket { .. } => "polymarketMarket",
            Self::PolymarketEvent { .. } => "polymarketEvent",
            Self::HttpSource { .. } => "httpSource",
            Self::GoogleNewsRssSearch { .. } => "googleNewsRssSearch",
            Self::SubstackFeed { .. } => "substackFeed",
            Self::Composite { .. } => "composite",
        }
    }

    /// Query spec with the target-level edition applied, for RSS search targets.
    pub fn effective_query_spec(&self) -> Option<GoogleNewsQuerySpec> {
        match self {
            Self::GoogleNewsRssSearch {
                query_spec,
                edition,
            } => {
                let mut spec = query_spec.clone();
                if let Some(edition) = edition.as_ref().filter(|e| !e.trim().is_empty()) {
                    spec.edition = Some(edition.clone());
                }
                Some(spec)
            }
            _ => None,
        }
    }
}

/// Analysis strategy evaluated over each run's change set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TrackerAnalysis {
    #[serde(rename_all = "camelCase")]
    Computational {
        #[serde(default)]
        threshold_config: BTreeMap<String, JsonValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        python_template_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Ai {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt_template_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        persona_refs: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_projection_rules: Option<Vec<String>>,
    },
}

impl TrackerAnalysis {
    pub fn analysis_type(&self) -> AnalysisType {
        match self {
            Self::Computational { .. } => AnalysisType::Computational,
            Self::Ai { .. } => AnalysisType::Ai,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    Interval,
    Cron,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerSchedule {
    #[serde(rename = "type")]
    pub kind: ScheduleType,
    /// Seconds for `interval`, a cron expression for `cron`.
    pub value: String,
}

impl TrackerSchedule {
    pub fn every_secs(secs: u64) -> Self {
        Self {
            kind: ScheduleType::Interval,
            value: secs.to_string(),
        }
    }

    /// Interval length in seconds; `None` for cron schedules or unparsable values.
    pub fn interval_secs(&self) -> Option<u64> {
        match self.kind {
            ScheduleType::Interval => self.value.trim().parse().ok(),
            ScheduleType::Cron => None,
        }
    }
}

impl Default for TrackerSchedule {
    fn default() -> Self {
        Self::every_secs(DEFAULT_INTERVAL_SECS)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: String,
    pub end: String,
    pub timezone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationConfig {
    pub channels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_day: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiet_hours: Option<QuietHours>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            channels: vec![DEFAULT_NOTIFICATION_CHANNEL.to_string()],
            rate_limit_per_day: None,
            quiet_hours: None,
        }
    }
}

/// Persistent watch configuration over one external target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tracker {
    pub id: TrackerId,
    pub owner_id: UserId,
    #[serde(default)]
    pub visibility: TrackerVisibility,
    pub target: TrackerTarget,
    pub mode: TrackerMode,
    pub analysis: TrackerAnalysis,
    #[serde(default)]
    pub schedule: TrackerSchedule,
    #[serde(default)]
    pub notification: NotificationConfig,
    pub status: TrackerStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_roles: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_schedule: Option<TrackerSchedule>,
}

impl Tracker {
    /// New active tracker with default schedule and notification settings.
    pub fn new(
        owner_id: impl Into<UserId>,
        target: TrackerTarget,
        mode: TrackerMode,
        analysis: TrackerAnalysis,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            visibility: TrackerVisibility::Personal,
            target,
            mode,
            analysis,
            schedule: TrackerSchedule::default(),
            notification: NotificationConfig::default(),
            status: TrackerStatus::Active,
            created_at: now,
            updated_at: now,
            created_by: None,
            allowed_roles: None,
            default_schedule: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TrackerStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionRole {
    Owner,
    Viewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryFrequency {
    Immediate,
    Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeliveryPrefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<DeliveryFrequency>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub tracker_id: TrackerId,
    pub user_id: UserId,
    pub role: SubscriptionRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_prefs: Option<DeliveryPrefs>,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new(
        tracker_id: impl Into<TrackerId>,
        user_id: impl Into<UserId>,
        role: SubscriptionRole,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            tracker_id: tracker_id.into(),
            user_id: user_id.into(),
            role,
            delivery_prefs: None,
            created_at: now,
        }
    }
}

/// Uniform item shape produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedItem {
    /// Stable across fetches.
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub data: ItemData,
    pub fingerprint: String,
}

impl NormalizedItem {
    /// Builds an item whose fingerprint is the full hash of `data`.
    pub fn from_data(id: impl Into<String>, timestamp: DateTime<Utc>, data: ItemData) -> Self {
        let fingerprint = fingerprint(&data);
        Self {
            id: id.into(),
            timestamp,
            data,
            fingerprint,
        }
    }
}

/// Full set of items observed by one run. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    pub tracker_id: TrackerId,
    pub timestamp: DateTime<Utc>,
    pub items: Vec<NormalizedItem>,
    pub fingerprint: String,
}

impl Snapshot {
    pub fn capture(
        tracker_id: impl Into<TrackerId>,
        items: Vec<NormalizedItem>,
        now: DateTime<Utc>,
    ) -> Self {
        let fingerprint = snapshot_fingerprint(&items);
        Self {
            id: Uuid::new_v4().to_string(),
            tracker_id: tracker_id.into(),
            timestamp: now,
            items,
            fingerprint,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub old_value: JsonValue,
    pub new_value: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

/// One delta between two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChangeEvent {
    #[serde(rename_all = "camelCase")]
    Added { item_id: String, item: NormalizedItem },
    #[serde(rename_all = "camelCase")]
    Removed { item_id: String, item: NormalizedItem },
    #[serde(rename_all = "camelCase")]
    Modified {
        item_id: String,
        diff: BTreeMap<String, FieldChange>,
    },
}

impl ChangeEvent {
    pub fn item_id(&self) -> &str {
        match self {
            Self::Added { item_id, .. }
            | Self::Removed { item_id, .. }
            | Self::Modified { item_id, .. } => item_id,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Added { .. } => ChangeKind::Added,
            Self::Removed { .. } => ChangeKind::Removed,
            Self::Modified { .. } => ChangeKind::Modified,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub tracker_id: TrackerId,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: AnalysisType,
    pub summary: String,
    pub triggered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footnote: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerRun {
    pub id: String,
    pub tracker_id: TrackerId,
    pub timestamp: DateTime<Utc>,
    pub snapshot_id: Option<String>,
    pub change_events: Vec<ChangeEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_result: Option<AnalysisResult>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationReason {
    Trigger,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: String,
    pub tracker_id: TrackerId,
    pub run_id: String,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub channel: String,
    pub reason: NotificationReason,
    pub status: DeliveryStatus,
}

/// Raw Google News RSS record, also the payload shared through the feed cache.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RssItem {
    pub guid: String,
    pub title: String,
    pub link: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub pub_date: String,
}

/// Feed cache entry shared by every tracker whose query renders to `query_key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedFeed {
    pub query_key: String,
    pub items: Vec<RssItem>,
    pub fingerprints: Vec<String>,
    pub fetched_at: DateTime<Utc>,
}

/// Decides whether a completed run notifies subscribers.
///
/// `changes` is accepted but not consulted: regular trackers notify on every
/// run even when nothing changed.
pub fn should_notify(
    tracker: &Tracker,
    _changes: &[ChangeEvent],
    analysis_triggered: bool,
) -> bool {
    if !tracker.is_active() {
        return false;
    }
    match tracker.mode {
        TrackerMode::Regular => true,
        TrackerMode::Irregular => analysis_triggered,
    }
}
