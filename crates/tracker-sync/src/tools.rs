//! JSON tool surface over [`TrackingService`] for an already-identified caller.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracker_core::{
    NotificationConfig, TrackerAnalysis, TrackerMode, TrackerSchedule, TrackerTarget,
    TrackerVisibility,
};

use crate::error::TrackingError;
use crate::service::{NewTracker, TrackingService};

pub const TOOL_NAMES: [&str; 6] = [
    "create_tracker",
    "list_trackers",
    "run_tracker_now",
    "get_tracker_status",
    "update_tracker_mode",
    "subscribe_shared_tracker",
];

/// Identity established upstream of the tool surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user_id: String,
}

impl CallerIdentity {
    pub fn new(user_id: impl Into<String>) -> Result<Self, TrackingError> {
        let user_id = user_id.into();
        if user_id.trim().is_empty() {
            return Err(TrackingError::Unauthenticated);
        }
        Ok(Self { user_id })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTrackerArgs {
    target: TrackerTarget,
    mode: TrackerMode,
    analysis: TrackerAnalysis,
    #[serde(default)]
    schedule: Option<TrackerSchedule>,
    #[serde(default)]
    visibility: Option<TrackerVisibility>,
    #[serde(default)]
    notification: Option<NotificationConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackerIdArgs {
    tracker_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateModeArgs {
    tracker_id: String,
    mode: TrackerMode,
}

fn parse_args<T: DeserializeOwned>(tool: &str, args: JsonValue) -> Result<T, TrackingError> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args)
        .map_err(|err| TrackingError::validation(format!("invalid arguments for {tool}: {err}")))
}

fn require_tracker_id(tracker_id: &str) -> Result<(), TrackingError> {
    if tracker_id.trim().is_empty() {
        return Err(TrackingError::validation("Missing trackerId"));
    }
    Ok(())
}

#[derive(Clone)]
pub struct ToolRouter {
    service: Arc<TrackingService>,
}

impl ToolRouter {
    pub fn new(service: Arc<TrackingService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<TrackingService> {
        &self.service
    }

    /// Dispatches `tool` with JSON `args`. Arguments are validated before any
    /// store access; ownership is checked before any mutation.
    pub async fn call(
        &self,
        caller: &CallerIdentity,
        tool: &str,
        args: JsonValue,
    ) -> Result<JsonValue, TrackingError> {
        let user_id = caller.user_id.as_str();
        match tool {
            "create_tracker" => {
                let args: CreateTrackerArgs = parse_args(tool, args)?;
                let tracker = self
                    .service
                    .create_tracker(
                        user_id,
                        NewTracker {
                            target: args.target,
                            mode: args.mode,
                            analysis: args.analysis,
                            schedule: args.schedule,
                            visibility: args.visibility,
                            notification: args.notification,
                        },
                    )
                    .await?;
                Ok(json!({ "trackerId": tracker.id, "status": "created" }))
            }
            "list_trackers" => {
                let trackers = self.service.list_trackers(user_id).await?;
                Ok(json!({ "trackers": trackers }))
            }
            "run_tracker_now" => {
                let args: TrackerIdArgs = parse_args(tool, args)?;
                require_tracker_id(&args.tracker_id)?;
                self.service.get_owned_tracker(user_id, &args.tracker_id).await?;
                let run = self.service.run_tracker_once(&args.tracker_id).await?;
                Ok(json!({
                    "runId": run.id,
                    "status": run.status.as_str(),
                    "changes": run.change_events.len(),
                }))
            }
            "get_tracker_status" => {
                let args: TrackerIdArgs = parse_args(tool, args)?;
                require_tracker_id(&args.tracker_id)?;
                let status = self.service.tracker_status(user_id, &args.tracker_id).await?;
                Ok(json!({ "status": status.status.as_str(), "lastRun": status.last_run }))
            }
            "update_tracker_mode" => {
                let args: UpdateModeArgs = parse_args(tool, args)?;
                require_tracker_id(&args.tracker_id)?;
                let tracker = self
                    .service
                    .update_tracker_mode(user_id, &args.tracker_id, args.mode)
                    .await?;
                Ok(json!({ "status": "updated", "mode": tracker.mode }))
            }
            "subscribe_shared_tracker" => {
                let args: TrackerIdArgs = parse_args(tool, args)?;
                require_tracker_id(&args.tracker_id)?;
                self.service.subscribe(user_id, &args.tracker_id).await?;
                Ok(json!({ "status": "subscribed" }))
            }
            other => Err(TrackingError::UnknownTool(other.to_string())),
        }
    }
}
