//! HTTP transport for the tracker tool surface.
//!
//! `POST /tools/{name}` takes the tool arguments as a JSON body and the
//! caller id in the `x-user-id` header; identity is established upstream.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracker_sync::{
    build_service, maybe_build_scheduler, CallerIdentity, StorageBackend, SyncConfig, ToolRouter,
    TrackingError, TrackingService, TOOL_NAMES,
};

pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub tools: ToolRouter,
}

impl AppState {
    pub fn new(service: Arc<TrackingService>) -> Self {
        Self {
            tools: ToolRouter::new(service),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug)]
pub struct ApiError(TrackingError);

impl From<TrackingError> for ApiError {
    fn from(err: TrackingError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = match &self.0 {
            TrackingError::Internal(err) => {
                error!(error = %format!("{err:#}"), "tool call failed");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        (
            status,
            Json(ErrorResponse {
                error: ErrorBody {
                    code: self.0.code(),
                    message,
                },
            }),
        )
            .into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/tools", get(list_tools_handler))
        .route("/tools/{name}", post(call_tool_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "tool surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env(backend: StorageBackend) -> anyhow::Result<()> {
    let port: u16 = std::env::var("TRACKER_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = SyncConfig::from_env();
    let service = build_service(&config, backend).await?;
    let scheduler = maybe_build_scheduler(&config, service.clone()).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await?;
        info!(cron = %config.scheduler_cron, "scheduler started");
    }
    serve(AppState::new(service), port).await
}

async fn healthz_handler() -> Json<JsonValue> {
    Json(json!({ "status": "ok" }))
}

async fn list_tools_handler() -> Json<JsonValue> {
    Json(json!({ "tools": TOOL_NAMES }))
}

fn caller_from_headers(headers: &HeaderMap) -> Result<CallerIdentity, TrackingError> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(TrackingError::Unauthenticated)?;
    CallerIdentity::new(user_id)
}

fn parse_body(body: &Bytes) -> Result<JsonValue, TrackingError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(JsonValue::Null);
    }
    serde_json::from_slice(body)
        .map_err(|err| TrackingError::validation(format!("request body is not JSON: {err}")))
}

async fn call_tool_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<JsonValue>, ApiError> {
    let caller = caller_from_headers(&headers)?;
    let args = parse_body(&body)?;
    let output = state.tools.call(&caller, &name, args).await?;
    Ok(Json(output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use tracker_adapters::{
        AdapterError, CodeExecutionRequest, CodeExecutionResult, CodeExecutor, RawRecord,
        TargetFetcher,
    };
    use tracker_storage::MemoryTrackingStore;
    use tracker_sync::{AnalysisEngine, Dispatcher, RecordOnlySink, TemplateRegistry};

    struct OneRecord;

    #[async_trait]
    impl TargetFetcher for OneRecord {
        async fn fetch(
            &self,
            _target: &tracker_core::TrackerTarget,
        ) -> Result<Vec<RawRecord>, AdapterError> {
            Ok(vec![RawRecord::Http(json!({"id": "a", "price": 1}))])
        }
    }

    struct Offline;

    #[async_trait]
    impl CodeExecutor for Offline {
        async fn execute(
            &self,
            _request: CodeExecutionRequest,
        ) -> Result<CodeExecutionResult, AdapterError> {
            Err(AdapterError::Collaborator("failed to execute code: offline".into()))
        }
    }

    fn test_app() -> Router {
        let store = Arc::new(MemoryTrackingStore::new());
        let analysis =
            AnalysisEngine::new(Arc::new(TemplateRegistry::builtin()), Arc::new(Offline), None);
        let dispatcher = Dispatcher::new(store.clone(), Arc::new(RecordOnlySink));
        let service = TrackingService::new(store, Arc::new(OneRecord), analysis, dispatcher);
        app(AppState::new(Arc::new(service)))
    }

    fn tool_request(name: &str, user: Option<&str>, body: JsonValue) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/tools/{name}"))
            .header("content-type", "application/json");
        if let Some(user) = user {
            builder = builder.header(USER_ID_HEADER, user);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json_body(resp: Response) -> JsonValue {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn healthz_and_tool_listing() {
        let app = test_app();
        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await, json!({"status": "ok"}));

        let resp = app
            .oneshot(Request::builder().uri("/tools").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json_body(resp).await["tools"].as_array().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn create_then_run_over_http() {
        let app = test_app();
        let create = json!({
            "target": {"type": "httpSource", "url": "https://feeds.example.com/prices.json"},
            "mode": "irregular",
            "analysis": {"type": "computational"}
        });
        let resp = app
            .clone()
            .oneshot(tool_request("create_tracker", Some("alice"), create))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let created = json_body(resp).await;
        let id = created["trackerId"].as_str().unwrap().to_string();

        let resp = app
            .clone()
            .oneshot(tool_request("run_tracker_now", Some("alice"), json!({"trackerId": id})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let run = json_body(resp).await;
        assert_eq!(run["status"], "completed");
        assert_eq!(run["changes"], 1);

        let resp = app
            .oneshot(tool_request("run_tracker_now", Some("mallory"), json!({"trackerId": id})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(resp).await["error"]["code"], "forbidden");
    }

    #[tokio::test]
    async fn error_statuses_and_bodies() {
        let app = test_app();

        let resp = app
            .clone()
            .oneshot(tool_request("list_trackers", None, json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .clone()
            .oneshot(tool_request("create_tracker", Some("alice"), json!({"mode": "regular"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = json_body(resp).await;
        assert_eq!(body["error"]["code"], "validation_error");
        assert!(body["error"]["message"].as_str().unwrap().contains("missing field"));

        let resp = app
            .clone()
            .oneshot(tool_request(
                "get_tracker_status",
                Some("alice"),
                json!({"trackerId": "nope"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .clone()
            .oneshot(tool_request("drop_everything", Some("alice"), json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(resp).await["error"]["code"], "unknown_tool");

        let garbled = Request::builder()
            .method("POST")
            .uri("/tools/list_trackers")
            .header(USER_ID_HEADER, "alice")
            .body(Body::from("{not json"))
            .unwrap();
        let resp = app.oneshot(garbled).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn empty_body_means_no_arguments() {
        let app = test_app();
        let req = Request::builder()
            .method("POST")
            .uri("/tools/list_trackers")
            .header(USER_ID_HEADER, "alice")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await, json!({"trackers": []}));
    }
}
