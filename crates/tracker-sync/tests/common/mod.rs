#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tracker_adapters::{
    AdapterError, CodeExecutionRequest, CodeExecutionResult, CodeExecutor, RawRecord, TargetFetcher,
};
use tracker_core::TrackerTarget;
use tracker_storage::{MemoryTrackingStore, TrackingStore};
use tracker_sync::{
    AnalysisEngine, Dispatcher, RecordOnlySink, TemplateRegistry, ToolRouter, TrackingService,
};

/// Serves scripted JSON records per `httpSource` url.
#[derive(Default)]
pub struct ScriptedFetcher {
    records: Mutex<HashMap<String, Vec<JsonValue>>>,
    rate_limited: Mutex<HashSet<String>>,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub delay: Mutex<Option<Duration>>,
}

impl ScriptedFetcher {
    pub fn set(&self, url: &str, records: Vec<JsonValue>) {
        self.records.lock().unwrap().insert(url.to_string(), records);
    }

    pub fn rate_limit(&self, url: &str) {
        self.rate_limited.lock().unwrap().insert(url.to_string());
    }
}

#[async_trait]
impl TargetFetcher for ScriptedFetcher {
    async fn fetch(&self, target: &TrackerTarget) -> Result<Vec<RawRecord>, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let TrackerTarget::HttpSource { url } = target else {
            return Ok(Vec::new());
        };
        if self.rate_limited.lock().unwrap().contains(url) {
            return Err(AdapterError::RateLimited { status: 429 });
        }
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(RawRecord::Http)
            .collect())
    }
}

/// Code executor that answers every script with a fixed verdict.
pub struct FixedVerdict {
    pub triggered: bool,
    pub scripts: Mutex<Vec<String>>,
}

impl FixedVerdict {
    pub fn new(triggered: bool) -> Arc<Self> {
        Arc::new(Self {
            triggered,
            scripts: Mutex::default(),
        })
    }
}

#[async_trait]
impl CodeExecutor for FixedVerdict {
    async fn execute(
        &self,
        request: CodeExecutionRequest,
    ) -> Result<CodeExecutionResult, AdapterError> {
        self.scripts.lock().unwrap().push(request.code);
        let summary = if self.triggered { "Detected changes." } else { "No significant changes." };
        Ok(CodeExecutionResult {
            success: true,
            output: format!(
                "{}\n",
                json!({
                    "triggered": self.triggered,
                    "summary": summary,
                    "footnote": "Basic Threshold Analysis"
                })
            ),
            error: None,
            execution_time_ms: 5.0,
        })
    }
}

pub struct Harness {
    pub store: Arc<MemoryTrackingStore>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub executor: Arc<FixedVerdict>,
    pub service: Arc<TrackingService>,
}

impl Harness {
    pub fn new(triggered: bool) -> Self {
        let store = Arc::new(MemoryTrackingStore::new());
        let fetcher = Arc::new(ScriptedFetcher::default());
        let executor = FixedVerdict::new(triggered);
        let analysis = AnalysisEngine::new(
            Arc::new(TemplateRegistry::builtin()),
            executor.clone(),
            None,
        );
        let dispatcher = Dispatcher::new(store.clone(), Arc::new(RecordOnlySink));
        let service = Arc::new(
            TrackingService::new(store.clone(), fetcher.clone(), analysis, dispatcher)
                .with_max_concurrent_runs(2),
        );
        Self {
            store,
            fetcher,
            executor,
            service,
        }
    }

    pub fn router(&self) -> ToolRouter {
        ToolRouter::new(self.service.clone())
    }

    pub async fn notifications(&self, tracker_id: &str) -> usize {
        self.store
            .list_notification_records(tracker_id)
            .await
            .unwrap()
            .len()
    }
}

pub fn market(id: &str, price: f64) -> JsonValue {
    json!({"id": id, "question": format!("Market {id}?"), "price": price})
}
