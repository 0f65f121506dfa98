//! Tracker orchestration: configuration, templates, analysis, notification
//! dispatch, the run orchestrator and its scheduler, and the tool surface.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use tracker_adapters::{DataFetcher, HttpCodeExecutor, LlmClient, OpenAiChatClient};
use tracker_storage::{
    FeedCache, HttpFetcher, MemoryFeedCache, MemoryTrackingStore, PgFeedCache, PgTrackingStore,
    TrackingStore,
};

pub mod analysis;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod service;
pub mod templates;
pub mod tools;

pub use analysis::AnalysisEngine;
pub use config::SyncConfig;
pub use dispatch::{Dispatcher, NotificationSink, RecordOnlySink};
pub use error::TrackingError;
pub use service::{DueRunSummary, NewTracker, TrackerStatusView, TrackingService};
pub use templates::TemplateRegistry;
pub use tools::{CallerIdentity, ToolRouter, TOOL_NAMES};

pub const CRATE_NAME: &str = "tracker-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Postgres,
}

/// Wires stores, clients, templates and the orchestrator from `config`.
pub async fn build_service(
    config: &SyncConfig,
    backend: StorageBackend,
) -> Result<Arc<TrackingService>> {
    let http = Arc::new(HttpFetcher::new(config.http_client_config())?);

    let (store, feed_cache): (Arc<dyn TrackingStore>, Arc<dyn FeedCache>) = match backend {
        StorageBackend::Memory => (
            Arc::new(MemoryTrackingStore::new()),
            Arc::new(MemoryFeedCache::new()),
        ),
        StorageBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is not set")?;
            let pool = tracker_storage::postgres::connect(url).await?;
            (
                Arc::new(PgTrackingStore::new(pool.clone())),
                Arc::new(PgFeedCache::new(pool)),
            )
        }
    };

    let templates = Arc::new(TemplateRegistry::load(config.templates_path.as_deref())?);
    let executor = Arc::new(HttpCodeExecutor::new(
        http.clone(),
        config.python_execution_url.clone(),
        config.code_exec_timeout(),
    ));
    let llm = config
        .openai_config()
        .map(|openai| Arc::new(OpenAiChatClient::new(http.clone(), openai)) as Arc<dyn LlmClient>);
    if llm.is_none() {
        warn!("OPENAI_API_KEY not set; ai analysis is unavailable");
    }

    let fetcher = Arc::new(DataFetcher::new(http, feed_cache, config.fetcher_config()));
    let analysis = AnalysisEngine::new(templates, executor, llm);
    let dispatcher = Dispatcher::new(store.clone(), Arc::new(RecordOnlySink));

    Ok(Arc::new(
        TrackingService::new(store, fetcher, analysis, dispatcher)
            .with_max_concurrent_runs(config.max_concurrent_runs),
    ))
}

pub async fn run_due_once_from_env(backend: StorageBackend) -> Result<DueRunSummary> {
    let config = SyncConfig::from_env();
    let service = build_service(&config, backend).await?;
    service.run_due_trackers().await
}

/// Cron job that runs due trackers; `None` unless the scheduler is enabled.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    service: Arc<TrackingService>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = &config.scheduler_cron;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let service = service.clone();
        Box::pin(async move {
            match service.run_due_trackers().await {
                Ok(summary) => info!(
                    due = summary.due,
                    skipped = summary.skipped,
                    failed = summary.failed,
                    "scheduled run finished"
                ),
                Err(err) => warn!(error = %err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
