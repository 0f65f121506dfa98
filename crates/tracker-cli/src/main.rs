use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracker_sync::{build_service, maybe_build_scheduler, StorageBackend, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "tracker-cli")]
#[command(about = "Tracking agents pipeline command-line interface")]
struct Cli {
    /// Keep state in process memory instead of postgres.
    #[arg(long, global = true)]
    memory: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every active tracker that is due, once.
    RunDue,
    /// Run one tracker now, regardless of its schedule.
    Run { tracker_id: String },
    /// Run due trackers on the configured cron until interrupted.
    Schedule,
    /// Serve the tool surface over HTTP.
    Serve,
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let backend = if cli.memory {
        StorageBackend::Memory
    } else {
        StorageBackend::Postgres
    };

    match cli.command.unwrap_or(Commands::RunDue) {
        Commands::RunDue => {
            let summary = tracker_sync::run_due_once_from_env(backend).await?;
            println!(
                "due run complete: considered={} due={} skipped={} succeeded={} failed={}",
                summary.considered,
                summary.due,
                summary.skipped,
                summary.succeeded,
                summary.failed
            );
        }
        Commands::Run { tracker_id } => {
            let service = build_service(&SyncConfig::from_env(), backend).await?;
            let run = service.run_tracker_once(&tracker_id).await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        Commands::Schedule => {
            let mut config = SyncConfig::from_env();
            config.scheduler_enabled = true;
            let service = build_service(&config, backend).await?;
            let scheduler = maybe_build_scheduler(&config, service)
                .await?
                .context("scheduler was not built")?;
            scheduler.start().await?;
            info!(cron = %config.scheduler_cron, "scheduler started");
            tokio::signal::ctrl_c().await?;
            info!("shutting down scheduler");
        }
        Commands::Serve => {
            tracker_web::serve_from_env(backend).await?;
        }
        Commands::Migrate => {
            let url = SyncConfig::from_env()
                .database_url
                .context("DATABASE_URL is not set")?;
            let pool = tracker_storage::postgres::connect(&url).await?;
            tracker_storage::postgres::run_migrations(&pool).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
