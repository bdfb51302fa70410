use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use listsync_core::{RunStatus, TaskName};
use listsync_storage::{PgStore, RunFilter};
use listsync_sync::{
    build_scheduler, engine_from_config, RunLogCapture, RunOutcome, SyncConfig, TaskReport,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "listsync")]
#[command(about = "Listing reconciliation and marketplace sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Register a crawl target and optionally reconcile it right away.
    AddSource {
        url: String,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        reconcile: bool,
    },
    /// Crawl one source and refresh its change queues.
    Reconcile { source_id: i64 },
    /// Re-crawl every parsed source.
    Recheck,
    /// Fetch detail pages for queued ToCreate entries.
    DrainCreate {
        #[arg(long)]
        source: Option<i64>,
    },
    /// Remove remote listings for queued ToDelete entries.
    DrainDelete,
    /// Publish CREATED items on the marketplace.
    SyncCreated,
    /// Delete a source link and its remote listings.
    DeleteSource { source_id: i64 },
    /// List recent runs.
    Runs {
        #[arg(long)]
        task: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one run with its log trail.
    Run { run_id: i64 },
    /// Item counts per lifecycle status.
    Stats,
    /// Sources due for a recheck.
    Stale,
    /// Run the recurring jobs until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = SyncConfig::from_env();
    let capture = RunLogCapture::new(config.log_trail_cap);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "listsync=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(capture.layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
            Ok(())
        }
        command => run(command, &config, capture).await,
    }
}

async fn run(command: Commands, config: &SyncConfig, capture: RunLogCapture) -> Result<()> {
    let engine = engine_from_config(config).await?.with_log_capture(capture);
    match command {
        Commands::Migrate => {}
        Commands::AddSource {
            url,
            category,
            owner,
            reconcile,
        } => {
            let source = engine
                .register_source(&url, category.as_deref(), owner.as_deref())
                .await?;
            println!(
                "source {} registered: {} (category={}, status={})",
                source.id,
                source.url,
                source.category.as_deref().unwrap_or("-"),
                source.parse_status
            );
            if reconcile {
                report(TaskName::ReconcileSource, engine.reconcile_source(source.id).await?);
            }
        }
        Commands::Reconcile { source_id } => {
            report(TaskName::ReconcileSource, engine.reconcile_source(source_id).await?);
        }
        Commands::Recheck => {
            report(TaskName::RecheckSources, engine.recheck_parsed_sources().await?);
        }
        Commands::DrainCreate { source } => {
            report(TaskName::DrainCreate, engine.drain_create(source).await?);
        }
        Commands::DrainDelete => {
            report(TaskName::DrainDelete, engine.drain_delete().await?);
        }
        Commands::SyncCreated => {
            report(TaskName::SyncCreated, engine.sync_created().await?);
        }
        Commands::DeleteSource { source_id } => {
            report(TaskName::DeleteSource, engine.delete_source(source_id).await?);
        }
        Commands::Runs {
            task,
            status,
            limit,
        } => {
            let filter = RunFilter {
                task: task.as_deref().map(str::parse::<TaskName>).transpose()?,
                status: status.as_deref().map(str::parse::<RunStatus>).transpose()?,
                limit,
            };
            for run in engine.store().list_runs(&filter).await? {
                println!(
                    "{:>6}  {:<16} {:<8} {}  {}",
                    run.id,
                    run.task_name.as_str(),
                    run.status.as_str(),
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.message.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Run { run_id } => {
            let run = engine
                .store()
                .get_run(run_id)
                .await?
                .with_context(|| format!("run {run_id} not found"))?;
            println!(
                "run {} {} {} started={} finished={}",
                run.id,
                run.task_name,
                run.status,
                run.started_at.to_rfc3339(),
                run.finished_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string())
            );
            if let Some(message) = &run.message {
                println!("message: {message}");
            }
            if !run.details.is_empty() {
                println!("details: {}", serde_json_line(&run.details));
            }
            for entry in run.logs.iter() {
                println!("{} {:<5} {}", entry.t.to_rfc3339(), entry.level.as_str(), entry.msg);
            }
        }
        Commands::Stats => {
            for (status, count) in engine.item_status_counts().await? {
                println!("{:<14} {count}", status.as_str());
            }
        }
        Commands::Stale => {
            for source in engine.stale_sources().await? {
                println!(
                    "{:>6}  {}  last_processed={}",
                    source.id,
                    source.url,
                    source
                        .last_processed_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string())
                );
            }
        }
        Commands::Schedule => {
            let engine = Arc::new(engine);
            let Some(mut sched) = build_scheduler(engine, config).await? else {
                eprintln!("scheduler disabled; set LISTSYNC_SCHEDULER_ENABLED=true");
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            tracing::info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn report<T: TaskReport>(task: TaskName, outcome: RunOutcome<T>) {
    match outcome {
        RunOutcome::Completed { run_id, report } => {
            println!("{task} complete: run_id={run_id} {}", report.summary());
        }
        RunOutcome::Failed { run_id, message } => {
            eprintln!("{task} failed: run_id={run_id} {message}");
        }
    }
}

fn serde_json_line(details: &serde_json::Map<String, serde_json::Value>) -> String {
    details
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(" ")
}
