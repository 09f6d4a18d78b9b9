//! Trigger CLI.
//!
//! `facet-scheduler --feed demo --run-type full` schedules one ingestion run
//! and exits. Exit code 0 on success, 1 on bad arguments or trigger failure;
//! the service (`facet`) does the actual work.

use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use facet_backend::adapters::AdapterRegistry;
use facet_backend::models::{Config, RunType};
use facet_backend::notify::LogSink;
use facet_backend::queue::QueueStore;
use facet_backend::scheduler::Scheduler;
use facet_backend::store::{IngestDb, WatermarkStore};

#[derive(Parser, Debug)]
#[command(name = "facet-scheduler", about = "Trigger an ingestion run for a feed")]
struct Args {
    /// Feed to ingest (must be allowlisted).
    #[arg(long)]
    feed: String,

    /// Run type: full | incremental.
    #[arg(long, default_value = "incremental")]
    run_type: String,

    /// Consolidate even if some partitions fail.
    #[arg(long)]
    force: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "facet_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    match run(args).await {
        Ok(()) => {}
        Err(e) => {
            eprintln!("trigger failed: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let run_type = RunType::parse(&args.run_type)
        .ok_or_else(|| anyhow::anyhow!("run type must be 'full' or 'incremental'"))?;

    let cfg = Arc::new(Config::from_env()?);
    let db = IngestDb::new(&cfg.database_path)?;
    let queues = QueueStore::new(&cfg.database_path)?;
    let watermarks = WatermarkStore::new(&cfg.watermark_dir)?;
    let registry = Arc::new(AdapterRegistry::from_env(&cfg.heatmap)?);
    let sink = Arc::new(LogSink::new(db.clone()));

    let scheduler = Scheduler::new(db, queues, watermarks, registry, cfg, sink);
    let outcome = scheduler.trigger(&args.feed, run_type, args.force).await?;

    println!(
        "run {} scheduled: {} partition(s), ~{} record(s)",
        outcome.run_id, outcome.partitions, outcome.estimated_total
    );
    Ok(())
}
