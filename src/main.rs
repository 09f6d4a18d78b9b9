//! Facet ingestion service.
//!
//! Runs the worker fleet and the consolidator(s) against the shared durable
//! queues. Runs are triggered out-of-band (see `facet-scheduler`), or at
//! boot via `FACET_TRIGGER_ON_START` for the dev loop.

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use facet_backend::adapters::AdapterRegistry;
use facet_backend::consolidator::rules::{default_pricing_rules, default_rating_rules};
use facet_backend::consolidator::Consolidator;
use facet_backend::models::{Config, RunType};
use facet_backend::notify::LogSink;
use facet_backend::queue::QueueStore;
use facet_backend::rate_limit::GlobalRateLimiter;
use facet_backend::scheduler::Scheduler;
use facet_backend::store::{IngestDb, WatermarkStore};
use facet_backend::worker::Worker;

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cfg = Arc::new(Config::from_env().context("configuration error")?);
    info!(
        db = %cfg.database_path,
        workers = cfg.worker_count,
        consolidators = cfg.consolidator_count,
        "facet ingestion service starting"
    );

    let db = IngestDb::new(&cfg.database_path).context("open ingest store")?;
    let queues = QueueStore::new(&cfg.database_path).context("open queues")?;
    let limiter = GlobalRateLimiter::new(&cfg.database_path, cfg.rate_limit.clone())
        .context("open rate limiter")?;
    let watermarks = WatermarkStore::new(&cfg.watermark_dir).context("open watermark store")?;
    let registry = Arc::new(AdapterRegistry::from_env(&cfg.heatmap).context("build adapters")?);
    info!(feeds = ?registry.feed_ids(), "adapters registered");

    seed_rules_if_empty(&db).await?;

    let sink = Arc::new(LogSink::new(db.clone()));
    let scheduler = Arc::new(Scheduler::new(
        db.clone(),
        queues.clone(),
        watermarks.clone(),
        registry.clone(),
        cfg.clone(),
        sink.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    for i in 0..cfg.worker_count {
        let worker = Arc::new(Worker::new(
            format!("worker-{i}"),
            db.clone(),
            queues.clone(),
            limiter.clone(),
            registry.clone(),
            cfg.clone(),
            sink.clone(),
        ));
        handles.push(tokio::spawn(worker.run_loop(shutdown_rx.clone())));
    }

    for i in 0..cfg.consolidator_count {
        let consolidator = Arc::new(Consolidator::new(
            format!("consolidator-{i}"),
            db.clone(),
            queues.clone(),
            watermarks.clone(),
            registry.clone(),
            cfg.clone(),
            sink.clone(),
            Some(scheduler.clone() as Arc<dyn facet_backend::scheduler::ChainTrigger>),
        ));
        handles.push(tokio::spawn(consolidator.run_loop(shutdown_rx.clone())));
    }

    // Dev convenience: kick a run at boot when asked.
    if let Ok(feed) = std::env::var("FACET_TRIGGER_ON_START") {
        let run_type = std::env::var("FACET_TRIGGER_RUN_TYPE")
            .ok()
            .and_then(|v| RunType::parse(&v))
            .unwrap_or(RunType::Full);
        match scheduler.trigger(&feed, run_type, false).await {
            Ok(outcome) => info!(
                feed = %feed,
                run = %outcome.run_id,
                partitions = outcome.partitions,
                "boot trigger scheduled"
            ),
            Err(e) => warn!(feed = %feed, error = %format!("{e:#}"), "boot trigger failed"),
        }
    }

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutdown requested; draining in-flight work");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }
    info!("facet ingestion service stopped");
    Ok(())
}

async fn seed_rules_if_empty(db: &IngestDb) -> Result<()> {
    if db.load_pricing_rules("demo").await?.is_empty() {
        info!("no pricing rules configured; seeding defaults");
        for rule in default_pricing_rules() {
            db.insert_pricing_rule(None, &rule).await?;
        }
    }
    if db.load_rating_rules("demo").await?.is_empty() {
        info!("no rating rules configured; seeding defaults");
        for rule in default_rating_rules() {
            db.insert_rating_rule(None, &rule).await?;
        }
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "facet_backend=info,facet=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the manifest dir so
    // running with --manifest-path from elsewhere still finds the file.
    let _ = dotenv();
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
