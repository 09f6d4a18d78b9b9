//! Run scheduling.
//!
//! A trigger resolves the feed's adapter, computes the time window, runs the
//! heatmap partitioner, persists the run, and fans one initial work message
//! out per partition. The scheduler never consumes the work queue itself.
//! Anything that fails before the fan-out aborts the run with nothing
//! enqueued; a partial fan-out is tolerated because workers are idempotent.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::{AdapterRegistry, SupplierQuery};
use crate::heatmap::{build_partitions, scan_density};
use crate::models::{Config, RunRecord, RunType, Watermark, WorkMessage};
use crate::notify::{NotificationSink, PipelineEvent};
use crate::queue::{QueueStore, TYPE_WORK_ITEM, WORK_ITEMS};
use crate::store::{IngestDb, WatermarkStore};

/// Consolidators use this to kick the next feed in a chain without taking a
/// dependency on the scheduler's internals.
#[async_trait]
pub trait ChainTrigger: Send + Sync {
    async fn trigger_chained(&self, feed_id: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct TriggerOutcome {
    pub run_id: String,
    pub partitions: usize,
    pub estimated_total: u64,
}

pub struct Scheduler {
    db: IngestDb,
    queues: QueueStore,
    watermarks: WatermarkStore,
    registry: Arc<AdapterRegistry>,
    cfg: Arc<Config>,
    sink: Arc<dyn NotificationSink>,
}

impl Scheduler {
    pub fn new(
        db: IngestDb,
        queues: QueueStore,
        watermarks: WatermarkStore,
        registry: Arc<AdapterRegistry>,
        cfg: Arc<Config>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            db,
            queues,
            watermarks,
            registry,
            cfg,
            sink,
        }
    }

    pub async fn trigger(
        &self,
        feed_id: &str,
        run_type: RunType,
        force: bool,
    ) -> Result<TriggerOutcome> {
        let adapter = self.registry.resolve(feed_id)?;
        let meta = adapter.metadata().clone();
        let run_id = Uuid::new_v4().to_string();
        let trace_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let updated_from = match run_type {
            RunType::Full => self.cfg.full_run_start_date,
            RunType::Incremental => match self.watermarks.load(&meta.watermark_name)? {
                Some(mark) => {
                    mark.last_updated_at
                        - Duration::minutes(self.cfg.incremental_safety_buffer_minutes)
                }
                // First run for this feed: cover everything.
                None => self.cfg.full_run_start_date,
            },
        };
        let updated_to = now;

        let base = SupplierQuery {
            updated_from: Some(updated_from),
            updated_to: Some(updated_to),
            ..Default::default()
        };

        info!(
            feed = feed_id,
            run = %run_id,
            run_type = run_type.as_str(),
            from = %updated_from,
            to = %updated_to,
            "scheduling ingestion run"
        );

        let chunks = match scan_density(adapter.as_ref(), &base, &meta.heatmap).await {
            Ok(chunks) => chunks,
            Err(e) => {
                self.sink
                    .notify(PipelineEvent::RunFailed {
                        feed_id: feed_id.to_string(),
                        run_id: run_id.clone(),
                        message: format!("heatmap scan failed: {e:#}"),
                    })
                    .await;
                return Err(e).context("heatmap scan failed; run aborted");
            }
        };
        let plan = build_partitions(&chunks, &meta.heatmap);
        if plan.truncated > 0 {
            warn!(
                feed = feed_id,
                run = %run_id,
                truncated = plan.truncated,
                "record cap truncated the run; remainder covered by the next incremental run"
            );
        }

        // Empty supplier window: record a completed run and advance the
        // watermark so the next incremental window moves forward.
        if plan.partitions.is_empty() {
            let run = RunRecord {
                run_id: run_id.clone(),
                feed_id: feed_id.to_string(),
                run_type,
                force,
                expected_workers: 0,
                completed_workers: 0,
                failed_workers: 0,
                started_at: now,
                completed_at: Some(now),
                consolidation_started_at: None,
                updated_from,
                updated_to,
                records_estimated: 0,
            };
            self.db.create_run(&run).await?;
            self.watermarks.save(
                &meta.watermark_name,
                &Watermark {
                    last_updated_at: updated_to,
                    last_run_id: run_id.clone(),
                    last_run_completed_at: now,
                },
            )?;
            info!(feed = feed_id, run = %run_id, "no inventory in window; run complete");
            return Ok(TriggerOutcome {
                run_id,
                partitions: 0,
                estimated_total: 0,
            });
        }

        let run = RunRecord {
            run_id: run_id.clone(),
            feed_id: feed_id.to_string(),
            run_type,
            force,
            expected_workers: plan.partitions.len() as u32,
            completed_workers: 0,
            failed_workers: 0,
            started_at: now,
            completed_at: None,
            consolidation_started_at: None,
            updated_from,
            updated_to,
            records_estimated: plan.effective_total,
        };
        self.db.create_run(&run).await?;

        let page_size = self.cfg.worker_page_size.min(meta.max_page_size);
        for partition in &plan.partitions {
            let message = WorkMessage {
                run_id: run_id.clone(),
                trace_id: trace_id.clone(),
                feed_id: feed_id.to_string(),
                partition_id: partition.partition_id.clone(),
                price_min: partition.price_min,
                price_max: partition.price_max,
                updated_from,
                updated_to,
                offset: 0,
                limit: page_size,
                shapes: Vec::new(),
                size_min_points: None,
                size_max_points: None,
            };
            self.queues
                .send(WORK_ITEMS, TYPE_WORK_ITEM, &message)
                .await
                .with_context(|| {
                    format!("enqueue initial message for {}", partition.partition_id)
                })?;
        }

        info!(
            feed = feed_id,
            run = %run_id,
            partitions = plan.partitions.len(),
            estimated = plan.effective_total,
            "run scheduled"
        );

        Ok(TriggerOutcome {
            run_id,
            partitions: plan.partitions.len(),
            estimated_total: plan.effective_total,
        })
    }
}

#[async_trait]
impl ChainTrigger for Scheduler {
    async fn trigger_chained(&self, feed_id: &str) -> Result<()> {
        self.trigger(feed_id, RunType::Incremental, false)
            .await
            .map(|_| ())
    }
}
