//! Worker fleet.
//!
//! Workers are interchangeable consumers of the work queue. A message is one
//! page of one partition; its durable control flow lives in the database.
//! Two idempotency gates make redelivery harmless: a terminal partition
//! skips, and an offset that no longer matches `next_offset` skips. The
//! offset advance is a compare-and-swap and the successor message is only
//! enqueued after it, so a partition never has more than one live successor
//! that matches the database.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::adapters::{with_retry, AdapterRegistry, RetryPolicy, SupplierAdapter, SupplierQuery};
use crate::models::{
    Config, ConsolidateMessage, WorkDoneMessage, WorkDoneStatus, WorkMessage,
};
use crate::notify::{NotificationSink, PipelineEvent};
use crate::queue::{
    self, QueueStore, CONSOLIDATE, TYPE_CONSOLIDATE, TYPE_WORK_DONE, TYPE_WORK_ITEM, WORK_DONE,
    WORK_ITEMS,
};
use crate::rate_limit::{AcquireOutcome, GlobalRateLimiter};
use crate::store::ingest_db::RawUpsert;
use crate::store::IngestDb;

const IDLE_POLL: Duration = Duration::from_millis(200);

pub struct Worker {
    pub worker_id: String,
    db: IngestDb,
    queues: QueueStore,
    limiter: GlobalRateLimiter,
    registry: Arc<AdapterRegistry>,
    cfg: Arc<Config>,
    sink: Arc<dyn NotificationSink>,
}

impl Worker {
    pub fn new(
        worker_id: String,
        db: IngestDb,
        queues: QueueStore,
        limiter: GlobalRateLimiter,
        registry: Arc<AdapterRegistry>,
        cfg: Arc<Config>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            worker_id,
            db,
            queues,
            limiter,
            registry,
            cfg,
            sink,
        }
    }

    /// Receive-process-ack loop until shutdown.
    pub async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.worker_id, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let received = tokio::select! {
                _ = shutdown.changed() => break,
                r = self.queues.receive(WORK_ITEMS, self.cfg.queue_visibility_secs) => r,
            };
            match received {
                Ok(Some(lease)) => {
                    match queue::decode::<WorkMessage>(&lease, TYPE_WORK_ITEM) {
                        Ok(msg) => match self.process(&msg).await {
                            Ok(()) => {
                                let _ = self.queues.ack(&lease).await;
                            }
                            Err(e) => {
                                warn!(
                                    worker = %self.worker_id,
                                    run = %msg.run_id,
                                    partition = %msg.partition_id,
                                    error = %format!("{e:#}"),
                                    "work message failed; leaving for redelivery"
                                );
                                let _ = self.queues.abandon(&lease).await;
                            }
                        },
                        Err(e) => {
                            // Unparsable messages would loop forever; drop them.
                            warn!(error = %e, "dropping malformed work message");
                            let _ = self.queues.ack(&lease).await;
                        }
                    }
                }
                Ok(None) => sleep(IDLE_POLL).await,
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "work queue receive failed");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!(worker = %self.worker_id, "worker stopped");
    }

    /// Process one page of one partition. `Ok` acknowledges the message;
    /// `Err` abandons it for redelivery.
    pub async fn process(&self, msg: &WorkMessage) -> Result<()> {
        let now = Utc::now();
        self.db
            .ensure_worker_run(&msg.run_id, &msg.partition_id, &self.worker_id, now)
            .await?;
        let progress = self
            .db
            .read_or_create_progress(&msg.run_id, &msg.partition_id, msg.price_min, msg.price_max, now)
            .await?;

        // Idempotency gates: terminal partitions and stale offsets ack with
        // no side effects.
        if progress.is_terminal() {
            debug!(
                run = %msg.run_id,
                partition = %msg.partition_id,
                "partition already terminal; skipping"
            );
            return Ok(());
        }
        if msg.offset != progress.next_offset {
            debug!(
                run = %msg.run_id,
                partition = %msg.partition_id,
                message_offset = msg.offset,
                next_offset = progress.next_offset,
                "stale or duplicate message; skipping"
            );
            return Ok(());
        }

        let adapter = self.registry.resolve(&msg.feed_id)?;

        // Transient by design: a timed-out wait leaves the partition alone
        // and lets the queue redeliver the same offset.
        match self.limiter.acquire(&msg.feed_id).await? {
            AcquireOutcome::Acquired => {}
            AcquireOutcome::TimedOut => bail!("rate limiter wait timed out"),
        }

        match self.ingest_page(msg, adapter.as_ref()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail_partition(msg, &e).await;
                Err(e)
            }
        }
    }

    async fn ingest_page(&self, msg: &WorkMessage, adapter: &dyn SupplierAdapter) -> Result<()> {
        let query = SupplierQuery {
            price_min: Some(msg.price_min),
            price_max: Some(msg.price_max),
            updated_from: Some(msg.updated_from),
            updated_to: Some(msg.updated_to),
            shapes: msg.shapes.clone(),
            size_min_points: msg.size_min_points,
            size_max_points: msg.size_max_points,
        };
        let limit = msg.limit.min(adapter.metadata().max_page_size);

        let page = with_retry("worker_search", RetryPolicy::default(), || {
            adapter.search(&query, msg.offset, limit)
        })
        .await
        .context("supplier search failed")?;

        let now = Utc::now();

        // Empty page: someone may race us to completion; either way the
        // partition is done and this message acks.
        if page.items.is_empty() {
            if self
                .db
                .complete_partition(&msg.run_id, &msg.partition_id, msg.offset, now)
                .await?
            {
                self.complete_and_maybe_consolidate(msg, msg.offset).await?;
            }
            return Ok(());
        }

        let raw_rows: Vec<RawUpsert> = page
            .items
            .iter()
            .map(|item| RawUpsert {
                supplier_stone_id: item.supplier_stone_id.clone(),
                offer_id: item.offer_id.clone(),
                payload: item.payload.clone(),
                source_updated_at: item.source_updated_at,
                created_at: item.created_at,
            })
            .collect();
        let table = adapter.metadata().raw_table;
        self.db
            .upsert_raw_batch(table, &msg.feed_id, &msg.run_id, &raw_rows, now)
            .await
            .context("raw upsert failed")?;

        let page_len = page.items.len() as u64;
        let new_offset = msg.offset + page_len;

        if page_len == limit as u64 {
            // More pages may exist. The swap must precede the enqueue: after
            // a crash in between, redelivery of this message hits the
            // stale-offset gate and the DB state still authorizes exactly
            // one successor.
            if !self
                .db
                .advance_offset(&msg.run_id, &msg.partition_id, msg.offset, new_offset, now)
                .await?
            {
                // Another worker already advanced past us.
                return Ok(());
            }
            let successor = WorkMessage {
                offset: new_offset,
                ..msg.clone()
            };
            self.queues
                .send(WORK_ITEMS, TYPE_WORK_ITEM, &successor)
                .await
                .context("enqueue successor failed")?;
            return Ok(());
        }

        // Short page: final page of the partition.
        if self
            .db
            .complete_partition(&msg.run_id, &msg.partition_id, msg.offset, now)
            .await?
        {
            self.complete_and_maybe_consolidate(msg, new_offset).await?;
        }
        Ok(())
    }

    /// Done path: close the worker-run row, report, bump the run counter,
    /// and let the final worker fire consolidation.
    async fn complete_and_maybe_consolidate(
        &self,
        msg: &WorkMessage,
        records_processed: u64,
    ) -> Result<()> {
        let now = Utc::now();
        self.db
            .finish_worker_run(&msg.run_id, &msg.partition_id, "completed", records_processed, now)
            .await?;

        let done = WorkDoneMessage {
            run_id: msg.run_id.clone(),
            partition_id: msg.partition_id.clone(),
            worker_id: self.worker_id.clone(),
            records_processed,
            status: WorkDoneStatus::Completed,
            error: None,
        };
        self.queues.send(WORK_DONE, TYPE_WORK_DONE, &done).await?;

        let (completed, failed, expected) =
            self.db.record_worker_completion(&msg.run_id).await?;
        info!(
            run = %msg.run_id,
            partition = %msg.partition_id,
            completed,
            failed,
            expected,
            "partition completed"
        );
        self.maybe_finish_run(msg, completed, failed, expected).await
    }

    /// Failure path: terminal-mark the partition (once), report, and count
    /// the failure toward the run. Best-effort; the caller re-raises the
    /// original error regardless.
    async fn fail_partition(&self, msg: &WorkMessage, err: &anyhow::Error) {
        let now = Utc::now();
        match self
            .db
            .mark_partition_failed(&msg.run_id, &msg.partition_id, now)
            .await
        {
            Ok(true) => {
                let _ = self
                    .db
                    .finish_worker_run(&msg.run_id, &msg.partition_id, "failed", msg.offset, now)
                    .await;
                let done = WorkDoneMessage {
                    run_id: msg.run_id.clone(),
                    partition_id: msg.partition_id.clone(),
                    worker_id: self.worker_id.clone(),
                    records_processed: msg.offset,
                    status: WorkDoneStatus::Failed,
                    error: Some(format!("{err:#}")),
                };
                let _ = self.queues.send(WORK_DONE, TYPE_WORK_DONE, &done).await;

                match self.db.record_worker_failure(&msg.run_id).await {
                    Ok((completed, failed, expected)) => {
                        if let Err(e) =
                            self.maybe_finish_run(msg, completed, failed, expected).await
                        {
                            warn!(error = %format!("{e:#}"), "post-failure run bookkeeping failed");
                        }
                    }
                    Err(e) => {
                        warn!(error = %format!("{e:#}"), "failed to count worker failure");
                    }
                }
            }
            Ok(false) => {
                // Already terminal; a retry must not double-count.
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "failed to mark partition failed");
            }
        }
    }

    /// When the counters account for every partition, exactly one worker
    /// observes the final transition and emits the consolidation trigger
    /// (or the partial notification).
    async fn maybe_finish_run(
        &self,
        msg: &WorkMessage,
        completed: u32,
        failed: u32,
        expected: u32,
    ) -> Result<()> {
        if completed + failed != expected {
            return Ok(());
        }

        let force = self
            .db
            .get_run(&msg.run_id)
            .await?
            .map(|run| run.force)
            .unwrap_or(false);

        if failed == 0 || force {
            let trigger = ConsolidateMessage {
                run_id: msg.run_id.clone(),
                feed_id: msg.feed_id.clone(),
                trace_id: msg.trace_id.clone(),
                updated_to: msg.updated_to,
                force,
            };
            self.queues
                .send(CONSOLIDATE, TYPE_CONSOLIDATE, &trigger)
                .await?;
            info!(run = %msg.run_id, feed = %msg.feed_id, "consolidation triggered");
        } else {
            self.sink
                .notify(PipelineEvent::RunPartial {
                    feed_id: msg.feed_id.clone(),
                    run_id: msg.run_id.clone(),
                    failed_workers: failed,
                })
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::synthetic::SyntheticAdapter;
    use crate::models::{HeatmapTuning, RateLimitSettings, RunRecord, RunType};
    use crate::notify::LogSink;
    use crate::store::allowlist::raw_table_for;
    use chrono::TimeZone;
    use tempfile::tempdir;

    struct Harness {
        _dir: tempfile::TempDir,
        worker: Worker,
        db: IngestDb,
        queues: QueueStore,
        synthetic: Arc<SyntheticAdapter>,
    }

    fn harness(profile: &[(i64, i64, u64)]) -> Harness {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("facet.db");
        let db_path = db_path.to_str().unwrap();
        let db = IngestDb::new(db_path).unwrap();
        let queues = QueueStore::new(db_path).unwrap();
        let limiter = GlobalRateLimiter::new(
            db_path,
            RateLimitSettings {
                max_requests_per_window: 10_000,
                window_ms: 1_000,
                max_wait_ms: 1_000,
            },
        )
        .unwrap();

        let synthetic = Arc::new(
            SyntheticAdapter::with_profile(HeatmapTuning::default(), profile, 5).unwrap(),
        );
        let mut registry = AdapterRegistry::new();
        registry.register(synthetic.clone());

        let mut cfg = Config::from_env().unwrap();
        cfg.worker_page_size = 30;

        let worker = Worker::new(
            "worker-test".into(),
            db.clone(),
            queues.clone(),
            limiter,
            Arc::new(registry),
            Arc::new(cfg),
            Arc::new(LogSink::new(db.clone())),
        );
        Harness {
            _dir: dir,
            worker,
            db,
            queues,
            synthetic,
        }
    }

    fn message(run_id: &str, offset: u64, limit: u32) -> WorkMessage {
        WorkMessage {
            run_id: run_id.into(),
            trace_id: "trace".into(),
            feed_id: "demo".into(),
            partition_id: "partition-0".into(),
            price_min: 0,
            price_max: 1_000_000,
            updated_from: Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap(),
            updated_to: Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
            offset,
            limit,
            shapes: Vec::new(),
            size_min_points: None,
            size_max_points: None,
        }
    }

    async fn seed_run(db: &IngestDb, run_id: &str, expected: u32) {
        db.create_run(&RunRecord {
            run_id: run_id.into(),
            feed_id: "demo".into(),
            run_type: RunType::Full,
            force: false,
            expected_workers: expected,
            completed_workers: 0,
            failed_workers: 0,
            started_at: Utc::now(),
            completed_at: None,
            consolidation_started_at: None,
            updated_from: Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap(),
            updated_to: Utc::now(),
            records_estimated: 0,
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn duplicate_delivery_writes_once_and_enqueues_one_successor() {
        let h = harness(&[(0, 1_000, 100)]);
        seed_run(&h.db, "r1", 1).await;
        let msg = message("r1", 0, 30);

        h.worker.process(&msg).await.unwrap();
        // Second delivery of the same payload: the stale-offset gate skips.
        h.worker.process(&msg).await.unwrap();

        let progress = h.db.get_progress("r1", "partition-0").await.unwrap().unwrap();
        assert_eq!(progress.next_offset, 30);
        assert!(!progress.completed);

        let table = raw_table_for("demo").unwrap();
        assert_eq!(h.db.raw_counts(table).await.unwrap().total, 30);
        // Exactly one successor.
        assert_eq!(h.queues.depth(WORK_ITEMS).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn short_first_page_completes_without_successor() {
        let h = harness(&[(0, 1_000, 12)]);
        seed_run(&h.db, "r1", 1).await;

        h.worker.process(&message("r1", 0, 30)).await.unwrap();

        let progress = h.db.get_progress("r1", "partition-0").await.unwrap().unwrap();
        assert!(progress.completed);
        assert_eq!(h.queues.depth(WORK_ITEMS).await.unwrap(), 0);
        // Last worker in: consolidation trigger emitted.
        assert_eq!(h.queues.depth(CONSOLIDATE).await.unwrap(), 1);
        assert_eq!(h.queues.depth(WORK_DONE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn terminal_partition_skips_message() {
        let h = harness(&[(0, 1_000, 100)]);
        seed_run(&h.db, "r1", 1).await;
        let now = Utc::now();
        h.db.read_or_create_progress("r1", "partition-0", 0, 1_000, now)
            .await
            .unwrap();
        h.db.mark_partition_failed("r1", "partition-0", now)
            .await
            .unwrap();

        h.worker.process(&message("r1", 0, 30)).await.unwrap();

        let table = raw_table_for("demo").unwrap();
        assert_eq!(h.db.raw_counts(table).await.unwrap().total, 0);
        assert_eq!(h.queues.depth(WORK_ITEMS).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn exhausted_search_marks_partition_failed_once() {
        let h = harness(&[(0, 1_000, 100)]);
        seed_run(&h.db, "r1", 1).await;

        // More injected failures than the retry budget.
        h.synthetic.inject_search_failures(20);
        let msg = message("r1", 0, 30);
        assert!(h.worker.process(&msg).await.is_err());

        let progress = h.db.get_progress("r1", "partition-0").await.unwrap().unwrap();
        assert!(progress.failed);
        assert!(!progress.completed);
        let run = h.db.get_run("r1").await.unwrap().unwrap();
        assert_eq!(run.failed_workers, 1);
        // Failed WorkDone event emitted; no consolidate without force.
        assert_eq!(h.queues.depth(WORK_DONE).await.unwrap(), 1);
        assert_eq!(h.queues.depth(CONSOLIDATE).await.unwrap(), 0);

        // Redelivery hits the terminal gate: no double count.
        h.synthetic.inject_search_failures(0);
        h.worker.process(&msg).await.unwrap();
        let run = h.db.get_run("r1").await.unwrap().unwrap();
        assert_eq!(run.failed_workers, 1);
    }
}
