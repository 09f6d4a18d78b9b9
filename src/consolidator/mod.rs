//! Consolidator.
//!
//! Drains the consolidate queue. For each run it repeatedly claims batches
//! of pending raw rows (exclusive by construction: the claim is one UPDATE
//! over a status-filtered subselect), maps and prices them off-thread, and
//! upserts canonical rows with a no-op predicate. The watermark advances
//! only after every claimable row has been processed; an abort leaves the
//! claims to be recovered by the TTL reset on the next attempt.

pub mod rules;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use futures_util::future::join_all;
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::adapters::{AdapterRegistry, SupplierAdapter};
use crate::models::{CanonicalStone, Config, ConsolidateMessage, Watermark};
use crate::notify::{NotificationSink, PipelineEvent};
use crate::queue::{self, QueueStore, CONSOLIDATE, TYPE_CONSOLIDATE};
use crate::scheduler::ChainTrigger;
use crate::store::allowlist::RawTable;
use crate::store::ingest_db::ClaimedRaw;
use crate::store::{IngestDb, WatermarkStore};

use rules::{apply_pricing, apply_rating, PricingRule, RatingRule};

const IDLE_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Default, Clone, Copy)]
struct ConsolidationStats {
    claimed: u64,
    upserted: u64,
    failed: u64,
}

pub struct Consolidator {
    pub instance_id: String,
    db: IngestDb,
    queues: QueueStore,
    watermarks: WatermarkStore,
    registry: Arc<AdapterRegistry>,
    cfg: Arc<Config>,
    sink: Arc<dyn NotificationSink>,
    chain: Option<Arc<dyn ChainTrigger>>,
}

impl Consolidator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance_id: String,
        db: IngestDb,
        queues: QueueStore,
        watermarks: WatermarkStore,
        registry: Arc<AdapterRegistry>,
        cfg: Arc<Config>,
        sink: Arc<dyn NotificationSink>,
        chain: Option<Arc<dyn ChainTrigger>>,
    ) -> Self {
        Self {
            instance_id,
            db,
            queues,
            watermarks,
            registry,
            cfg,
            sink,
            chain,
        }
    }

    pub async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(instance = %self.instance_id, "consolidator started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let received = tokio::select! {
                _ = shutdown.changed() => break,
                r = self.queues.receive(CONSOLIDATE, self.cfg.queue_visibility_secs) => r,
            };
            match received {
                Ok(Some(lease)) => {
                    match queue::decode::<ConsolidateMessage>(&lease, TYPE_CONSOLIDATE) {
                        Ok(msg) => match self.handle(&msg).await {
                            Ok(()) => {
                                let _ = self.queues.ack(&lease).await;
                            }
                            Err(e) => {
                                warn!(
                                    instance = %self.instance_id,
                                    run = %msg.run_id,
                                    error = %format!("{e:#}"),
                                    "consolidation aborted; leaving for redelivery"
                                );
                                let _ = self.queues.abandon(&lease).await;
                            }
                        },
                        Err(e) => {
                            warn!(error = %e, "dropping malformed consolidate message");
                            let _ = self.queues.ack(&lease).await;
                        }
                    }
                }
                Ok(None) => sleep(IDLE_POLL).await,
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "consolidate queue receive failed");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!(instance = %self.instance_id, "consolidator stopped");
    }

    /// Consolidate one run. `Ok` acknowledges the trigger; `Err` abandons it
    /// without having advanced the watermark.
    pub async fn handle(&self, msg: &ConsolidateMessage) -> Result<()> {
        let Some(run) = self.db.get_run(&msg.run_id).await? else {
            warn!(run = %msg.run_id, "consolidate trigger for unknown run; dropping");
            return Ok(());
        };
        if run.failed_workers > 0 && !msg.force && !run.force {
            self.sink
                .notify(PipelineEvent::ConsolidationSkipped {
                    feed_id: msg.feed_id.clone(),
                    run_id: msg.run_id.clone(),
                    reason: format!(
                        "{} worker(s) failed and force is not set",
                        run.failed_workers
                    ),
                })
                .await;
            return Ok(());
        }

        let adapter = self.registry.resolve(&msg.feed_id)?;
        let table = adapter.metadata().raw_table;
        let started = std::time::Instant::now();
        let now = Utc::now();

        // Recover claims abandoned by a dead consolidator before taking new
        // ones.
        let cutoff = now - ChronoDuration::minutes(self.cfg.consolidator_claim_ttl_minutes);
        let recovered = self.db.reset_stuck_claims(table, cutoff).await?;
        if recovered > 0 {
            info!(
                instance = %self.instance_id,
                recovered,
                "reset stuck claims before consolidation"
            );
        }

        self.db.set_consolidation_started(&msg.run_id, now).await?;

        // Rules are loaded once and shared by every chunk of this run.
        let pricing = Arc::new(self.db.load_pricing_rules(&msg.feed_id).await?);
        let rating = Arc::new(self.db.load_rating_rules(&msg.feed_id).await?);

        let mut stats = ConsolidationStats::default();
        loop {
            let batch = self
                .db
                .claim_batch(
                    table,
                    &self.instance_id,
                    self.cfg.consolidator_batch_size,
                    Utc::now(),
                )
                .await?;
            if batch.is_empty() {
                break;
            }
            stats.claimed += batch.len() as u64;

            let (upserted, failed) = self
                .process_batch(batch, table, adapter.clone(), pricing.clone(), rating.clone())
                .await?;
            stats.upserted += upserted;
            stats.failed += failed;
        }

        let finished = Utc::now();
        self.db
            .record_consolidation_stats(
                &msg.run_id,
                stats.claimed,
                stats.upserted,
                stats.failed,
                started.elapsed().as_millis() as i64,
            )
            .await?;
        self.db.mark_run_completed(&msg.run_id, finished).await?;

        self.watermarks.save(
            &adapter.metadata().watermark_name,
            &Watermark {
                last_updated_at: run.updated_to,
                last_run_id: run.run_id.clone(),
                last_run_completed_at: finished,
            },
        )?;
        let version = self.db.bump_dataset_version(&msg.feed_id).await?;

        info!(
            instance = %self.instance_id,
            run = %msg.run_id,
            feed = %msg.feed_id,
            claimed = stats.claimed,
            upserted = stats.upserted,
            failed = stats.failed,
            dataset_version = version,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "consolidation complete"
        );
        self.sink
            .notify(PipelineEvent::RunConsolidated {
                feed_id: msg.feed_id.clone(),
                run_id: msg.run_id.clone(),
                records_upserted: stats.upserted,
                records_failed: stats.failed,
            })
            .await;

        // Chained feeds are fire-and-forget: a broken chain never fails the
        // consolidation that triggered it.
        if let Some(next_feed) = self.cfg.feed_chain.get(&msg.feed_id) {
            if let Some(chain) = &self.chain {
                if let Err(e) = chain.trigger_chained(next_feed).await {
                    warn!(
                        feed = %msg.feed_id,
                        next = %next_feed,
                        error = %format!("{e:#}"),
                        "feed chain trigger failed"
                    );
                }
            }
        }

        Ok(())
    }

    /// Fan a claimed batch out into sub-chunks, bounded by the configured
    /// concurrency. Returns `(upserted, failed)` row counts.
    async fn process_batch(
        &self,
        batch: Vec<ClaimedRaw>,
        table: RawTable,
        adapter: Arc<dyn SupplierAdapter>,
        pricing: Arc<Vec<PricingRule>>,
        rating: Arc<Vec<RatingRule>>,
    ) -> Result<(u64, u64)> {
        let chunk_size = self.cfg.consolidator_upsert_batch_size.max(1);
        let semaphore = Arc::new(Semaphore::new(self.cfg.consolidator_concurrency.max(1)));

        let chunks: Vec<Vec<ClaimedRaw>> =
            batch.chunks(chunk_size).map(|c| c.to_vec()).collect();
        let futures = chunks.into_iter().map(|chunk| {
            let semaphore = semaphore.clone();
            let adapter = adapter.clone();
            let pricing = pricing.clone();
            let rating = rating.clone();
            async move {
                let _permit = semaphore.acquire().await.context("semaphore closed")?;
                self.process_chunk(chunk, table, adapter, pricing, rating).await
            }
        });

        let mut upserted = 0u64;
        let mut failed = 0u64;
        for result in join_all(futures).await {
            let (u, f) = result?;
            upserted += u;
            failed += f;
        }
        Ok((upserted, failed))
    }

    async fn process_chunk(
        &self,
        chunk: Vec<ClaimedRaw>,
        table: RawTable,
        adapter: Arc<dyn SupplierAdapter>,
        pricing: Arc<Vec<PricingRule>>,
        rating: Arc<Vec<RatingRule>>,
    ) -> Result<(u64, u64)> {
        // Map phase is CPU only; keep it off the runtime threads.
        let (mapped, mut failed_ids) = tokio::task::spawn_blocking(move || {
            map_chunk(&chunk, adapter.as_ref(), &pricing, &rating)
        })
        .await
        .context("map phase panicked")?;

        // Write phase. A failed bulk write moves the whole sub-chunk to
        // failed rather than guessing which row broke it.
        let mut processed_ids: Vec<i64> = Vec::with_capacity(mapped.len());
        let stones: Vec<CanonicalStone> = mapped.iter().map(|(_, s)| s.clone()).collect();
        let upserted = if stones.is_empty() {
            0
        } else {
            match self.db.upsert_canonical_batch(&stones, Utc::now()).await {
                Ok(written) => {
                    processed_ids.extend(mapped.iter().map(|(id, _)| *id));
                    written as u64
                }
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "canonical upsert failed; failing sub-chunk");
                    failed_ids.extend(mapped.iter().map(|(id, _)| *id));
                    0
                }
            }
        };

        self.db
            .mark_raw_done(table, &processed_ids, self.cfg.clear_payload_on_done, Utc::now())
            .await?;
        self.db.mark_raw_failed(table, &failed_ids).await?;

        Ok((upserted, failed_ids.len() as u64))
    }
}

/// Map + price + rate every row of a chunk. Per-row failures are collected,
/// not propagated; one bad payload must not sink its neighbors.
fn map_chunk(
    chunk: &[ClaimedRaw],
    adapter: &dyn SupplierAdapter,
    pricing: &[PricingRule],
    rating: &[RatingRule],
) -> (Vec<(i64, CanonicalStone)>, Vec<i64>) {
    let feed_id = adapter.metadata().feed_id.clone();
    let results: Vec<Result<(i64, CanonicalStone), i64>> = chunk
        .par_iter()
        .map(|row| {
            let Some(payload) = row.payload.as_deref() else {
                return Err(row.id);
            };
            match adapter.map_raw(payload) {
                Ok(stone) => {
                    let price_cents = apply_pricing(&stone, pricing);
                    let quality = apply_rating(&stone, rating);
                    Ok((
                        row.id,
                        CanonicalStone {
                            feed_id: feed_id.clone(),
                            supplier_stone_id: stone.supplier_stone_id,
                            offer_id: stone.offer_id,
                            shape: stone.shape,
                            weight_points: stone.weight_points,
                            color: stone.color,
                            clarity: stone.clarity,
                            cut: stone.cut,
                            lab: stone.lab,
                            certificate: stone.certificate,
                            supplier_price_cents: stone.supplier_price_cents,
                            price_cents,
                            rating: quality,
                            status: stone.status,
                            media_url: stone.media_url,
                            source_updated_at: stone.source_updated_at,
                        },
                    ))
                }
                Err(e) => {
                    warn!(
                        stone = %row.supplier_stone_id,
                        error = %e,
                        "row mapping failed"
                    );
                    Err(row.id)
                }
            }
        })
        .collect();

    let mut mapped = Vec::with_capacity(results.len());
    let mut failed = Vec::new();
    for r in results {
        match r {
            Ok(pair) => mapped.push(pair),
            Err(id) => failed.push(id),
        }
    }
    (mapped, failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::synthetic::SyntheticAdapter;
    use crate::models::{HeatmapTuning, RunRecord, RunType};
    use crate::notify::LogSink;
    use crate::store::allowlist::raw_table_for;
    use crate::store::ingest_db::RawUpsert;
    use tempfile::tempdir;

    struct Harness {
        _dir: tempfile::TempDir,
        consolidator: Consolidator,
        db: IngestDb,
        watermarks: WatermarkStore,
        synthetic: Arc<SyntheticAdapter>,
    }

    fn harness() -> Harness {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("facet.db");
        let db_path = db_path.to_str().unwrap();
        let db = IngestDb::new(db_path).unwrap();
        let queues = QueueStore::new(db_path).unwrap();
        let watermarks = WatermarkStore::new(dir.path().join("watermarks")).unwrap();

        let synthetic = Arc::new(
            SyntheticAdapter::with_profile(HeatmapTuning::default(), &[(0, 100_000, 50)], 3)
                .unwrap(),
        );
        let mut registry = AdapterRegistry::new();
        registry.register(synthetic.clone());

        let mut cfg = Config::from_env().unwrap();
        cfg.consolidator_batch_size = 16;
        cfg.consolidator_upsert_batch_size = 5;
        cfg.consolidator_concurrency = 2;

        let consolidator = Consolidator::new(
            "consolidator-test".into(),
            db.clone(),
            queues,
            watermarks.clone(),
            Arc::new(registry),
            Arc::new(cfg),
            Arc::new(LogSink::new(db.clone())),
            None,
        );
        Harness {
            _dir: dir,
            consolidator,
            db,
            watermarks,
            synthetic,
        }
    }

    async fn seed_run(db: &IngestDb, run_id: &str, failed_workers: u32) -> RunRecord {
        let run = RunRecord {
            run_id: run_id.into(),
            feed_id: "demo".into(),
            run_type: RunType::Full,
            force: false,
            expected_workers: 1,
            completed_workers: 1,
            failed_workers,
            started_at: Utc::now(),
            completed_at: None,
            consolidation_started_at: None,
            updated_from: Utc::now() - ChronoDuration::days(30),
            updated_to: Utc::now(),
            records_estimated: 0,
        };
        db.create_run(&run).await.unwrap();
        run
    }

    async fn seed_raw_from_supplier(h: &Harness, run_id: &str, count: usize) {
        let page = h
            .synthetic
            .search(&crate::adapters::SupplierQuery::default(), 0, count as u32)
            .await
            .unwrap();
        let rows: Vec<RawUpsert> = page
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
        let table = raw_table_for("demo").unwrap();
        h.db.upsert_raw_batch(table, "demo", run_id, &rows, Utc::now())
            .await
            .unwrap();
    }

    fn trigger(run_id: &str) -> ConsolidateMessage {
        ConsolidateMessage {
            run_id: run_id.into(),
            feed_id: "demo".into(),
            trace_id: "trace".into(),
            updated_to: Utc::now(),
            force: false,
        }
    }

    #[tokio::test]
    async fn consolidates_all_claimed_rows() {
        let h = harness();
        let run = seed_run(&h.db, "r1", 0).await;
        seed_raw_from_supplier(&h, "r1", 37).await;

        h.consolidator.handle(&trigger("r1")).await.unwrap();

        assert_eq!(h.db.canonical_count("demo").await.unwrap(), 37);
        let table = raw_table_for("demo").unwrap();
        let counts = h.db.raw_counts(table).await.unwrap();
        assert_eq!(counts.done, 37);
        assert_eq!(counts.pending, 0);

        // Watermark advanced to the run's window and names the run.
        let mark = h.watermarks.load("demo").unwrap().unwrap();
        assert_eq!(mark.last_run_id, "r1");
        assert_eq!(
            mark.last_updated_at.timestamp(),
            run.updated_to.timestamp()
        );
        assert_eq!(h.db.get_dataset_version("demo").await.unwrap(), 1);

        let stored = h.db.get_run("r1").await.unwrap().unwrap();
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn reconsolidation_is_a_no_op() {
        let h = harness();
        seed_run(&h.db, "r1", 0).await;
        seed_raw_from_supplier(&h, "r1", 10).await;

        h.consolidator.handle(&trigger("r1")).await.unwrap();
        let mark_before = h.watermarks.load("demo").unwrap().unwrap();

        h.consolidator.handle(&trigger("r1")).await.unwrap();

        assert_eq!(h.db.canonical_count("demo").await.unwrap(), 10);
        let mark_after = h.watermarks.load("demo").unwrap().unwrap();
        assert_eq!(mark_before.last_run_id, mark_after.last_run_id);
        assert_eq!(mark_before.last_updated_at, mark_after.last_updated_at);
    }

    #[tokio::test]
    async fn failed_workers_skip_without_force() {
        let h = harness();
        seed_run(&h.db, "r1", 1).await;
        seed_raw_from_supplier(&h, "r1", 5).await;

        h.consolidator.handle(&trigger("r1")).await.unwrap();

        assert_eq!(h.db.canonical_count("demo").await.unwrap(), 0);
        assert!(h.watermarks.load("demo").unwrap().is_none());
        // Skip reason is persisted.
        assert_eq!(h.db.error_log_count().await.unwrap(), 1);

        // Force processes it anyway.
        let mut forced = trigger("r1");
        forced.force = true;
        h.consolidator.handle(&forced).await.unwrap();
        assert_eq!(h.db.canonical_count("demo").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn bad_rows_fail_without_sinking_the_batch() {
        let h = harness();
        seed_run(&h.db, "r1", 0).await;
        seed_raw_from_supplier(&h, "r1", 8).await;

        // One extra row with an unparsable payload.
        let table = raw_table_for("demo").unwrap();
        h.db.upsert_raw_batch(
            table,
            "demo",
            "r1",
            &[RawUpsert {
                supplier_stone_id: "broken-1".into(),
                offer_id: "broken-offer".into(),
                payload: "this is not json".into(),
                source_updated_at: Utc::now(),
                created_at: Utc::now(),
            }],
            Utc::now(),
        )
        .await
        .unwrap();

        h.consolidator.handle(&trigger("r1")).await.unwrap();

        assert_eq!(h.db.canonical_count("demo").await.unwrap(), 8);
        let counts = h.db.raw_counts(table).await.unwrap();
        assert_eq!(counts.done, 8);
        assert_eq!(counts.failed, 1);

        // The watermark still advances; bad input is not an abort.
        assert!(h.watermarks.load("demo").unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_run_is_dropped() {
        let h = harness();
        h.consolidator.handle(&trigger("ghost")).await.unwrap();
        assert_eq!(h.db.canonical_count("demo").await.unwrap(), 0);
    }
}
