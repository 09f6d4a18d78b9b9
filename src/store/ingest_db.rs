//! Relational ingestion store.
//!
//! The database is the serialization point for the whole pipeline: partition
//! progress advances through compare-and-swap updates, run counters through
//! atomic increments, and raw-row claims through a single UPDATE over a
//! status-filtered subselect. Callers branch on affected-row counts; a
//! mismatch is a normal outcome, not an error.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::consolidator::rules::{PricingRule, RatingRule};
use crate::models::{
    CanonicalStone, ConsolidationStatus, PartitionProgress, RunRecord, RunType, Shape, StoneStatus,
};
use crate::store::allowlist::{self, RawTable};

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_ts(v: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(v, 0).unwrap_or_default()
}

/// Fingerprint of a raw payload; the upsert only touches a row when this
/// changes.
pub fn payload_hash(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

/// One supplier item headed for a raw landing table.
#[derive(Debug, Clone)]
pub struct RawUpsert {
    pub supplier_stone_id: String,
    pub offer_id: String,
    pub payload: String,
    pub source_updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A raw row claimed for consolidation.
#[derive(Debug, Clone)]
pub struct ClaimedRaw {
    pub id: i64,
    pub supplier_stone_id: String,
    pub payload: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Raw table row counts by status, for stats and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawCounts {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub done: u64,
    pub failed: u64,
}

#[derive(Clone)]
pub struct IngestDb {
    conn: Arc<Mutex<Connection>>,
}

impl IngestDb {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open ingest db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "busy_timeout", 5_000).ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS run_metadata (
                run_id TEXT PRIMARY KEY,
                feed_id TEXT NOT NULL,
                run_type TEXT NOT NULL,
                force_consolidate INTEGER NOT NULL DEFAULT 0,
                expected_workers INTEGER NOT NULL,
                completed_workers INTEGER NOT NULL DEFAULT 0,
                failed_workers INTEGER NOT NULL DEFAULT 0,
                started_at INTEGER NOT NULL,
                completed_at INTEGER,
                consolidation_started_at INTEGER,
                updated_from INTEGER NOT NULL,
                updated_to INTEGER NOT NULL,
                records_estimated INTEGER NOT NULL DEFAULT 0,
                records_claimed INTEGER NOT NULL DEFAULT 0,
                records_upserted INTEGER NOT NULL DEFAULT 0,
                records_failed INTEGER NOT NULL DEFAULT 0,
                consolidation_duration_ms INTEGER
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_run_metadata_feed_started
             ON run_metadata(feed_id, started_at DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS worker_runs (
                run_id TEXT NOT NULL,
                partition_id TEXT NOT NULL,
                worker_id TEXT NOT NULL,
                status TEXT NOT NULL,
                records_processed INTEGER NOT NULL DEFAULT 0,
                started_at INTEGER NOT NULL,
                finished_at INTEGER,
                PRIMARY KEY (run_id, partition_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS partition_progress (
                run_id TEXT NOT NULL,
                partition_id TEXT NOT NULL,
                price_min INTEGER NOT NULL,
                price_max INTEGER NOT NULL,
                next_offset INTEGER NOT NULL DEFAULT 0,
                completed INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (run_id, partition_id)
            )",
            [],
        )?;

        for table in allowlist::all_raw_tables() {
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {t} (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        supplier_stone_id TEXT NOT NULL UNIQUE,
                        offer_id TEXT NOT NULL,
                        run_id TEXT NOT NULL,
                        feed_id TEXT NOT NULL,
                        payload TEXT,
                        payload_hash TEXT NOT NULL,
                        source_updated_at INTEGER NOT NULL,
                        created_at INTEGER NOT NULL,
                        ingested_at INTEGER NOT NULL,
                        consolidation_status TEXT NOT NULL DEFAULT 'pending',
                        claimed_at INTEGER,
                        claimed_by TEXT,
                        consolidated_at INTEGER
                    )",
                    t = table.as_str()
                ),
                [],
            )?;
            conn.execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS idx_{t}_status_created
                     ON {t}(consolidation_status, created_at)",
                    t = table.as_str()
                ),
                [],
            )?;
        }

        conn.execute(
            "CREATE TABLE IF NOT EXISTS canonical_stones (
                feed_id TEXT NOT NULL,
                supplier_stone_id TEXT NOT NULL,
                offer_id TEXT NOT NULL,
                shape TEXT NOT NULL,
                weight_points INTEGER NOT NULL,
                color TEXT NOT NULL,
                clarity TEXT NOT NULL,
                cut TEXT,
                lab TEXT,
                certificate TEXT,
                supplier_price_cents INTEGER NOT NULL,
                price_cents INTEGER NOT NULL,
                rating INTEGER NOT NULL,
                status TEXT NOT NULL,
                media_url TEXT,
                source_updated_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (feed_id, supplier_stone_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS pricing_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                feed_id TEXT,
                shape TEXT,
                weight_min_points INTEGER,
                weight_max_points INTEGER,
                markup_bps INTEGER NOT NULL,
                flat_fee_cents INTEGER NOT NULL DEFAULT 0,
                priority INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS rating_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                feed_id TEXT,
                shape TEXT,
                color TEXT,
                clarity TEXT,
                min_weight_points INTEGER,
                rating INTEGER NOT NULL,
                priority INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS dataset_versions (
                feed_id TEXT PRIMARY KEY,
                version INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS error_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                feed_id TEXT,
                run_id TEXT,
                component TEXT NOT NULL,
                message TEXT NOT NULL,
                detail TEXT,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    pub async fn create_run(&self, run: &RunRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO run_metadata
             (run_id, feed_id, run_type, force_consolidate, expected_workers,
              completed_workers, failed_workers, started_at, completed_at,
              consolidation_started_at, updated_from, updated_to, records_estimated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                &run.run_id,
                &run.feed_id,
                run.run_type.as_str(),
                run.force as i64,
                run.expected_workers as i64,
                run.completed_workers as i64,
                run.failed_workers as i64,
                ts(run.started_at),
                run.completed_at.map(ts),
                run.consolidation_started_at.map(ts),
                ts(run.updated_from),
                ts(run.updated_to),
                run.records_estimated as i64,
            ],
        )?;
        Ok(())
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT run_id, feed_id, run_type, force_consolidate, expected_workers,
                    completed_workers, failed_workers, started_at, completed_at,
                    consolidation_started_at, updated_from, updated_to, records_estimated
             FROM run_metadata WHERE run_id = ?1",
        )?;
        let run = stmt
            .query_row(params![run_id], row_to_run)
            .optional()?;
        Ok(run)
    }

    pub async fn list_recent_runs(&self, feed_id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let limit = limit.clamp(1, 500) as i64;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT run_id, feed_id, run_type, force_consolidate, expected_workers,
                    completed_workers, failed_workers, started_at, completed_at,
                    consolidation_started_at, updated_from, updated_to, records_estimated
             FROM run_metadata WHERE feed_id = ?1 ORDER BY started_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![feed_id, limit], row_to_run)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Atomically bump `completed_workers` and return the counters after the
    /// increment: `(completed, failed, expected)`.
    pub async fn record_worker_completion(&self, run_id: &str) -> Result<(u32, u32, u32)> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE run_metadata SET completed_workers = completed_workers + 1
             WHERE run_id = ?1",
            params![run_id],
        )?;
        let counters = tx.query_row(
            "SELECT completed_workers, failed_workers, expected_workers
             FROM run_metadata WHERE run_id = ?1",
            params![run_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? as u32,
                    row.get::<_, i64>(1)? as u32,
                    row.get::<_, i64>(2)? as u32,
                ))
            },
        )?;
        tx.commit()?;
        Ok(counters)
    }

    /// Atomically bump `failed_workers` and return the counters after the
    /// increment. Callers must gate on the partition's first failed
    /// transition so retried failures do not double-count.
    pub async fn record_worker_failure(&self, run_id: &str) -> Result<(u32, u32, u32)> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE run_metadata SET failed_workers = failed_workers + 1
             WHERE run_id = ?1",
            params![run_id],
        )?;
        let counters = tx.query_row(
            "SELECT completed_workers, failed_workers, expected_workers
             FROM run_metadata WHERE run_id = ?1",
            params![run_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? as u32,
                    row.get::<_, i64>(1)? as u32,
                    row.get::<_, i64>(2)? as u32,
                ))
            },
        )?;
        tx.commit()?;
        Ok(counters)
    }

    /// Set `completed_at` exactly once. Returns false when already set.
    pub async fn mark_run_completed(&self, run_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE run_metadata SET completed_at = ?2
             WHERE run_id = ?1 AND completed_at IS NULL",
            params![run_id, ts(at)],
        )?;
        Ok(n == 1)
    }

    pub async fn set_consolidation_started(&self, run_id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE run_metadata SET consolidation_started_at = ?2 WHERE run_id = ?1",
            params![run_id, ts(at)],
        )?;
        Ok(())
    }

    pub async fn record_consolidation_stats(
        &self,
        run_id: &str,
        claimed: u64,
        upserted: u64,
        failed: u64,
        duration_ms: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE run_metadata SET records_claimed = ?2, records_upserted = ?3,
                    records_failed = ?4, consolidation_duration_ms = ?5
             WHERE run_id = ?1",
            params![run_id, claimed as i64, upserted as i64, failed as i64, duration_ms],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Worker runs
    // ------------------------------------------------------------------

    pub async fn ensure_worker_run(
        &self,
        run_id: &str,
        partition_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO worker_runs
             (run_id, partition_id, worker_id, status, started_at)
             VALUES (?1, ?2, ?3, 'in_progress', ?4)",
            params![run_id, partition_id, worker_id, ts(now)],
        )?;
        Ok(())
    }

    pub async fn finish_worker_run(
        &self,
        run_id: &str,
        partition_id: &str,
        status: &str,
        records_processed: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE worker_runs SET status = ?3, records_processed = ?4, finished_at = ?5
             WHERE run_id = ?1 AND partition_id = ?2",
            params![run_id, partition_id, status, records_processed as i64, ts(now)],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Partition progress
    // ------------------------------------------------------------------

    pub async fn read_or_create_progress(
        &self,
        run_id: &str,
        partition_id: &str,
        price_min: i64,
        price_max: i64,
        now: DateTime<Utc>,
    ) -> Result<PartitionProgress> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO partition_progress
             (run_id, partition_id, price_min, price_max, next_offset, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![run_id, partition_id, price_min, price_max, ts(now)],
        )?;
        let mut stmt = conn.prepare_cached(
            "SELECT next_offset, completed, failed FROM partition_progress
             WHERE run_id = ?1 AND partition_id = ?2",
        )?;
        let progress = stmt.query_row(params![run_id, partition_id], |row| {
            Ok(PartitionProgress {
                run_id: run_id.to_string(),
                partition_id: partition_id.to_string(),
                next_offset: row.get::<_, i64>(0)? as u64,
                completed: row.get::<_, i64>(1)? != 0,
                failed: row.get::<_, i64>(2)? != 0,
            })
        })?;
        Ok(progress)
    }

    pub async fn get_progress(
        &self,
        run_id: &str,
        partition_id: &str,
    ) -> Result<Option<PartitionProgress>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT next_offset, completed, failed FROM partition_progress
             WHERE run_id = ?1 AND partition_id = ?2",
        )?;
        let progress = stmt
            .query_row(params![run_id, partition_id], |row| {
                Ok(PartitionProgress {
                    run_id: run_id.to_string(),
                    partition_id: partition_id.to_string(),
                    next_offset: row.get::<_, i64>(0)? as u64,
                    completed: row.get::<_, i64>(1)? != 0,
                    failed: row.get::<_, i64>(2)? != 0,
                })
            })
            .optional()?;
        Ok(progress)
    }

    /// CAS advance: `next_offset = to` only while `next_offset = from` and
    /// the partition is not terminal. Returns false when another worker got
    /// there first.
    pub async fn advance_offset(
        &self,
        run_id: &str,
        partition_id: &str,
        from: u64,
        to: u64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE partition_progress SET next_offset = ?4, updated_at = ?5
             WHERE run_id = ?1 AND partition_id = ?2 AND next_offset = ?3
               AND completed = 0 AND failed = 0",
            params![run_id, partition_id, from as i64, to as i64, ts(now)],
        )?;
        Ok(n == 1)
    }

    /// Terminal transition to `completed`, conditional on the offset still
    /// matching the message being processed.
    pub async fn complete_partition(
        &self,
        run_id: &str,
        partition_id: &str,
        expected_offset: u64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE partition_progress SET completed = 1, updated_at = ?4
             WHERE run_id = ?1 AND partition_id = ?2 AND next_offset = ?3
               AND completed = 0 AND failed = 0",
            params![run_id, partition_id, expected_offset as i64, ts(now)],
        )?;
        Ok(n == 1)
    }

    /// Terminal transition to `failed`. Returns true only on the first
    /// transition, which is the caller's license to bump `failed_workers`.
    pub async fn mark_partition_failed(
        &self,
        run_id: &str,
        partition_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE partition_progress SET failed = 1, updated_at = ?3
             WHERE run_id = ?1 AND partition_id = ?2 AND completed = 0 AND failed = 0",
            params![run_id, partition_id, ts(now)],
        )?;
        Ok(n == 1)
    }

    // ------------------------------------------------------------------
    // Raw landing tables
    // ------------------------------------------------------------------

    /// Bulk upsert by `supplier_stone_id`. An existing row is rewritten only
    /// when `payload_hash` differs, which also resets it to `pending` and
    /// clears any claim. Re-delivering the same page is a no-op.
    pub async fn upsert_raw_batch(
        &self,
        table: RawTable,
        feed_id: &str,
        run_id: &str,
        rows: &[RawUpsert],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let sql = format!(
                "INSERT INTO {t}
                 (supplier_stone_id, offer_id, run_id, feed_id, payload, payload_hash,
                  source_updated_at, created_at, ingested_at, consolidation_status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending')
                 ON CONFLICT(supplier_stone_id) DO UPDATE SET
                    offer_id = excluded.offer_id,
                    run_id = excluded.run_id,
                    payload = excluded.payload,
                    payload_hash = excluded.payload_hash,
                    source_updated_at = excluded.source_updated_at,
                    ingested_at = excluded.ingested_at,
                    consolidation_status = 'pending',
                    claimed_at = NULL,
                    claimed_by = NULL,
                    consolidated_at = NULL
                 WHERE excluded.payload_hash != payload_hash",
                t = table.as_str()
            );
            let mut stmt = tx.prepare_cached(&sql)?;
            for row in rows {
                stmt.execute(params![
                    &row.supplier_stone_id,
                    &row.offer_id,
                    run_id,
                    feed_id,
                    &row.payload,
                    payload_hash(&row.payload),
                    ts(row.source_updated_at),
                    ts(row.created_at),
                    ts(now),
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// Return `processing` rows whose claim is older than `older_than` to
    /// `pending`. Recovery path for consolidators that died mid-batch.
    pub async fn reset_stuck_claims(
        &self,
        table: RawTable,
        older_than: DateTime<Utc>,
    ) -> Result<usize> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            &format!(
                "UPDATE {t} SET consolidation_status = 'pending',
                        claimed_at = NULL, claimed_by = NULL
                 WHERE consolidation_status = 'processing' AND claimed_at < ?1",
                t = table.as_str()
            ),
            params![ts(older_than)],
        )?;
        Ok(n)
    }

    /// Claim up to `batch_size` pending rows for `instance_id`. The UPDATE
    /// over a status-filtered subselect is atomic, so two consolidators can
    /// never claim the same row.
    pub async fn claim_batch(
        &self,
        table: RawTable,
        instance_id: &str,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedRaw>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "UPDATE {t} SET consolidation_status = 'processing',
                    claimed_at = ?1, claimed_by = ?2
             WHERE id IN (
                SELECT id FROM {t}
                WHERE consolidation_status = 'pending'
                ORDER BY created_at ASC, id ASC
                LIMIT ?3
             )
             RETURNING id, supplier_stone_id, payload, created_at",
            t = table.as_str()
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(
            params![ts(now), instance_id, batch_size as i64],
            |row| {
                Ok(ClaimedRaw {
                    id: row.get(0)?,
                    supplier_stone_id: row.get(1)?,
                    payload: row.get(2)?,
                    created_at: from_ts(row.get(3)?),
                })
            },
        )?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        out.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(out)
    }

    pub async fn mark_raw_done(
        &self,
        table: RawTable,
        ids: &[i64],
        clear_payload: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            // Terminal states carry no claim: claimed_by is only ever
            // non-null while a row is processing.
            let sql = if clear_payload {
                format!(
                    "UPDATE {t} SET consolidation_status = 'done', consolidated_at = ?2,
                            claimed_at = NULL, claimed_by = NULL, payload = NULL
                     WHERE id = ?1",
                    t = table.as_str()
                )
            } else {
                format!(
                    "UPDATE {t} SET consolidation_status = 'done', consolidated_at = ?2,
                            claimed_at = NULL, claimed_by = NULL
                     WHERE id = ?1",
                    t = table.as_str()
                )
            };
            let mut stmt = tx.prepare_cached(&sql)?;
            for id in ids {
                stmt.execute(params![id, ts(now)])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Bad rows keep their payload for post-mortems.
    pub async fn mark_raw_failed(&self, table: RawTable, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let sql = format!(
                "UPDATE {t} SET consolidation_status = 'failed',
                        claimed_at = NULL, claimed_by = NULL
                 WHERE id = ?1",
                t = table.as_str()
            );
            let mut stmt = tx.prepare_cached(&sql)?;
            for id in ids {
                stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn raw_counts(&self, table: RawTable) -> Result<RawCounts> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT consolidation_status, COUNT(*) FROM {t} GROUP BY consolidation_status",
            t = table.as_str()
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        let mut counts = RawCounts::default();
        for r in rows {
            let (status, n) = r?;
            counts.total += n;
            match ConsolidationStatus::parse(&status) {
                Some(ConsolidationStatus::Pending) => counts.pending = n,
                Some(ConsolidationStatus::Processing) => counts.processing = n,
                Some(ConsolidationStatus::Done) => counts.done = n,
                Some(ConsolidationStatus::Failed) => counts.failed = n,
                None => {}
            }
        }
        Ok(counts)
    }

    // ------------------------------------------------------------------
    // Canonical
    // ------------------------------------------------------------------

    /// Upsert canonical rows keyed `(feed_id, supplier_stone_id)`. The write
    /// is skipped when `source_updated_at`, computed price and status are
    /// all unchanged. Returns the number of rows actually written.
    pub async fn upsert_canonical_batch(
        &self,
        stones: &[CanonicalStone],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let mut written = 0usize;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO canonical_stones
                 (feed_id, supplier_stone_id, offer_id, shape, weight_points, color,
                  clarity, cut, lab, certificate, supplier_price_cents, price_cents,
                  rating, status, media_url, source_updated_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                 ON CONFLICT(feed_id, supplier_stone_id) DO UPDATE SET
                    offer_id = excluded.offer_id,
                    shape = excluded.shape,
                    weight_points = excluded.weight_points,
                    color = excluded.color,
                    clarity = excluded.clarity,
                    cut = excluded.cut,
                    lab = excluded.lab,
                    certificate = excluded.certificate,
                    supplier_price_cents = excluded.supplier_price_cents,
                    price_cents = excluded.price_cents,
                    rating = excluded.rating,
                    status = excluded.status,
                    media_url = excluded.media_url,
                    source_updated_at = excluded.source_updated_at,
                    updated_at = excluded.updated_at
                 WHERE excluded.source_updated_at != source_updated_at
                    OR excluded.price_cents != price_cents
                    OR excluded.status != status",
            )?;
            for stone in stones {
                written += stmt.execute(params![
                    &stone.feed_id,
                    &stone.supplier_stone_id,
                    &stone.offer_id,
                    stone.shape.as_str(),
                    stone.weight_points as i64,
                    &stone.color,
                    &stone.clarity,
                    stone.cut.as_deref(),
                    stone.lab.as_deref(),
                    stone.certificate.as_deref(),
                    stone.supplier_price_cents,
                    stone.price_cents,
                    stone.rating as i64,
                    stone.status.as_str(),
                    stone.media_url.as_deref(),
                    ts(stone.source_updated_at),
                    ts(now),
                ])?;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    pub async fn canonical_count(&self, feed_id: &str) -> Result<u64> {
        let conn = self.conn.lock().await;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM canonical_stones WHERE feed_id = ?1",
            params![feed_id],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    pub async fn get_canonical(
        &self,
        feed_id: &str,
        supplier_stone_id: &str,
    ) -> Result<Option<CanonicalStone>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT feed_id, supplier_stone_id, offer_id, shape, weight_points, color,
                    clarity, cut, lab, certificate, supplier_price_cents, price_cents,
                    rating, status, media_url, source_updated_at
             FROM canonical_stones WHERE feed_id = ?1 AND supplier_stone_id = ?2",
        )?;
        let stone = stmt
            .query_row(params![feed_id, supplier_stone_id], |row| {
                let shape: String = row.get(3)?;
                let status: String = row.get(13)?;
                Ok(CanonicalStone {
                    feed_id: row.get(0)?,
                    supplier_stone_id: row.get(1)?,
                    offer_id: row.get(2)?,
                    shape: Shape::parse(&shape).unwrap_or(Shape::Round),
                    weight_points: row.get::<_, i64>(4)? as u32,
                    color: row.get(5)?,
                    clarity: row.get(6)?,
                    cut: row.get(7)?,
                    lab: row.get(8)?,
                    certificate: row.get(9)?,
                    supplier_price_cents: row.get(10)?,
                    price_cents: row.get(11)?,
                    rating: row.get::<_, i64>(12)? as i32,
                    status: StoneStatus::parse(&status).unwrap_or(StoneStatus::Available),
                    media_url: row.get(14)?,
                    source_updated_at: from_ts(row.get(15)?),
                })
            })
            .optional()?;
        Ok(stone)
    }

    // ------------------------------------------------------------------
    // Pricing / rating rules
    // ------------------------------------------------------------------

    pub async fn load_pricing_rules(&self, feed_id: &str) -> Result<Vec<PricingRule>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT shape, weight_min_points, weight_max_points, markup_bps,
                    flat_fee_cents, priority
             FROM pricing_rules
             WHERE feed_id IS NULL OR feed_id = ?1
             ORDER BY priority ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![feed_id], |row| {
            Ok(PricingRule {
                shape: row.get::<_, Option<String>>(0)?,
                weight_min_points: row.get::<_, Option<i64>>(1)?.map(|v| v as u32),
                weight_max_points: row.get::<_, Option<i64>>(2)?.map(|v| v as u32),
                markup_bps: row.get(3)?,
                flat_fee_cents: row.get(4)?,
                priority: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn load_rating_rules(&self, feed_id: &str) -> Result<Vec<RatingRule>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT shape, color, clarity, min_weight_points, rating, priority
             FROM rating_rules
             WHERE feed_id IS NULL OR feed_id = ?1
             ORDER BY priority ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![feed_id], |row| {
            Ok(RatingRule {
                shape: row.get::<_, Option<String>>(0)?,
                color: row.get::<_, Option<String>>(1)?,
                clarity: row.get::<_, Option<String>>(2)?,
                min_weight_points: row.get::<_, Option<i64>>(3)?.map(|v| v as u32),
                rating: row.get(4)?,
                priority: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn insert_pricing_rule(&self, feed_id: Option<&str>, rule: &PricingRule) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO pricing_rules
             (feed_id, shape, weight_min_points, weight_max_points, markup_bps,
              flat_fee_cents, priority)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                feed_id,
                rule.shape.as_deref(),
                rule.weight_min_points.map(|v| v as i64),
                rule.weight_max_points.map(|v| v as i64),
                rule.markup_bps,
                rule.flat_fee_cents,
                rule.priority,
            ],
        )?;
        Ok(())
    }

    pub async fn insert_rating_rule(&self, feed_id: Option<&str>, rule: &RatingRule) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO rating_rules
             (feed_id, shape, color, clarity, min_weight_points, rating, priority)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                feed_id,
                rule.shape.as_deref(),
                rule.color.as_deref(),
                rule.clarity.as_deref(),
                rule.min_weight_points.map(|v| v as i64),
                rule.rating,
                rule.priority,
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dataset versions / error logs
    // ------------------------------------------------------------------

    /// Monotone per-feed counter; downstream caches invalidate on change.
    pub async fn bump_dataset_version(&self, feed_id: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        let version: i64 = conn.query_row(
            "INSERT INTO dataset_versions (feed_id, version) VALUES (?1, 1)
             ON CONFLICT(feed_id) DO UPDATE SET version = version + 1
             RETURNING version",
            params![feed_id],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    pub async fn get_dataset_version(&self, feed_id: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        let version = conn
            .query_row(
                "SELECT version FROM dataset_versions WHERE feed_id = ?1",
                params![feed_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.unwrap_or(0))
    }

    pub async fn insert_error_log(
        &self,
        feed_id: Option<&str>,
        run_id: Option<&str>,
        component: &str,
        message: &str,
        detail: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO error_logs (feed_id, run_id, component, message, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![feed_id, run_id, component, message, detail, ts(now)],
        )?;
        Ok(())
    }

    pub async fn error_log_count(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM error_logs", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    let run_type: String = row.get(2)?;
    Ok(RunRecord {
        run_id: row.get(0)?,
        feed_id: row.get(1)?,
        run_type: RunType::parse(&run_type).unwrap_or(RunType::Full),
        force: row.get::<_, i64>(3)? != 0,
        expected_workers: row.get::<_, i64>(4)? as u32,
        completed_workers: row.get::<_, i64>(5)? as u32,
        failed_workers: row.get::<_, i64>(6)? as u32,
        started_at: from_ts(row.get(7)?),
        completed_at: row.get::<_, Option<i64>>(8)?.map(from_ts),
        consolidation_started_at: row.get::<_, Option<i64>>(9)?.map(from_ts),
        updated_from: from_ts(row.get(10)?),
        updated_to: from_ts(row.get(11)?),
        records_estimated: row.get::<_, i64>(12)? as u64,
    })
}
