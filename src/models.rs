use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind of ingestion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Full,
    Incremental,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Full => "full",
            RunType::Incremental => "incremental",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(RunType::Full),
            "incremental" => Some(RunType::Incremental),
            _ => None,
        }
    }
}

/// Consolidation state of a raw row. Terminal states are `Done` and `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl ConsolidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsolidationStatus::Pending => "pending",
            ConsolidationStatus::Processing => "processing",
            ConsolidationStatus::Done => "done",
            ConsolidationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ConsolidationStatus::Pending),
            "processing" => Some(ConsolidationStatus::Processing),
            "done" => Some(ConsolidationStatus::Done),
            "failed" => Some(ConsolidationStatus::Failed),
            _ => None,
        }
    }
}

/// One ingestion attempt for one feed.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub feed_id: String,
    pub run_type: RunType,
    pub force: bool,
    pub expected_workers: u32,
    pub completed_workers: u32,
    pub failed_workers: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub consolidation_started_at: Option<DateTime<Utc>>,
    pub updated_from: DateTime<Utc>,
    pub updated_to: DateTime<Utc>,
    pub records_estimated: u64,
}

/// Per-partition bookkeeping inside a run. `completed` and `failed` are
/// mutually exclusive terminal states; once either is set, `next_offset`
/// is frozen.
#[derive(Debug, Clone)]
pub struct PartitionProgress {
    pub run_id: String,
    pub partition_id: String,
    pub next_offset: u64,
    pub completed: bool,
    pub failed: bool,
}

impl PartitionProgress {
    pub fn is_terminal(&self) -> bool {
        self.completed || self.failed
    }
}

/// One continuation of one partition: exactly one page of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkMessage {
    pub run_id: String,
    pub trace_id: String,
    pub feed_id: String,
    pub partition_id: String,
    pub price_min: i64,
    pub price_max: i64,
    pub updated_from: DateTime<Utc>,
    pub updated_to: DateTime<Utc>,
    pub offset: u64,
    pub limit: u32,
    #[serde(default)]
    pub shapes: Vec<String>,
    #[serde(default)]
    pub size_min_points: Option<u32>,
    #[serde(default)]
    pub size_max_points: Option<u32>,
}

/// Terminal status of one partition, reported on the `work-done` queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkDoneMessage {
    pub run_id: String,
    pub partition_id: String,
    pub worker_id: String,
    pub records_processed: u64,
    pub status: WorkDoneStatus,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkDoneStatus {
    Completed,
    Failed,
}

/// Trigger for the consolidator, emitted once per run by the last worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidateMessage {
    pub run_id: String,
    pub feed_id: String,
    pub trace_id: String,
    pub updated_to: DateTime<Utc>,
    #[serde(default)]
    pub force: bool,
}

/// Per-feed progress marker. `last_updated_at` advances only when a run's
/// claimed rows have all been consolidated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Watermark {
    pub last_updated_at: DateTime<Utc>,
    pub last_run_id: String,
    pub last_run_completed_at: DateTime<Utc>,
}

/// Diamond shapes recognized across suppliers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    Round,
    Princess,
    Cushion,
    Emerald,
    Oval,
    Radiant,
    Asscher,
    Marquise,
    Heart,
    Pear,
}

impl Shape {
    pub fn as_str(&self) -> &'static str {
        match self {
            Shape::Round => "round",
            Shape::Princess => "princess",
            Shape::Cushion => "cushion",
            Shape::Emerald => "emerald",
            Shape::Oval => "oval",
            Shape::Radiant => "radiant",
            Shape::Asscher => "asscher",
            Shape::Marquise => "marquise",
            Shape::Heart => "heart",
            Shape::Pear => "pear",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "round" => Some(Shape::Round),
            "princess" => Some(Shape::Princess),
            "cushion" => Some(Shape::Cushion),
            "emerald" => Some(Shape::Emerald),
            "oval" => Some(Shape::Oval),
            "radiant" => Some(Shape::Radiant),
            "asscher" => Some(Shape::Asscher),
            "marquise" => Some(Shape::Marquise),
            "heart" => Some(Shape::Heart),
            "pear" => Some(Shape::Pear),
            _ => None,
        }
    }
}

/// Availability of a canonical stone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoneStatus {
    Available,
    OnHold,
    Sold,
}

impl StoneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoneStatus::Available => "available",
            StoneStatus::OnHold => "on_hold",
            StoneStatus::Sold => "sold",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(StoneStatus::Available),
            "on_hold" => Some(StoneStatus::OnHold),
            "sold" => Some(StoneStatus::Sold),
            _ => None,
        }
    }
}

/// Canonical output row. All money is integer cents; weight is integer
/// points (1/100 carat).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalStone {
    pub feed_id: String,
    pub supplier_stone_id: String,
    pub offer_id: String,
    pub shape: Shape,
    pub weight_points: u32,
    pub color: String,
    pub clarity: String,
    pub cut: Option<String>,
    pub lab: Option<String>,
    pub certificate: Option<String>,
    pub supplier_price_cents: i64,
    pub price_cents: i64,
    pub rating: i32,
    pub status: StoneStatus,
    pub media_url: Option<String>,
    pub source_updated_at: DateTime<Utc>,
}

/// Tuning knobs for the heatmap scan and partition construction.
#[derive(Debug, Clone)]
pub struct HeatmapTuning {
    pub min_price: i64,
    pub max_price: i64,
    /// Below this price, items cluster; the scanner uses a fixed small step.
    pub dense_zone_threshold: i64,
    pub dense_zone_step: i64,
    pub initial_step: i64,
    pub target_records_per_chunk: u64,
    pub max_workers: u32,
    pub min_records_per_worker: u64,
    /// In-flight `get_count` probes per scan wave.
    pub concurrency: usize,
    pub use_two_pass_scan: bool,
    pub coarse_step: i64,
    /// Record cap for a single run. The truncated suffix is not re-enqueued
    /// within the run; it is re-covered by the next incremental run because
    /// the watermark only advances over what was scheduled.
    pub max_total_records: Option<u64>,
}

impl Default for HeatmapTuning {
    fn default() -> Self {
        Self {
            min_price: 0,
            max_price: 100_000_000,
            dense_zone_threshold: 200_000,
            dense_zone_step: 10_000,
            initial_step: 50_000,
            target_records_per_chunk: 5_000,
            max_workers: 10,
            min_records_per_worker: 500,
            concurrency: 4,
            use_two_pass_scan: false,
            coarse_step: 1_000_000,
            max_total_records: None,
        }
    }
}

/// Global (fleet-wide) supplier rate limit settings.
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub max_requests_per_window: u32,
    pub window_ms: i64,
    pub max_wait_ms: i64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests_per_window: 20,
            window_ms: 1_000,
            max_wait_ms: 30_000,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub watermark_dir: String,
    pub worker_count: usize,
    pub consolidator_count: usize,
    pub worker_page_size: u32,
    pub consolidator_batch_size: usize,
    pub consolidator_upsert_batch_size: usize,
    pub consolidator_concurrency: usize,
    pub consolidator_claim_ttl_minutes: i64,
    pub clear_payload_on_done: bool,
    pub queue_visibility_secs: i64,
    pub heatmap: HeatmapTuning,
    pub rate_limit: RateLimitSettings,
    pub full_run_start_date: DateTime<Utc>,
    pub incremental_safety_buffer_minutes: i64,
    /// feed id -> next feed id, triggered after successful consolidation.
    pub feed_chain: HashMap<String, String>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("FACET_DB_PATH").unwrap_or_else(|_| "./facet.db".to_string());
        let watermark_dir =
            std::env::var("FACET_WATERMARK_DIR").unwrap_or_else(|_| "./watermarks".to_string());

        let full_run_start_date = std::env::var("FACET_FULL_RUN_START_DATE")
            .ok()
            .map(|v| {
                DateTime::parse_from_rfc3339(&v)
                    .map(|d| d.with_timezone(&Utc))
                    .map_err(|e| anyhow::anyhow!("invalid FACET_FULL_RUN_START_DATE: {e}"))
            })
            .transpose()?
            .unwrap_or_else(|| Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap());

        // Chain misconfiguration is fatal: a bad map would silently break
        // downstream feeds.
        let feed_chain = match std::env::var("FACET_FEED_CHAIN") {
            Ok(raw) if !raw.trim().is_empty() => {
                serde_json::from_str::<HashMap<String, String>>(&raw)
                    .map_err(|e| anyhow::anyhow!("invalid FACET_FEED_CHAIN JSON: {e}"))?
            }
            _ => HashMap::new(),
        };

        let heatmap = HeatmapTuning {
            min_price: env_parse("FACET_HEATMAP_MIN_PRICE", 0),
            max_price: env_parse("FACET_HEATMAP_MAX_PRICE", 100_000_000),
            dense_zone_threshold: env_parse("FACET_HEATMAP_DENSE_ZONE_THRESHOLD", 200_000),
            dense_zone_step: env_parse("FACET_HEATMAP_DENSE_ZONE_STEP", 10_000),
            initial_step: env_parse("FACET_HEATMAP_INITIAL_STEP", 50_000),
            target_records_per_chunk: env_parse("FACET_HEATMAP_TARGET_RECORDS_PER_CHUNK", 5_000),
            max_workers: env_parse("FACET_HEATMAP_MAX_WORKERS", 10),
            min_records_per_worker: env_parse("FACET_HEATMAP_MIN_RECORDS_PER_WORKER", 500),
            concurrency: env_parse("FACET_HEATMAP_CONCURRENCY", 4),
            use_two_pass_scan: env_bool("FACET_HEATMAP_USE_TWO_PASS_SCAN", false),
            coarse_step: env_parse("FACET_HEATMAP_COARSE_STEP", 1_000_000),
            max_total_records: std::env::var("FACET_HEATMAP_MAX_TOTAL_RECORDS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok()),
        };

        let rate_limit = RateLimitSettings {
            max_requests_per_window: env_parse("FACET_RATE_LIMIT_MAX_REQUESTS", 20),
            window_ms: env_parse("FACET_RATE_LIMIT_WINDOW_MS", 1_000),
            max_wait_ms: env_parse("FACET_RATE_LIMIT_MAX_WAIT_MS", 30_000),
        };

        Ok(Self {
            database_path,
            watermark_dir,
            worker_count: env_parse("FACET_WORKER_COUNT", 4),
            consolidator_count: env_parse("FACET_CONSOLIDATOR_COUNT", 1),
            worker_page_size: env_parse("FACET_WORKER_PAGE_SIZE", 200),
            consolidator_batch_size: env_parse("FACET_CONSOLIDATOR_BATCH_SIZE", 500),
            consolidator_upsert_batch_size: env_parse("FACET_CONSOLIDATOR_UPSERT_BATCH_SIZE", 100),
            consolidator_concurrency: env_parse("FACET_CONSOLIDATOR_CONCURRENCY", 4),
            consolidator_claim_ttl_minutes: env_parse("FACET_CONSOLIDATOR_CLAIM_TTL_MINUTES", 30),
            clear_payload_on_done: env_bool("FACET_CLEAR_PAYLOAD_ON_DONE", true),
            queue_visibility_secs: env_parse("FACET_QUEUE_VISIBILITY_SECS", 300),
            heatmap,
            rate_limit,
            full_run_start_date,
            incremental_safety_buffer_minutes: env_parse(
                "FACET_INCREMENTAL_SAFETY_BUFFER_MINUTES",
                15,
            ),
            feed_chain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_type_round_trips() {
        assert_eq!(RunType::parse("full"), Some(RunType::Full));
        assert_eq!(RunType::parse("incremental"), Some(RunType::Incremental));
        assert_eq!(RunType::parse("nope"), None);
        assert_eq!(RunType::Full.as_str(), "full");
    }

    #[test]
    fn consolidation_status_round_trips() {
        for s in ["pending", "processing", "done", "failed"] {
            let parsed = ConsolidationStatus::parse(s).unwrap();
            assert_eq!(parsed.as_str(), s);
        }
    }

    #[test]
    fn work_message_serde_defaults() {
        let json = r#"{
            "run_id": "r1",
            "trace_id": "t1",
            "feed_id": "demo",
            "partition_id": "partition-0",
            "price_min": 0,
            "price_max": 100000,
            "updated_from": "2024-01-01T00:00:00Z",
            "updated_to": "2024-06-01T00:00:00Z",
            "offset": 0,
            "limit": 30
        }"#;
        let msg: WorkMessage = serde_json::from_str(json).unwrap();
        assert!(msg.shapes.is_empty());
        assert!(msg.size_min_points.is_none());
        assert_eq!(msg.limit, 30);
    }

    #[test]
    fn shape_parse_is_case_insensitive() {
        assert_eq!(Shape::parse("Round"), Some(Shape::Round));
        assert_eq!(Shape::parse("PEAR"), Some(Shape::Pear));
        assert_eq!(Shape::parse("trillion"), None);
    }
}
