//! Supplier adapters.
//!
//! Each external catalog is hidden behind [`SupplierAdapter`]: a count probe,
//! a deterministically ordered paged search, and a pure raw-to-canonical
//! mapper. The worker and consolidator never see supplier wire formats.

pub mod rest;
pub mod synthetic;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::models::{HeatmapTuning, Shape, StoneStatus};
use crate::store::allowlist::RawTable;

/// Flat query record; adapters translate it to their native form.
/// Price bounds are half-open cents `[price_min, price_max)`. Adapters for
/// suppliers with inclusive integer filters convert at their boundary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SupplierQuery {
    pub price_min: Option<i64>,
    pub price_max: Option<i64>,
    pub updated_from: Option<DateTime<Utc>>,
    pub updated_to: Option<DateTime<Utc>>,
    pub shapes: Vec<String>,
    pub size_min_points: Option<u32>,
    pub size_max_points: Option<u32>,
}

impl SupplierQuery {
    /// Stable fingerprint used for adapter-side count caching.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}..{}|{}..{}|{}|{}..{}",
            self.price_min.map_or(String::new(), |v| v.to_string()),
            self.price_max.map_or(String::new(), |v| v.to_string()),
            self.updated_from.map_or(String::new(), |t| t.timestamp().to_string()),
            self.updated_to.map_or(String::new(), |t| t.timestamp().to_string()),
            self.shapes.join(","),
            self.size_min_points.map_or(String::new(), |v| v.to_string()),
            self.size_max_points.map_or(String::new(), |v| v.to_string()),
        )
    }
}

/// One item as landed from a supplier. `payload` is the opaque blob the
/// consolidator later feeds back through `map_raw`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplierItem {
    pub supplier_stone_id: String,
    pub offer_id: String,
    pub payload: String,
    pub source_updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// One page of a search, ordered by `created_at ASC`.
#[derive(Debug, Clone)]
pub struct SearchPage {
    pub items: Vec<SupplierItem>,
    pub total_count: u64,
}

/// Canonical fields produced by `map_raw`, before pricing and rating rules.
#[derive(Debug, Clone)]
pub struct MappedStone {
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
    pub status: StoneStatus,
    pub media_url: Option<String>,
    pub source_updated_at: DateTime<Utc>,
}

/// Static facts about a feed.
#[derive(Debug, Clone)]
pub struct FeedMetadata {
    pub feed_id: String,
    pub raw_table: RawTable,
    pub watermark_name: String,
    pub max_page_size: u32,
    pub heatmap: HeatmapTuning,
}

/// Failure taxonomy for adapter calls. `RateLimited` and `Network` are
/// retryable; `Auth` is handled inside the adapter (one re-authentication,
/// then surfaced); `Protocol` is fatal for the call.
#[derive(Debug)]
pub enum AdapterError {
    Network(String),
    Auth(String),
    RateLimited(String),
    Protocol(String),
    NotFound(String),
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Network(_) | AdapterError::RateLimited(_))
    }
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network(m) => write!(f, "network error: {}", m),
            Self::Auth(m) => write!(f, "auth error: {}", m),
            Self::RateLimited(m) => write!(f, "rate limited: {}", m),
            Self::Protocol(m) => write!(f, "protocol error: {}", m),
            Self::NotFound(m) => write!(f, "not found: {}", m),
        }
    }
}

impl std::error::Error for AdapterError {}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            AdapterError::Network(e.to_string())
        } else if e.is_decode() {
            AdapterError::Protocol(e.to_string())
        } else {
            AdapterError::Network(e.to_string())
        }
    }
}

/// Capability set one supplier implements. `search` is always ordered by
/// `created_at ASC` so items do not shift between pages during a run;
/// `limit` is clamped to `metadata().max_page_size`.
#[async_trait]
pub trait SupplierAdapter: Send + Sync {
    fn metadata(&self) -> &FeedMetadata;

    /// Exact number of items matching `query`. Monotone in query tightness.
    async fn get_count(&self, query: &SupplierQuery) -> Result<u64, AdapterError>;

    async fn search(
        &self,
        query: &SupplierQuery,
        offset: u64,
        limit: u32,
    ) -> Result<SearchPage, AdapterError>;

    /// Pure mapping from a raw payload to canonical fields. No I/O.
    fn map_raw(&self, payload: &str) -> Result<MappedStone, AdapterError>;
}

/// Retry policy for transient adapter failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(16),
        }
    }
}

/// Run `op` with exponential backoff on retryable adapter errors.
pub async fn with_retry<T, F, Fut>(
    op_name: &str,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T, AdapterError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, AdapterError>>,
{
    let mut backoff = policy.base_delay;
    let mut last_err = None;

    for attempt in 1..=policy.max_attempts {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                warn!(
                    op = op_name,
                    attempt,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "retryable adapter failure"
                );
                let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
                sleep(backoff + Duration::from_millis(jitter)).await;
                backoff = (backoff * 2).min(policy.max_delay);
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| AdapterError::Network(format!("{op_name}: retries exhausted"))))
}

/// Feed id -> adapter resolution. Unknown feeds fail the trigger.
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn SupplierAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn SupplierAdapter>) {
        self.adapters
            .insert(adapter.metadata().feed_id.clone(), adapter);
    }

    pub fn resolve(&self, feed_id: &str) -> anyhow::Result<Arc<dyn SupplierAdapter>> {
        self.adapters
            .get(feed_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown feed id: {feed_id}"))
    }

    pub fn feed_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Build the registry from the environment: the synthetic `demo` feed is
    /// always present; REST feeds register when their base URL is configured.
    pub fn from_env(heatmap_defaults: &HeatmapTuning) -> anyhow::Result<Self> {
        let mut registry = Self::new();

        registry.register(Arc::new(synthetic::SyntheticAdapter::from_env(
            heatmap_defaults.clone(),
        )?));

        for feed in ["lumera", "gemnet"] {
            let url_key = format!("FACET_{}_API_URL", feed.to_ascii_uppercase());
            if let Ok(base_url) = std::env::var(&url_key) {
                let key_key = format!("FACET_{}_API_KEY", feed.to_ascii_uppercase());
                let api_key = std::env::var(&key_key).unwrap_or_default();
                let adapter =
                    rest::RestSupplierAdapter::new(feed, &base_url, api_key, heatmap_defaults.clone())?;
                registry.register(Arc::new(adapter));
            }
        }

        Ok(registry)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        };

        let out = with_retry("probe", policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AdapterError::Network("connection reset".into()))
                } else {
                    Ok(42u64)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_on_protocol_errors() {
        let calls = AtomicU32::new(0);
        let out: Result<u64, _> = with_retry("probe", RetryPolicy::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AdapterError::Protocol("bad schema".into())) }
        })
        .await;

        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_exhausts_on_persistent_rate_limit() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let calls = AtomicU32::new(0);
        let out: Result<u64, _> = with_retry("probe", policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AdapterError::RateLimited("429".into())) }
        })
        .await;

        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn query_fingerprint_distinguishes_ranges() {
        let a = SupplierQuery {
            price_min: Some(0),
            price_max: Some(100),
            ..Default::default()
        };
        let b = SupplierQuery {
            price_min: Some(0),
            price_max: Some(200),
            ..Default::default()
        };
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
    }
}
