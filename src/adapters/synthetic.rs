//! Synthetic supplier.
//!
//! A deterministic in-memory catalog seeded from ChaCha, used by the dev
//! loop and the end-to-end tests. Density profiles are programmable so
//! partitioner behavior can be pinned exactly, and failures can be injected
//! to exercise the retry and failure paths.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;

use super::{
    AdapterError, FeedMetadata, MappedStone, SearchPage, SupplierAdapter, SupplierItem,
    SupplierQuery,
};
use crate::models::{HeatmapTuning, Shape, StoneStatus};
use crate::store::allowlist;

const SHAPES: [Shape; 10] = [
    Shape::Round,
    Shape::Princess,
    Shape::Cushion,
    Shape::Emerald,
    Shape::Oval,
    Shape::Radiant,
    Shape::Asscher,
    Shape::Marquise,
    Shape::Heart,
    Shape::Pear,
];
const COLORS: [&str; 7] = ["D", "E", "F", "G", "H", "I", "J"];
const CLARITIES: [&str; 8] = ["FL", "IF", "VVS1", "VVS2", "VS1", "VS2", "SI1", "SI2"];
const CUTS: [&str; 4] = ["excellent", "very_good", "good", "fair"];
const LABS: [&str; 3] = ["GIA", "IGI", "HRD"];

#[derive(Debug, Clone)]
struct SyntheticStone {
    supplier_stone_id: String,
    offer_id: String,
    price_cents: i64,
    shape: Shape,
    weight_points: u32,
    color: &'static str,
    clarity: &'static str,
    cut: &'static str,
    lab: &'static str,
    certificate: String,
    status: StoneStatus,
    created_at: DateTime<Utc>,
    source_updated_at: DateTime<Utc>,
}

impl SyntheticStone {
    fn payload(&self) -> String {
        serde_json::json!({
            "stone_id": self.supplier_stone_id,
            "offer_id": self.offer_id,
            "price_cents": self.price_cents,
            "shape": self.shape.as_str(),
            "weight_points": self.weight_points,
            "color": self.color,
            "clarity": self.clarity,
            "cut": self.cut,
            "lab": self.lab,
            "certificate": self.certificate,
            "status": self.status.as_str(),
            "updated_at": self.source_updated_at.to_rfc3339(),
        })
        .to_string()
    }

    fn matches(&self, query: &SupplierQuery) -> bool {
        if let Some(min) = query.price_min {
            if self.price_cents < min {
                return false;
            }
        }
        if let Some(max) = query.price_max {
            if self.price_cents >= max {
                return false;
            }
        }
        if let Some(from) = query.updated_from {
            if self.source_updated_at < from {
                return false;
            }
        }
        if let Some(to) = query.updated_to {
            if self.source_updated_at > to {
                return false;
            }
        }
        if !query.shapes.is_empty()
            && !query.shapes.iter().any(|s| s == self.shape.as_str())
        {
            return false;
        }
        if let Some(min) = query.size_min_points {
            if self.weight_points < min {
                return false;
            }
        }
        if let Some(max) = query.size_max_points {
            if self.weight_points > max {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Deserialize)]
struct SyntheticPayload {
    stone_id: String,
    offer_id: String,
    price_cents: i64,
    shape: String,
    weight_points: u32,
    color: String,
    clarity: String,
    cut: String,
    lab: String,
    certificate: String,
    status: String,
    updated_at: String,
}

#[derive(Default)]
struct FaultState {
    failing_counts: u32,
    failing_searches: u32,
}

pub struct SyntheticAdapter {
    metadata: FeedMetadata,
    items: Vec<SyntheticStone>,
    faults: Mutex<FaultState>,
}

impl SyntheticAdapter {
    /// Catalog with explicit density: for each `(price_min, price_max,
    /// count)` the prices are spread evenly across the half-open range.
    pub fn with_profile(
        heatmap: HeatmapTuning,
        profile: &[(i64, i64, u64)],
        seed: u64,
    ) -> anyhow::Result<Self> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let base_created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let base_updated = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();

        let mut items = Vec::new();
        for &(lo, hi, count) in profile {
            let span = (hi - lo).max(1);
            for i in 0..count {
                let idx = items.len() as i64;
                let price = lo + (span * i as i64) / count.max(1) as i64;
                items.push(make_stone(&mut rng, idx, price, base_created, base_updated));
            }
        }
        items.sort_by_key(|s| (s.created_at, s.supplier_stone_id.clone()));

        Ok(Self {
            metadata: demo_metadata(heatmap)?,
            items,
            faults: Mutex::new(FaultState::default()),
        })
    }

    /// Catalog of `total` stones spread uniformly over `[price_min,
    /// price_max)`.
    pub fn uniform(
        heatmap: HeatmapTuning,
        total: u64,
        price_min: i64,
        price_max: i64,
        seed: u64,
    ) -> anyhow::Result<Self> {
        Self::with_profile(heatmap, &[(price_min, price_max, total)], seed)
    }

    pub fn from_env(heatmap: HeatmapTuning) -> anyhow::Result<Self> {
        let total = std::env::var("FACET_DEMO_TOTAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5_000);
        let seed = std::env::var("FACET_DEMO_SEED")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(7);
        let (lo, hi) = (heatmap.min_price, heatmap.max_price.min(5_000_000));
        Self::uniform(heatmap, total, lo, hi, seed)
    }

    /// Make the next `n` `get_count` calls fail with a network error.
    pub fn inject_count_failures(&self, n: u32) {
        self.faults.lock().failing_counts = n;
    }

    /// Make the next `n` `search` calls fail with a network error.
    pub fn inject_search_failures(&self, n: u32) {
        self.faults.lock().failing_searches = n;
    }

    pub fn total_items(&self) -> u64 {
        self.items.len() as u64
    }
}

fn demo_metadata(heatmap: HeatmapTuning) -> anyhow::Result<FeedMetadata> {
    Ok(FeedMetadata {
        feed_id: "demo".to_string(),
        raw_table: allowlist::raw_table_for("demo")?,
        watermark_name: "demo".to_string(),
        max_page_size: 500,
        heatmap,
    })
}

fn make_stone(
    rng: &mut ChaCha8Rng,
    idx: i64,
    price_cents: i64,
    base_created: DateTime<Utc>,
    base_updated: DateTime<Utc>,
) -> SyntheticStone {
    let shape = SHAPES[rng.gen_range(0..SHAPES.len())];
    let weight_points = rng.gen_range(30..500);
    SyntheticStone {
        supplier_stone_id: format!("demo-{idx:08}"),
        offer_id: format!("offer-{idx:08}"),
        price_cents,
        shape,
        weight_points,
        color: COLORS[rng.gen_range(0..COLORS.len())],
        clarity: CLARITIES[rng.gen_range(0..CLARITIES.len())],
        cut: CUTS[rng.gen_range(0..CUTS.len())],
        lab: LABS[rng.gen_range(0..LABS.len())],
        certificate: format!("CERT-{:010}", rng.gen_range(0u64..10_000_000_000)),
        status: StoneStatus::Available,
        created_at: base_created + Duration::seconds(idx),
        source_updated_at: base_updated + Duration::seconds(idx),
    }
}

#[async_trait]
impl SupplierAdapter for SyntheticAdapter {
    fn metadata(&self) -> &FeedMetadata {
        &self.metadata
    }

    async fn get_count(&self, query: &SupplierQuery) -> Result<u64, AdapterError> {
        {
            let mut faults = self.faults.lock();
            if faults.failing_counts > 0 {
                faults.failing_counts -= 1;
                return Err(AdapterError::Network("synthetic count failure".into()));
            }
        }
        Ok(self.items.iter().filter(|s| s.matches(query)).count() as u64)
    }

    async fn search(
        &self,
        query: &SupplierQuery,
        offset: u64,
        limit: u32,
    ) -> Result<SearchPage, AdapterError> {
        {
            let mut faults = self.faults.lock();
            if faults.failing_searches > 0 {
                faults.failing_searches -= 1;
                return Err(AdapterError::Network("synthetic search failure".into()));
            }
        }

        let limit = limit.min(self.metadata.max_page_size) as usize;
        let matches: Vec<&SyntheticStone> =
            self.items.iter().filter(|s| s.matches(query)).collect();
        let total_count = matches.len() as u64;

        let items = matches
            .into_iter()
            .skip(offset as usize)
            .take(limit)
            .map(|s| SupplierItem {
                supplier_stone_id: s.supplier_stone_id.clone(),
                offer_id: s.offer_id.clone(),
                payload: s.payload(),
                source_updated_at: s.source_updated_at,
                created_at: s.created_at,
            })
            .collect();

        Ok(SearchPage { items, total_count })
    }

    fn map_raw(&self, payload: &str) -> Result<MappedStone, AdapterError> {
        let raw: SyntheticPayload = serde_json::from_str(payload)
            .map_err(|e| AdapterError::Protocol(format!("unparsable payload: {e}")))?;
        let shape = Shape::parse(&raw.shape)
            .ok_or_else(|| AdapterError::Protocol(format!("unknown shape '{}'", raw.shape)))?;
        let status = StoneStatus::parse(&raw.status)
            .ok_or_else(|| AdapterError::Protocol(format!("unknown status '{}'", raw.status)))?;
        let source_updated_at = DateTime::parse_from_rfc3339(&raw.updated_at)
            .map_err(|e| AdapterError::Protocol(format!("bad updated_at: {e}")))?
            .with_timezone(&Utc);

        Ok(MappedStone {
            supplier_stone_id: raw.stone_id,
            offer_id: raw.offer_id,
            shape,
            weight_points: raw.weight_points,
            color: raw.color,
            clarity: raw.clarity,
            cut: Some(raw.cut),
            lab: Some(raw.lab),
            certificate: Some(raw.certificate),
            supplier_price_cents: raw.price_cents,
            status,
            media_url: None,
            source_updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(profile: &[(i64, i64, u64)]) -> SyntheticAdapter {
        SyntheticAdapter::with_profile(HeatmapTuning::default(), profile, 42).unwrap()
    }

    #[tokio::test]
    async fn count_respects_half_open_price_range() {
        let a = adapter(&[(0, 100, 10), (100, 200, 20)]);

        let q = SupplierQuery {
            price_min: Some(0),
            price_max: Some(100),
            ..Default::default()
        };
        assert_eq!(a.get_count(&q).await.unwrap(), 10);

        let q = SupplierQuery {
            price_min: Some(100),
            price_max: Some(200),
            ..Default::default()
        };
        assert_eq!(a.get_count(&q).await.unwrap(), 20);

        let q = SupplierQuery {
            price_min: Some(0),
            price_max: Some(200),
            ..Default::default()
        };
        assert_eq!(a.get_count(&q).await.unwrap(), 30);
    }

    #[tokio::test]
    async fn search_pages_are_ordered_and_stable() {
        let a = adapter(&[(0, 1000, 25)]);
        let q = SupplierQuery::default();

        let p1 = a.search(&q, 0, 10).await.unwrap();
        let p2 = a.search(&q, 10, 10).await.unwrap();
        let p3 = a.search(&q, 20, 10).await.unwrap();

        assert_eq!(p1.items.len(), 10);
        assert_eq!(p2.items.len(), 10);
        assert_eq!(p3.items.len(), 5);
        assert_eq!(p1.total_count, 25);

        let mut all: Vec<DateTime<Utc>> = p1
            .items
            .iter()
            .chain(&p2.items)
            .chain(&p3.items)
            .map(|i| i.created_at)
            .collect();
        let sorted = {
            let mut s = all.clone();
            s.sort();
            s
        };
        assert_eq!(all, sorted);
        all.dedup();
        assert_eq!(all.len(), 25);
    }

    #[tokio::test]
    async fn map_raw_round_trips_payload() {
        let a = adapter(&[(5000, 5001, 1)]);
        let page = a.search(&SupplierQuery::default(), 0, 1).await.unwrap();
        let mapped = a.map_raw(&page.items[0].payload).unwrap();

        assert_eq!(mapped.supplier_stone_id, page.items[0].supplier_stone_id);
        assert_eq!(mapped.supplier_price_cents, 5000);
        assert_eq!(mapped.status, StoneStatus::Available);
    }

    #[tokio::test]
    async fn map_raw_rejects_garbage() {
        let a = adapter(&[(0, 100, 1)]);
        assert!(a.map_raw("not json").is_err());
        assert!(a.map_raw("{\"stone_id\": \"x\"}").is_err());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let a = adapter(&[(0, 100, 5)]);
        a.inject_count_failures(1);

        assert!(a.get_count(&SupplierQuery::default()).await.is_err());
        assert_eq!(a.get_count(&SupplierQuery::default()).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn generation_is_deterministic_for_a_seed() {
        let a = SyntheticAdapter::uniform(HeatmapTuning::default(), 50, 0, 1000, 9).unwrap();
        let b = SyntheticAdapter::uniform(HeatmapTuning::default(), 50, 0, 1000, 9).unwrap();

        let pa = a.search(&SupplierQuery::default(), 0, 50).await.unwrap();
        let pb = b.search(&SupplierQuery::default(), 0, 50).await.unwrap();
        let ids_a: Vec<&str> = pa.items.iter().map(|i| i.payload.as_str()).collect();
        let ids_b: Vec<&str> = pb.items.iter().map(|i| i.payload.as_str()).collect();
        assert_eq!(ids_a, ids_b);
    }
}
