//! Adaptive density scanning.
//!
//! The scanner probes `get_count` over adjacent half-open price intervals.
//! Below the dense-zone threshold it walks with a fixed small step (cheap
//! stones cluster at the low end); above it the step adapts: multiply by 5
//! across empty stretches, otherwise rescale toward the target chunk size.
//! Probes run `concurrency` at a time. Any probe that exhausts its retries
//! fails the whole scan, before any work is enqueued.

use anyhow::{Context, Result};
use futures_util::future::join_all;
use std::time::Duration;
use tracing::debug;

use super::partition::DensityChunk;
use crate::adapters::{with_retry, RetryPolicy, SupplierAdapter, SupplierQuery};
use crate::models::HeatmapTuning;

/// Upper clamp for the adaptive step.
const MAX_ADAPTIVE_STEP: i64 = 50_000;

fn scan_retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_secs(2),
    }
}

/// Build the density histogram for `base` under the adapter's inventory.
pub async fn scan_density(
    adapter: &dyn SupplierAdapter,
    base: &SupplierQuery,
    tuning: &HeatmapTuning,
) -> Result<Vec<DensityChunk>> {
    if tuning.use_two_pass_scan {
        two_pass_scan(adapter, base, tuning).await
    } else {
        adaptive_scan(adapter, base, tuning, tuning.min_price, tuning.max_price).await
    }
}

async fn probe(
    adapter: &dyn SupplierAdapter,
    base: &SupplierQuery,
    lo: i64,
    hi: i64,
) -> Result<u64> {
    let mut query = base.clone();
    query.price_min = Some(lo);
    query.price_max = Some(hi);
    with_retry("heatmap_count", scan_retry_policy(), || {
        adapter.get_count(&query)
    })
    .await
    .with_context(|| format!("density probe [{lo}, {hi}) failed"))
}

async fn probe_wave(
    adapter: &dyn SupplierAdapter,
    base: &SupplierQuery,
    intervals: &[(i64, i64)],
) -> Result<Vec<u64>> {
    let futures = intervals.iter().map(|&(lo, hi)| probe(adapter, base, lo, hi));
    join_all(futures).await.into_iter().collect()
}

/// Single-pass adaptive scan over `[lo, hi)`.
async fn adaptive_scan(
    adapter: &dyn SupplierAdapter,
    base: &SupplierQuery,
    tuning: &HeatmapTuning,
    lo: i64,
    hi: i64,
) -> Result<Vec<DensityChunk>> {
    let dense_step = tuning.dense_zone_step.max(1);
    let concurrency = tuning.concurrency.max(1);
    let mut cursor = lo;
    let mut step = tuning.initial_step.max(1);
    let mut chunks = Vec::new();

    while cursor < hi {
        let in_dense = cursor < tuning.dense_zone_threshold;
        let step_now = if in_dense { dense_step } else { step };

        // Lay out up to `concurrency` adjacent intervals. A dense-zone wave
        // stops at the threshold so the step can switch.
        let mut intervals = Vec::with_capacity(concurrency);
        let mut next = cursor;
        for _ in 0..concurrency {
            if next >= hi || (in_dense && next >= tuning.dense_zone_threshold) {
                break;
            }
            let upper = (next + step_now).min(hi);
            intervals.push((next, upper));
            next = upper;
        }

        let counts = probe_wave(adapter, base, &intervals).await?;

        let mut observed = Vec::new();
        for (&(ilo, ihi), &count) in intervals.iter().zip(counts.iter()) {
            if count > 0 {
                chunks.push(DensityChunk {
                    price_min: ilo,
                    price_max: ihi,
                    count,
                });
                observed.push(count);
            }
        }
        cursor = next;

        if !in_dense {
            if observed.is_empty() {
                // Zoom past the gap.
                step = step.saturating_mul(5);
            } else {
                let avg = observed.iter().sum::<u64>() / observed.len() as u64;
                let scaled =
                    (step_now as f64 * tuning.target_records_per_chunk as f64 / avg.max(1) as f64)
                        as i64;
                let clamp_lo = (2 * dense_step).min(MAX_ADAPTIVE_STEP);
                step = scaled.clamp(clamp_lo, MAX_ADAPTIVE_STEP);
            }
        }
    }

    debug!(
        chunks = chunks.len(),
        total = chunks.iter().map(|c| c.count).sum::<u64>(),
        "density scan complete"
    );
    Ok(chunks)
}

/// Coarse scan, boundary refinement, then a fine scan per dense region.
async fn two_pass_scan(
    adapter: &dyn SupplierAdapter,
    base: &SupplierQuery,
    tuning: &HeatmapTuning,
) -> Result<Vec<DensityChunk>> {
    let coarse_step = tuning.coarse_step.max(tuning.dense_zone_step).max(1);
    let concurrency = tuning.concurrency.max(1);

    // Pass one: coarse cells over the full range, empties included.
    let mut cells = Vec::new();
    let mut cursor = tuning.min_price;
    while cursor < tuning.max_price {
        let mut intervals = Vec::with_capacity(concurrency);
        let mut next = cursor;
        for _ in 0..concurrency {
            if next >= tuning.max_price {
                break;
            }
            let upper = (next + coarse_step).min(tuning.max_price);
            intervals.push((next, upper));
            next = upper;
        }
        let counts = probe_wave(adapter, base, &intervals).await?;
        for (&(ilo, ihi), &count) in intervals.iter().zip(counts.iter()) {
            cells.push((ilo, ihi, count));
        }
        cursor = next;
    }

    // Contiguous non-empty cells form dense regions.
    let mut regions: Vec<(i64, i64)> = Vec::new();
    for &(ilo, ihi, count) in &cells {
        if count == 0 {
            continue;
        }
        match regions.last_mut() {
            Some((_, end)) if *end == ilo => *end = ihi,
            _ => regions.push((ilo, ihi)),
        }
    }

    // Pass two: refine each region boundary to dense-step precision, then
    // fine-scan the refined span.
    let mut chunks = Vec::new();
    for (region_lo, region_hi) in regions {
        let refined_lo =
            refine_lower(adapter, base, region_lo, (region_lo + coarse_step).min(region_hi), tuning)
                .await?;
        let refined_hi =
            refine_upper(adapter, base, (region_hi - coarse_step).max(refined_lo), region_hi, tuning)
                .await?;
        let region_chunks =
            adaptive_scan(adapter, base, tuning, refined_lo, refined_hi.max(refined_lo + 1)).await?;
        chunks.extend(region_chunks);
    }

    Ok(chunks)
}

/// Largest boundary `b` in `[lo, hi)` with zero items in `[lo, b)`.
async fn refine_lower(
    adapter: &dyn SupplierAdapter,
    base: &SupplierQuery,
    mut lo: i64,
    mut hi: i64,
    tuning: &HeatmapTuning,
) -> Result<i64> {
    let precision = tuning.dense_zone_step.max(1);
    let floor = lo;
    while hi - lo > precision {
        let mid = lo + (hi - lo) / 2;
        if probe(adapter, base, floor, mid).await? == 0 {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

/// Smallest boundary `b` in `(lo, hi]` with zero items in `[b, hi)`.
async fn refine_upper(
    adapter: &dyn SupplierAdapter,
    base: &SupplierQuery,
    mut lo: i64,
    mut hi: i64,
    tuning: &HeatmapTuning,
) -> Result<i64> {
    let precision = tuning.dense_zone_step.max(1);
    let ceiling = hi;
    while hi - lo > precision {
        let mid = lo + (hi - lo) / 2;
        if probe(adapter, base, mid, ceiling).await? == 0 {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    Ok(hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::synthetic::SyntheticAdapter;

    fn tuning_for(min: i64, max: i64, dense_threshold: i64, dense_step: i64) -> HeatmapTuning {
        HeatmapTuning {
            min_price: min,
            max_price: max,
            dense_zone_threshold: dense_threshold,
            dense_zone_step: dense_step,
            initial_step: dense_step * 2,
            target_records_per_chunk: 100,
            concurrency: 3,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn scan_counts_every_item_exactly_once() {
        let tuning = tuning_for(0, 10_000, 10_000, 1_000);
        let adapter =
            SyntheticAdapter::uniform(tuning.clone(), 1_000, 0, 10_000, 11).unwrap();

        let chunks = scan_density(&adapter, &SupplierQuery::default(), &tuning)
            .await
            .unwrap();

        let total: u64 = chunks.iter().map(|c| c.count).sum();
        assert_eq!(total, 1_000);
        // Chunks are adjacent-or-increasing, never overlapping.
        for pair in chunks.windows(2) {
            assert!(pair[0].price_max <= pair[1].price_min);
        }
    }

    #[tokio::test]
    async fn scan_leaps_over_wide_gaps() {
        // Two pockets far apart; the scanner multiplies its step over the
        // empty middle instead of probing it at fine grain.
        let tuning = tuning_for(0, 2_000_000, 200, 100);
        let adapter = SyntheticAdapter::with_profile(
            tuning.clone(),
            &[(0, 100, 50), (1_900_000, 1_900_100, 50)],
            13,
        )
        .unwrap();

        let chunks = scan_density(&adapter, &SupplierQuery::default(), &tuning)
            .await
            .unwrap();
        let total: u64 = chunks.iter().map(|c| c.count).sum();
        assert_eq!(total, 100);
    }

    #[tokio::test]
    async fn exhausted_probe_retries_fail_the_scan() {
        let tuning = tuning_for(0, 1_000, 1_000, 500);
        let adapter = SyntheticAdapter::uniform(tuning.clone(), 100, 0, 1_000, 17).unwrap();
        adapter.inject_count_failures(50);

        let result = scan_density(&adapter, &SupplierQuery::default(), &tuning).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn two_pass_scan_finds_all_regions() {
        let tuning = HeatmapTuning {
            min_price: 0,
            max_price: 1_000_000,
            dense_zone_threshold: 0,
            dense_zone_step: 1_000,
            initial_step: 10_000,
            target_records_per_chunk: 100,
            concurrency: 4,
            use_two_pass_scan: true,
            coarse_step: 100_000,
            ..Default::default()
        };
        let adapter = SyntheticAdapter::with_profile(
            tuning.clone(),
            &[(50_000, 60_000, 300), (700_000, 720_000, 200)],
            19,
        )
        .unwrap();

        let chunks = scan_density(&adapter, &SupplierQuery::default(), &tuning)
            .await
            .unwrap();
        let total: u64 = chunks.iter().map(|c| c.count).sum();
        assert_eq!(total, 500);
    }
}
