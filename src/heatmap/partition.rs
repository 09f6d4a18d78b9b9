//! Greedy partition construction over a density histogram.
//!
//! Partitions cover `[first_chunk_min, last_chunk_max)` with no gap and no
//! overlap, and their estimated counts sum to the effective total. Worker
//! count equals partition count; the partitions are authoritative.

use crate::models::HeatmapTuning;

/// One probed density interval, half-open `[price_min, price_max)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DensityChunk {
    pub price_min: i64,
    pub price_max: i64,
    pub count: u64,
}

/// One price slice of the feed's inventory, processed by one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricePartition {
    pub partition_id: String,
    pub price_min: i64,
    pub price_max: i64,
    pub estimated_count: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PartitionPlan {
    pub partitions: Vec<PricePartition>,
    pub effective_total: u64,
    /// Records dropped by `max_total_records`; re-covered by the next
    /// incremental run.
    pub truncated: u64,
}

/// Cut the histogram into approximately equal partitions.
pub fn build_partitions(chunks: &[DensityChunk], tuning: &HeatmapTuning) -> PartitionPlan {
    let total: u64 = chunks.iter().map(|c| c.count).sum();
    if total == 0 || chunks.is_empty() {
        return PartitionPlan::default();
    }

    // Apply the record cap by clamping the tail of the chunk list.
    let (chunks, effective_total, truncated) = match tuning.max_total_records {
        Some(cap) if cap < total => (truncate_chunks(chunks, cap), cap, total - cap),
        _ => (chunks.to_vec(), total, 0),
    };

    let desired_workers = (effective_total.div_ceil(tuning.min_records_per_worker.max(1)))
        .clamp(1, tuning.max_workers.max(1) as u64) as u32;
    let target_per_worker = effective_total.div_ceil(desired_workers as u64);

    // Flatten oversized chunks so the greedy sweep can cut at finer
    // boundaries.
    let flat = flatten_chunks(&chunks, target_per_worker);

    let mut partitions: Vec<PricePartition> = Vec::with_capacity(desired_workers as usize);
    let mut part_min = flat[0].price_min;
    let mut part_max = flat[0].price_min;
    let mut running = 0u64;

    for (i, chunk) in flat.iter().enumerate() {
        running += chunk.count;
        part_max = chunk.price_max;
        let last_chunk = i == flat.len() - 1;
        let workers_remain = (partitions.len() as u32) < desired_workers - 1;

        if (running >= target_per_worker && workers_remain) || last_chunk {
            partitions.push(PricePartition {
                partition_id: format!("partition-{}", partitions.len()),
                price_min: part_min,
                price_max: part_max,
                estimated_count: running,
            });
            // The next partition starts where this one ended, covering any
            // empty gap between chunks.
            part_min = part_max;
            running = 0;
        }
    }

    PartitionPlan {
        partitions,
        effective_total,
        truncated,
    }
}

fn truncate_chunks(chunks: &[DensityChunk], cap: u64) -> Vec<DensityChunk> {
    let mut out = Vec::new();
    let mut budget = cap;
    for chunk in chunks {
        if budget == 0 {
            break;
        }
        let take = chunk.count.min(budget);
        out.push(DensityChunk {
            price_min: chunk.price_min,
            price_max: chunk.price_max,
            count: take,
        });
        budget -= take;
    }
    out
}

/// Split any chunk above `1.5 * target` into equal-width sub-chunks with
/// floor-equal counts; the last sub-chunk absorbs the remainder.
fn flatten_chunks(chunks: &[DensityChunk], target_per_worker: u64) -> Vec<DensityChunk> {
    let threshold = target_per_worker + target_per_worker / 2;
    let mut out = Vec::with_capacity(chunks.len());

    for chunk in chunks {
        let width = chunk.price_max - chunk.price_min;
        if chunk.count <= threshold || target_per_worker == 0 || width <= 1 {
            out.push(chunk.clone());
            continue;
        }

        let k = chunk
            .count
            .div_ceil(target_per_worker)
            .min(width as u64)
            .max(1);
        let sub_width = width / k as i64;
        let base_count = chunk.count / k;

        for i in 0..k {
            let lo = chunk.price_min + sub_width * i as i64;
            let (hi, count) = if i == k - 1 {
                (chunk.price_max, chunk.count - base_count * (k - 1))
            } else {
                (lo + sub_width, base_count)
            };
            out.push(DensityChunk {
                price_min: lo,
                price_max: hi,
                count,
            });
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning(max_workers: u32, min_per_worker: u64) -> HeatmapTuning {
        HeatmapTuning {
            max_workers,
            min_records_per_worker: min_per_worker,
            ..Default::default()
        }
    }

    fn assert_invariants(chunks: &[DensityChunk], plan: &PartitionPlan) {
        if plan.partitions.is_empty() {
            return;
        }
        // Gap-free, overlap-free cover of [first_min, last_max).
        assert_eq!(plan.partitions[0].price_min, chunks[0].price_min);
        assert_eq!(
            plan.partitions.last().unwrap().price_max,
            chunks.last().unwrap().price_max
        );
        for pair in plan.partitions.windows(2) {
            assert_eq!(pair[0].price_max, pair[1].price_min);
        }
        // Counts are preserved.
        let sum: u64 = plan.partitions.iter().map(|p| p.estimated_count).sum();
        assert_eq!(sum, plan.effective_total);
        // Ids are ordinal.
        for (i, p) in plan.partitions.iter().enumerate() {
            assert_eq!(p.partition_id, format!("partition-{i}"));
        }
    }

    #[test]
    fn empty_histogram_yields_no_partitions() {
        let plan = build_partitions(&[], &tuning(10, 50));
        assert!(plan.partitions.is_empty());
        assert_eq!(plan.effective_total, 0);
    }

    #[test]
    fn four_equal_chunks_two_workers() {
        let chunks: Vec<DensityChunk> = (0..4)
            .map(|i| DensityChunk {
                price_min: i * 100,
                price_max: (i + 1) * 100,
                count: 1000,
            })
            .collect();
        let plan = build_partitions(&chunks, &tuning(2, 2000));

        assert_eq!(plan.partitions.len(), 2);
        assert_eq!(
            plan.partitions[0],
            PricePartition {
                partition_id: "partition-0".into(),
                price_min: 0,
                price_max: 200,
                estimated_count: 2000,
            }
        );
        assert_eq!(
            plan.partitions[1],
            PricePartition {
                partition_id: "partition-1".into(),
                price_min: 200,
                price_max: 400,
                estimated_count: 2000,
            }
        );
        assert_invariants(&chunks, &plan);
    }

    #[test]
    fn oversized_chunks_are_flattened() {
        // Two fat chunks, ten workers: each chunk must split so every worker
        // lands near 2000 records.
        let chunks = vec![
            DensityChunk {
                price_min: 0,
                price_max: 100,
                count: 10_000,
            },
            DensityChunk {
                price_min: 100,
                price_max: 200,
                count: 10_000,
            },
        ];
        let plan = build_partitions(&chunks, &tuning(10, 50));

        assert_eq!(plan.partitions.len(), 10);
        assert_eq!(plan.effective_total, 20_000);
        for p in &plan.partitions {
            assert_eq!(p.estimated_count, 2_000);
        }
        assert_invariants(&chunks, &plan);
    }

    #[test]
    fn single_fat_chunk_splits_into_desired_workers() {
        let chunks = vec![DensityChunk {
            price_min: 0,
            price_max: 1_000,
            count: 1_000,
        }];
        let plan = build_partitions(&chunks, &tuning(10, 50));

        assert_eq!(plan.partitions.len(), 10);
        assert_invariants(&chunks, &plan);
    }

    #[test]
    fn gaps_between_chunks_are_covered() {
        let chunks = vec![
            DensityChunk {
                price_min: 0,
                price_max: 100,
                count: 500,
            },
            // Empty [100, 10_000) gap.
            DensityChunk {
                price_min: 10_000,
                price_max: 10_100,
                count: 500,
            },
        ];
        let plan = build_partitions(&chunks, &tuning(2, 500));
        assert_eq!(plan.partitions.len(), 2);
        assert_invariants(&chunks, &plan);
    }

    #[test]
    fn record_cap_truncates_tail() {
        let chunks: Vec<DensityChunk> = (0..4)
            .map(|i| DensityChunk {
                price_min: i * 100,
                price_max: (i + 1) * 100,
                count: 1000,
            })
            .collect();
        let plan = build_partitions(
            &chunks,
            &HeatmapTuning {
                max_workers: 4,
                min_records_per_worker: 500,
                max_total_records: Some(2_500),
                ..Default::default()
            },
        );

        assert_eq!(plan.effective_total, 2_500);
        assert_eq!(plan.truncated, 1_500);
        let sum: u64 = plan.partitions.iter().map(|p| p.estimated_count).sum();
        assert_eq!(sum, 2_500);
    }

    #[test]
    fn worker_floor_is_one() {
        let chunks = vec![DensityChunk {
            price_min: 0,
            price_max: 100,
            count: 3,
        }];
        let plan = build_partitions(&chunks, &tuning(10, 50));
        assert_eq!(plan.partitions.len(), 1);
        assert_eq!(plan.partitions[0].estimated_count, 3);
    }
}
