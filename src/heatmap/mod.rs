//! Heatmap partitioner.
//!
//! Probes the supplier by price range to build a density histogram
//! ([`scanner`]), then cuts it into balanced partitions sized for parallel
//! workers ([`partition`]).

pub mod partition;
pub mod scanner;

pub use partition::{build_partitions, DensityChunk, PartitionPlan, PricePartition};
pub use scanner::scan_density;
