//! Facet ingestion backend.
//!
//! Pulls external diamond catalogs into the canonical local store: the
//! heatmap partitioner slices a supplier's inventory by price density, a
//! worker fleet drains partition pages off a durable queue, and the
//! consolidator claims raw rows, prices them, and advances the per-feed
//! watermark.

pub mod adapters;
pub mod consolidator;
pub mod heatmap;
pub mod models;
pub mod notify;
pub mod queue;
pub mod rate_limit;
pub mod scheduler;
pub mod store;
pub mod worker;
