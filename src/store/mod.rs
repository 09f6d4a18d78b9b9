//! Persistence: the relational ingestion store and the watermark blob store.

pub mod allowlist;
pub mod ingest_db;
pub mod watermark;

pub use ingest_db::IngestDb;
pub use watermark::WatermarkStore;
