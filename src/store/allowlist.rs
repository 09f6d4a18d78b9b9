//! Raw table allowlist.
//!
//! Table names are interpolated into SQL, so they must never come from
//! external input. Every feed's landing table is registered here; resolution
//! of anything else fails the trigger.

use lazy_static::lazy_static;
use std::collections::HashMap;

/// A raw table name that is guaranteed to come from the static allowlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawTable(&'static str);

impl RawTable {
    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl std::fmt::Display for RawTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

lazy_static! {
    static ref RAW_TABLES: HashMap<&'static str, RawTable> = {
        let mut m = HashMap::new();
        m.insert("demo", RawTable("raw_demo"));
        m.insert("lumera", RawTable("raw_lumera"));
        m.insert("gemnet", RawTable("raw_gemnet"));
        m
    };
}

pub fn raw_table_for(feed_id: &str) -> anyhow::Result<RawTable> {
    RAW_TABLES
        .get(feed_id)
        .copied()
        .ok_or_else(|| anyhow::anyhow!("feed '{feed_id}' has no allowlisted raw table"))
}

pub fn all_raw_tables() -> Vec<RawTable> {
    let mut tables: Vec<RawTable> = RAW_TABLES.values().copied().collect();
    tables.sort_by_key(|t| t.as_str());
    tables
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_feeds_resolve() {
        assert_eq!(raw_table_for("demo").unwrap().as_str(), "raw_demo");
        assert_eq!(raw_table_for("lumera").unwrap().as_str(), "raw_lumera");
    }

    #[test]
    fn unknown_feed_is_rejected() {
        assert!(raw_table_for("demo'; DROP TABLE raw_demo;--").is_err());
        assert!(raw_table_for("unknown").is_err());
    }
}
