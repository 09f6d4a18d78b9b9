//! Per-feed watermark blobs.
//!
//! One JSON file per feed under the watermark directory; writes are
//! full-object overwrites through a temp file + rename so readers never see
//! a torn blob.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::models::Watermark;

#[derive(Clone)]
pub struct WatermarkStore {
    dir: PathBuf,
}

impl WatermarkStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create watermark dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn blob_path(&self, feed_id: &str) -> PathBuf {
        self.dir.join(format!("{feed_id}.json"))
    }

    pub fn load(&self, feed_id: &str) -> Result<Option<Watermark>> {
        let path = self.blob_path(feed_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("read watermark {}", path.display()))?;
        let watermark = serde_json::from_str(&raw)
            .with_context(|| format!("parse watermark {}", path.display()))?;
        Ok(Some(watermark))
    }

    pub fn save(&self, feed_id: &str, watermark: &Watermark) -> Result<()> {
        let path = self.blob_path(feed_id);
        let tmp = self.dir.join(format!(".{feed_id}.json.tmp"));
        let raw = serde_json::to_string_pretty(watermark)?;
        std::fs::write(&tmp, raw).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("rename watermark into place {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = WatermarkStore::new(dir.path()).unwrap();

        assert!(store.load("demo").unwrap().is_none());

        let mark = Watermark {
            last_updated_at: Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap(),
            last_run_id: "run-1".into(),
            last_run_completed_at: Utc.with_ymd_and_hms(2024, 6, 1, 10, 5, 0).unwrap(),
        };
        store.save("demo", &mark).unwrap();

        let loaded = store.load("demo").unwrap().unwrap();
        assert_eq!(loaded.last_run_id, "run-1");
        assert_eq!(loaded.last_updated_at, mark.last_updated_at);
    }

    #[test]
    fn overwrite_replaces_whole_blob() {
        let dir = tempdir().unwrap();
        let store = WatermarkStore::new(dir.path()).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();

        store
            .save(
                "demo",
                &Watermark {
                    last_updated_at: t1,
                    last_run_id: "run-1".into(),
                    last_run_completed_at: t1,
                },
            )
            .unwrap();
        store
            .save(
                "demo",
                &Watermark {
                    last_updated_at: t2,
                    last_run_id: "run-2".into(),
                    last_run_completed_at: t2,
                },
            )
            .unwrap();

        let loaded = store.load("demo").unwrap().unwrap();
        assert_eq!(loaded.last_run_id, "run-2");
    }
}
