//! Fire-and-forget notification sinks.
//!
//! Everything user-visible about failures flows through here: a pipeline
//! event goes to the sink, failure events also land in `error_logs`. Sinks
//! return unconditionally; a broken sink is logged and never propagates into
//! the pipeline.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::store::IngestDb;

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    RunFailed {
        feed_id: String,
        run_id: String,
        message: String,
    },
    RunPartial {
        feed_id: String,
        run_id: String,
        failed_workers: u32,
    },
    ConsolidationSkipped {
        feed_id: String,
        run_id: String,
        reason: String,
    },
    RunConsolidated {
        feed_id: String,
        run_id: String,
        records_upserted: u64,
        records_failed: u64,
    },
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: PipelineEvent);
}

/// Default sink: structured logs, plus an `error_logs` row for failures so
/// operators can query them after the fact.
pub struct LogSink {
    db: IngestDb,
}

impl LogSink {
    pub fn new(db: IngestDb) -> Self {
        Self { db }
    }

    async fn persist(&self, feed_id: &str, run_id: &str, component: &str, message: &str) {
        if let Err(e) = self
            .db
            .insert_error_log(
                Some(feed_id),
                Some(run_id),
                component,
                message,
                None,
                Utc::now(),
            )
            .await
        {
            warn!(error = %e, "failed to persist error log");
        }
    }
}

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::RunFailed {
                feed_id,
                run_id,
                message,
            } => {
                error!(feed = %feed_id, run = %run_id, message = %message, "run failed");
                self.persist(&feed_id, &run_id, "run", &message).await;
            }
            PipelineEvent::RunPartial {
                feed_id,
                run_id,
                failed_workers,
            } => {
                warn!(
                    feed = %feed_id,
                    run = %run_id,
                    failed_workers,
                    "run finished with partition failures"
                );
                self.persist(
                    &feed_id,
                    &run_id,
                    "worker",
                    &format!("{failed_workers} partition(s) failed"),
                )
                .await;
            }
            PipelineEvent::ConsolidationSkipped {
                feed_id,
                run_id,
                reason,
            } => {
                warn!(feed = %feed_id, run = %run_id, reason = %reason, "consolidation skipped");
                self.persist(&feed_id, &run_id, "consolidator", &reason).await;
            }
            PipelineEvent::RunConsolidated {
                feed_id,
                run_id,
                records_upserted,
                records_failed,
            } => {
                info!(
                    feed = %feed_id,
                    run = %run_id,
                    records_upserted,
                    records_failed,
                    "run consolidated"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn failure_events_are_persisted() {
        let dir = tempdir().unwrap();
        let db = IngestDb::new(dir.path().join("n.db").to_str().unwrap()).unwrap();
        let sink = LogSink::new(db.clone());

        sink.notify(PipelineEvent::RunFailed {
            feed_id: "demo".into(),
            run_id: "r1".into(),
            message: "boom".into(),
        })
        .await;
        sink.notify(PipelineEvent::RunConsolidated {
            feed_id: "demo".into(),
            run_id: "r1".into(),
            records_upserted: 10,
            records_failed: 0,
        })
        .await;

        // Only the failure produced a row.
        assert_eq!(db.error_log_count().await.unwrap(), 1);
    }
}
