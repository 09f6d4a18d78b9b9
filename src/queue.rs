//! Durable at-least-once queues.
//!
//! Messages live in a SQLite table and are leased on receive: `visible_at`
//! jumps forward by the visibility timeout, so a consumer that crashes
//! mid-message simply lets the lease lapse and the message is redelivered.
//! `ack` deletes; `abandon` makes the message visible again immediately.
//! Delivery counts travel with the lease so consumers can spot hot-looping
//! messages.
//!
//! Every entry is a JSON envelope `{"type": ..., "payload": ...}`; consumers
//! validate the tag before touching the payload.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const WORK_ITEMS: &str = "work-items";
pub const WORK_DONE: &str = "work-done";
pub const CONSOLIDATE: &str = "consolidate";

pub const TYPE_WORK_ITEM: &str = "work_item";
pub const TYPE_WORK_DONE: &str = "work_done";
pub const TYPE_CONSOLIDATE: &str = "consolidate";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "type")]
    type_tag: String,
    payload: T,
}

/// A message held under lease. Dropping it without `ack` lets the lease
/// expire and the queue redeliver.
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: i64,
    pub token: String,
    pub queue: String,
    pub body: String,
    pub delivery_count: i64,
}

#[derive(Debug)]
pub enum QueueError {
    TypeMismatch { expected: String, actual: String },
    Malformed(serde_json::Error),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TypeMismatch { expected, actual } => {
                write!(f, "expected message type '{}', got '{}'", expected, actual)
            }
            Self::Malformed(e) => write!(f, "malformed queue message: {}", e),
        }
    }
}

impl std::error::Error for QueueError {}

#[derive(Clone)]
pub struct QueueStore {
    conn: Arc<Mutex<Connection>>,
}

impl QueueStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open queue db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "busy_timeout", 5_000).ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS queue_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                body TEXT NOT NULL,
                enqueued_at INTEGER NOT NULL,
                visible_at INTEGER NOT NULL,
                lease_token TEXT,
                delivery_count INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_queue_messages_visible
             ON queue_messages(queue, visible_at, id)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn send<T: Serialize>(&self, queue: &str, type_tag: &str, payload: &T) -> Result<i64> {
        let body = serde_json::to_string(&Envelope {
            type_tag: type_tag.to_string(),
            payload,
        })?;
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO queue_messages (queue, body, enqueued_at, visible_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![queue, body, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Lease the oldest visible message, if any. Expired leases need no
    /// separate reaper: a lapsed `visible_at` makes the row deliverable
    /// right here.
    pub async fn receive(&self, queue: &str, visibility_secs: i64) -> Result<Option<Lease>> {
        let now = Utc::now().timestamp();
        let token = Uuid::new_v4().to_string();
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "UPDATE queue_messages
             SET lease_token = ?1, visible_at = ?2, delivery_count = delivery_count + 1
             WHERE id = (
                SELECT id FROM queue_messages
                WHERE queue = ?3 AND visible_at <= ?4
                ORDER BY id ASC LIMIT 1
             )
             RETURNING id, body, delivery_count",
        )?;
        let mut rows = stmt.query(params![token, now + visibility_secs, queue, now])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(Lease {
            id: row.get(0)?,
            token: token.clone(),
            queue: queue.to_string(),
            body: row.get(1)?,
            delivery_count: row.get(2)?,
        }))
    }

    /// Delete the message; only the current lease holder succeeds.
    pub async fn ack(&self, lease: &Lease) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "DELETE FROM queue_messages WHERE id = ?1 AND lease_token = ?2",
            params![lease.id, lease.token],
        )?;
        Ok(n == 1)
    }

    /// Give the message back for immediate redelivery.
    pub async fn abandon(&self, lease: &Lease) -> Result<bool> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE queue_messages SET visible_at = ?3, lease_token = NULL
             WHERE id = ?1 AND lease_token = ?2",
            params![lease.id, lease.token, now],
        )?;
        Ok(n == 1)
    }

    /// Messages on a queue, leased or not. Observability and tests.
    pub async fn depth(&self, queue: &str) -> Result<u64> {
        let conn = self.conn.lock().await;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue_messages WHERE queue = ?1",
            params![queue],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }
}

/// Validate the envelope's type tag and deserialize the payload.
pub fn decode<T: DeserializeOwned>(lease: &Lease, expected: &str) -> Result<T, QueueError> {
    let envelope: Envelope<serde_json::Value> =
        serde_json::from_str(&lease.body).map_err(QueueError::Malformed)?;
    if envelope.type_tag != expected {
        return Err(QueueError::TypeMismatch {
            expected: expected.to_string(),
            actual: envelope.type_tag,
        });
    }
    serde_json::from_value(envelope.payload).map_err(QueueError::Malformed)
}
