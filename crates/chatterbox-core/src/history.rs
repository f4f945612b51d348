//! Message store trait and libSQL implementation.
//!
//! The durable conversation log lives behind the [`MessageStore`] trait so
//! the relay never touches the storage engine directly. Records are
//! immutable once persisted; ordering is `(timestamp, insertion sequence)`
//! ascending, where the insertion sequence is the store's rowid.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::Connection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Errors from the durable message store.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<libsql::Error> for StorageError {
    fn from(e: libsql::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// A persisted conversation record.
///
/// `event_type` and `duration_secs` are set on call-log rows (a completed
/// call leaves a `"call"` record with its duration in the conversation).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    /// Time-sortable UUID v7, assigned by the store.
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<i64>,
}

/// A record to persist. Id and timestamp are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender: String,
    pub recipient: String,
    pub text: String,
    pub event_type: Option<String>,
    pub duration_secs: Option<i64>,
}

impl NewMessage {
    /// A plain chat message.
    pub fn chat(sender: &str, recipient: &str, text: &str) -> Self {
        Self {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            text: text.to_string(),
            event_type: None,
            duration_secs: None,
        }
    }

    /// A call-log record left in the conversation after a call ends.
    pub fn call_log(caller: &str, callee: &str, description: &str, duration_secs: i64) -> Self {
        Self {
            sender: caller.to_string(),
            recipient: callee.to_string(),
            text: description.to_string(),
            event_type: Some("call".to_string()),
            duration_secs: Some(duration_secs),
        }
    }
}

/// Trait for durable conversation storage backends.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a record. The durable write completes and assigns id and
    /// timestamp before the caller attempts any delivery, so an
    /// acknowledged-but-undelivered message is still recoverable.
    async fn store_message(&self, message: NewMessage) -> Result<MessageRecord, StorageError>;

    /// Records exchanged between exactly this pair of users (either
    /// orientation), ascending by `(timestamp, insertion sequence)`,
    /// capped at the `limit` most recent. Never leaks other pairs.
    async fn fetch_history(
        &self,
        user_a: &str,
        user_b: &str,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, StorageError>;

    /// Liveness check for the health probe.
    async fn ping(&self) -> Result<(), StorageError>;
}

/// libSQL-based message store.
///
/// Works against a file-backed or in-memory database; the in-memory case
/// requires holding one persistent connection, hence the shared handle.
#[derive(Clone)]
pub struct LibSqlMessageStore {
    conn: Arc<Mutex<Connection>>,
    initialized: Arc<std::sync::atomic::AtomicBool>,
}

/// SQL schema for the conversation log.
pub const MESSAGES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    -- Insertion sequence: tiebreaker for records sharing a timestamp
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    -- UUID v7 (time-sortable), the identity clients deduplicate by
    id TEXT NOT NULL UNIQUE,
    sender TEXT NOT NULL,
    recipient TEXT NOT NULL,
    body TEXT NOT NULL,
    -- RFC 3339 UTC
    timestamp TEXT NOT NULL,
    -- NULL for chat messages, 'call' for call-log rows
    event_type TEXT,
    duration_secs INTEGER
);

-- Pair lookup in either orientation hits one of these
CREATE INDEX IF NOT EXISTS idx_messages_pair
    ON messages(sender, recipient, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_messages_pair_rev
    ON messages(recipient, sender, timestamp DESC);
"#;

impl LibSqlMessageStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            initialized: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Apply the schema if not already done.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), StorageError> {
        if self.initialized.load(std::sync::atomic::Ordering::Acquire) {
            return Ok(());
        }

        let conn = self.conn.lock().await;
        conn.execute_batch(MESSAGES_SCHEMA).await?;

        self.initialized
            .store(true, std::sync::atomic::Ordering::Release);
        debug!("Message store schema initialized");
        Ok(())
    }

    fn generate_id() -> String {
        Uuid::now_v7().to_string()
    }
}

#[async_trait]
impl MessageStore for LibSqlMessageStore {
    #[instrument(skip(self, message), fields(sender = %message.sender, recipient = %message.recipient))]
    async fn store_message(&self, message: NewMessage) -> Result<MessageRecord, StorageError> {
        self.initialize().await?;

        let id = Self::generate_id();
        let timestamp = Utc::now();

        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO messages (id, sender, recipient, body, timestamp, event_type, duration_secs)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            (
                id.as_str(),
                message.sender.as_str(),
                message.recipient.as_str(),
                message.text.as_str(),
                timestamp.to_rfc3339(),
                message.event_type.as_deref(),
                message.duration_secs,
            ),
        )
        .await?;

        debug!(id = %id, "Message persisted");

        Ok(MessageRecord {
            id,
            sender: message.sender,
            recipient: message.recipient,
            text: message.text,
            timestamp,
            event_type: message.event_type,
            duration_secs: message.duration_secs,
        })
    }

    #[instrument(skip(self), fields(user_a = %user_a, user_b = %user_b))]
    async fn fetch_history(
        &self,
        user_a: &str,
        user_b: &str,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        self.initialize().await?;

        let conn = self.conn.lock().await;

        // The inner query picks the most recent `limit` records for the
        // pair; the outer one flips them back into ascending order.
        let mut rows = conn
            .query(
                r#"
                SELECT id, sender, recipient, body, timestamp, event_type, duration_secs
                FROM (
                    SELECT seq, id, sender, recipient, body, timestamp, event_type, duration_secs
                    FROM messages
                    WHERE (sender = ?1 AND recipient = ?2)
                       OR (sender = ?2 AND recipient = ?1)
                    ORDER BY timestamp DESC, seq DESC
                    LIMIT ?3
                )
                ORDER BY timestamp ASC, seq ASC
                "#,
                (user_a, user_b, limit as i64),
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            let id: String = row.get(0)?;
            let sender: String = row.get(1)?;
            let recipient: String = row.get(2)?;
            let text: String = row.get(3)?;
            let timestamp_str: String = row.get(4)?;
            let event_type: Option<String> = row.get(5).ok();
            let duration_secs: Option<i64> = row.get(6).ok();

            let timestamp = DateTime::parse_from_rfc3339(&timestamp_str)
                .map_err(|e| StorageError::Corrupt(format!("invalid timestamp: {}", e)))?
                .with_timezone(&Utc);

            records.push(MessageRecord {
                id,
                sender,
                recipient,
                text,
                timestamp,
                event_type,
                duration_secs,
            });
        }

        debug!(count = records.len(), "History fetched");
        Ok(records)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.query("SELECT 1", ()).await?;
        Ok(())
    }
}
