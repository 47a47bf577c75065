//! SQLite storage layer for chatmirror.
//!
//! Holds the durable message log, the contacts table and the derived
//! per-conversation aggregate. The ingest side and the query side each open
//! their own connection to the same WAL database, so readers only ever see
//! committed state.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::protocol::ConversationKind;

/// Rows written per staging transaction by [`Storage::upsert_messages_batch`].
pub const BATCH_CHUNK_SIZE: usize = 250;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// One persisted message. `payload` is the transport's JSON encoding of the
/// message content object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub message_id: String,
    pub conversation_id: String,
    pub timestamp: i64,
    pub payload: Vec<u8>,
    /// Stamped by the store on every write; ignored on input.
    pub received_at: i64,
}

impl MessageRecord {
    pub fn new(
        message_id: impl Into<String>,
        conversation_id: impl Into<String>,
        timestamp: i64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            conversation_id: conversation_id.into(),
            timestamp,
            payload,
            received_at: 0,
        }
    }

    fn validate(&self) -> Result<(), StorageError> {
        if self.message_id.is_empty() {
            return Err(StorageError::InvalidRecord(format!(
                "message in {} has an empty id",
                self.conversation_id
            )));
        }
        if self.conversation_id.is_empty() {
            return Err(StorageError::InvalidRecord(format!(
                "message {} has an empty conversation id",
                self.message_id
            )));
        }
        Ok(())
    }
}

/// Contact metadata. `None` fields leave the stored value unchanged on upsert.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRow {
    pub conversation_id: String,
    pub display_name: Option<String>,
    pub notify_name: Option<String>,
    pub avatar_url: Option<String>,
    pub status_text: Option<String>,
    pub updated_at: i64,
}

/// One entry of the conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub message_count: u64,
    pub latest_timestamp: i64,
    pub latest_message_id: String,
    pub display_name: Option<String>,
    pub notify_name: Option<String>,
    pub avatar_url: Option<String>,
    pub status_text: Option<String>,
    pub kind: ConversationKind,
}

// ---------------------------------------------------------------------------
// Storage handle
// ---------------------------------------------------------------------------

/// Main storage handle wrapping a SQLite connection.
pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Open or create a database at the given path. Creates schema if needed.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let storage = Self { conn };
        storage.set_busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        storage.create_schema()?;
        Ok(storage)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    /// How long a write waits for another connection's lock before failing.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<(), StorageError> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    fn create_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS messages (
                message_id      TEXT PRIMARY KEY CHECK (message_id <> ''),
                conversation_id TEXT NOT NULL CHECK (conversation_id <> ''),
                timestamp       INTEGER NOT NULL,
                payload         BLOB NOT NULL,
                received_at     INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation_time
                ON messages(conversation_id, timestamp, message_id);

            CREATE TABLE IF NOT EXISTS contacts (
                conversation_id TEXT PRIMARY KEY,
                display_name    TEXT,
                notify_name     TEXT,
                avatar_url      TEXT,
                status_text     TEXT,
                updated_at      INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Insert a message, or overwrite the stored copy when the id exists.
    pub fn upsert_message(&self, record: &MessageRecord) -> Result<(), StorageError> {
        record.validate()?;
        self.conn.execute(
            "INSERT INTO messages (message_id, conversation_id, timestamp, payload, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(message_id) DO UPDATE SET
                conversation_id = excluded.conversation_id,
                timestamp       = excluded.timestamp,
                payload         = excluded.payload,
                received_at     = excluded.received_at",
            params![
                record.message_id,
                record.conversation_id,
                record.timestamp,
                record.payload,
                now_secs(),
            ],
        )?;
        Ok(())
    }

    /// Upsert a batch of messages as one unit.
    ///
    /// Records are first copied into a connection-local staging table in
    /// chunks of [`BATCH_CHUNK_SIZE`], then merged into `messages` by a single
    /// statement in one transaction. Either every record lands or none does.
    /// Later duplicates of an id within the batch win.
    pub fn upsert_messages_batch(&self, records: &[MessageRecord]) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }

        self.conn.execute_batch(
            "CREATE TEMP TABLE IF NOT EXISTS staged_messages (
                seq             INTEGER PRIMARY KEY,
                message_id      TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                timestamp       INTEGER NOT NULL,
                payload         BLOB NOT NULL
            );
            DELETE FROM temp.staged_messages;",
        )?;

        let outcome = self.stage_and_publish(records);
        let cleared = self.conn.execute("DELETE FROM temp.staged_messages", []);
        outcome?;
        cleared?;
        Ok(())
    }

    fn stage_and_publish(&self, records: &[MessageRecord]) -> Result<(), StorageError> {
        let mut seq: i64 = 0;
        for chunk in records.chunks(BATCH_CHUNK_SIZE) {
            let tx = self.conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO temp.staged_messages
                     (seq, message_id, conversation_id, timestamp, payload)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for record in chunk {
                    record.validate()?;
                    stmt.execute(params![
                        seq,
                        record.message_id,
                        record.conversation_id,
                        record.timestamp,
                        record.payload,
                    ])?;
                    seq += 1;
                }
            }
            tx.commit()?;
        }

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO messages (message_id, conversation_id, timestamp, payload, received_at)
             SELECT message_id, conversation_id, timestamp, payload, ?1
             FROM temp.staged_messages WHERE true ORDER BY seq
             ON CONFLICT(message_id) DO UPDATE SET
                conversation_id = excluded.conversation_id,
                timestamp       = excluded.timestamp,
                payload         = excluded.payload,
                received_at     = excluded.received_at",
            params![now_secs()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Look up one message; both ids must match.
    pub fn get_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<Option<MessageRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT message_id, conversation_id, timestamp, payload, received_at
             FROM messages WHERE message_id = ?1 AND conversation_id = ?2",
        )?;
        let row = stmt
            .query_row(params![message_id, conversation_id], message_from_row)
            .optional()?;
        Ok(row)
    }

    /// Page through a conversation from the newest end.
    ///
    /// Returns up to `limit` messages in ascending time order. `offset` counts
    /// back from the most recent message: offset 0 is the latest `limit`
    /// messages, offset N the `limit` messages ending N positions earlier.
    pub fn get_page(
        &self,
        conversation_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(
            "SELECT message_id, conversation_id, timestamp, payload, received_at
             FROM messages WHERE conversation_id = ?1
             ORDER BY timestamp DESC, message_id DESC
             LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(
            params![conversation_id, limit as i64, offset as i64],
            message_from_row,
        )?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        result.reverse();
        Ok(result)
    }

    /// Every message of a conversation, oldest first.
    pub fn get_all_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT message_id, conversation_id, timestamp, payload, received_at
             FROM messages WHERE conversation_id = ?1
             ORDER BY timestamp ASC, message_id ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id], message_from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn message_count(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // -----------------------------------------------------------------------
    // Conversations
    // -----------------------------------------------------------------------

    /// One row per conversation with at least one message, most recently
    /// active first, joined with whatever contact metadata is known.
    pub fn get_conversation_list(&self) -> Result<Vec<ConversationSummary>, StorageError> {
        let sql = "
            SELECT
                m.conversation_id,
                COUNT(*) AS message_count,
                MAX(m.timestamp) AS latest_timestamp,
                (SELECT m2.message_id FROM messages m2
                 WHERE m2.conversation_id = m.conversation_id
                 ORDER BY m2.timestamp DESC, m2.message_id DESC LIMIT 1) AS latest_message_id,
                c.display_name,
                c.notify_name,
                c.avatar_url,
                c.status_text
            FROM messages m
            LEFT JOIN contacts c ON c.conversation_id = m.conversation_id
            GROUP BY m.conversation_id
            ORDER BY latest_timestamp DESC, m.conversation_id ASC
        ";

        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| {
            let conversation_id: String = row.get(0)?;
            let kind = ConversationKind::from_conversation_id(&conversation_id);
            Ok(ConversationSummary {
                conversation_id,
                message_count: row.get::<_, i64>(1)? as u64,
                latest_timestamp: row.get(2)?,
                latest_message_id: row.get(3)?,
                display_name: row.get(4)?,
                notify_name: row.get(5)?,
                avatar_url: row.get(6)?,
                status_text: row.get(7)?,
                kind,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Contacts
    // -----------------------------------------------------------------------

    /// Insert a contact or merge the present fields into the stored row.
    pub fn upsert_contact(&self, contact: &ContactRow) -> Result<(), StorageError> {
        upsert_contact_on(&self.conn, contact)
    }

    /// Apply several contact upserts in one transaction.
    pub fn upsert_contacts(&self, contacts: &[ContactRow]) -> Result<(), StorageError> {
        if contacts.is_empty() {
            return Ok(());
        }
        let tx = self.conn.unchecked_transaction()?;
        for contact in contacts {
            upsert_contact_on(&tx, contact)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_contact(&self, conversation_id: &str) -> Result<Option<ContactRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT conversation_id, display_name, notify_name, avatar_url, status_text, updated_at
             FROM contacts WHERE conversation_id = ?1",
        )?;
        let row = stmt
            .query_row(params![conversation_id], contact_from_row)
            .optional()?;
        Ok(row)
    }

    pub fn list_contacts(&self) -> Result<Vec<ContactRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT conversation_id, display_name, notify_name, avatar_url, status_text, updated_at
             FROM contacts ORDER BY conversation_id",
        )?;
        let rows = stmt.query_map([], contact_from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn upsert_contact_on(conn: &Connection, contact: &ContactRow) -> Result<(), StorageError> {
    if contact.conversation_id.is_empty() {
        return Err(StorageError::InvalidRecord(
            "contact has an empty conversation id".to_string(),
        ));
    }
    conn.execute(
        "INSERT INTO contacts
         (conversation_id, display_name, notify_name, avatar_url, status_text, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(conversation_id) DO UPDATE SET
            display_name = COALESCE(excluded.display_name, contacts.display_name),
            notify_name  = COALESCE(excluded.notify_name, contacts.notify_name),
            avatar_url   = COALESCE(excluded.avatar_url, contacts.avatar_url),
            status_text  = COALESCE(excluded.status_text, contacts.status_text),
            updated_at   = excluded.updated_at",
        params![
            contact.conversation_id,
            contact.display_name,
            contact.notify_name,
            contact.avatar_url,
            contact.status_text,
            contact.updated_at,
        ],
    )?;
    Ok(())
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        message_id: row.get(0)?,
        conversation_id: row.get(1)?,
        timestamp: row.get(2)?,
        payload: row.get(3)?,
        received_at: row.get(4)?,
    })
}

fn contact_from_row(row: &Row<'_>) -> rusqlite::Result<ContactRow> {
    Ok(ContactRow {
        conversation_id: row.get(0)?,
        display_name: row.get(1)?,
        notify_name: row.get(2)?,
        avatar_url: row.get(3)?,
        status_text: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Resolve the database path: `{data_dir}/chatmirror.db`.
pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("chatmirror.db")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
