use chrono::{TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;
use uuid::Uuid;

use super::DbPool;
use crate::store::{ChunkMessage, MessageQueue};
use crate::types::error::Result;

/// SQLite-backed chunk queue
///
/// The external channel delivers chunk messages with [`SqliteMessageQueue::deliver`];
/// the engine reads them through [`MessageQueue`].
pub struct SqliteMessageQueue {
    pool: DbPool,
    queue: String,
}

impl SqliteMessageQueue {
    pub fn new(pool: DbPool, queue: &str) -> Self {
        Self {
            pool,
            queue: queue.to_string(),
        }
    }

    /// Store a message, replacing the content of an existing message with the
    /// same subject. Every delivery makes the message the newest in the queue.
    pub fn deliver(&self, subject: &str, body: &str, location: &str) -> Result<String> {
        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;
        let now = Utc::now().timestamp_millis();

        let revision: i64 = tx.query_row(
            "SELECT COALESCE(MAX(revision), 0) + 1 FROM queue_messages",
            [],
            |row| row.get(0),
        )?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT entry_id FROM queue_messages WHERE queue = ?1 AND subject = ?2",
                params![self.queue, subject],
                |row| row.get(0),
            )
            .optional()?;

        let entry_id = match existing {
            Some(entry_id) => {
                tx.execute(
                    "UPDATE queue_messages
                     SET body = ?1, location = ?2, revision = ?3, modified_at = ?4
                     WHERE entry_id = ?5",
                    params![body, location, revision, now, entry_id],
                )?;
                entry_id
            }
            None => {
                let entry_id = Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO queue_messages (entry_id, queue, subject, body, location, revision, modified_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![entry_id, self.queue, subject, body, location, revision, now],
                )?;
                entry_id
            }
        };

        tx.commit()?;
        debug!("Delivered {} to queue {} as {}", subject, self.queue, entry_id);
        Ok(entry_id)
    }

    /// Remove a message from the queue
    pub fn remove(&self, entry_id: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM queue_messages WHERE entry_id = ?1 AND queue = ?2",
            params![entry_id, self.queue],
        )?;
        Ok(())
    }

    fn row_to_message(row: &Row) -> rusqlite::Result<ChunkMessage> {
        let modified_ms: i64 = row.get(5)?;
        Ok(ChunkMessage {
            entry_id: row.get(0)?,
            subject: row.get(1)?,
            body: row.get(2)?,
            location: row.get(3)?,
            revision: row.get(4)?,
            modified_at: Utc
                .timestamp_millis_opt(modified_ms)
                .single()
                .unwrap_or_else(Utc::now),
        })
    }
}

impl MessageQueue for SqliteMessageQueue {
    fn entry_ids(&self) -> Result<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT entry_id FROM queue_messages WHERE queue = ?1 ORDER BY revision ASC",
        )?;
        let ids = stmt
            .query_map(params![self.queue], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    fn newest(&self, limit: usize) -> Result<Vec<ChunkMessage>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT entry_id, subject, body, location, revision, modified_at
             FROM queue_messages WHERE queue = ?1
             ORDER BY revision DESC LIMIT ?2",
        )?;
        let messages = stmt
            .query_map(params![self.queue, limit as i64], Self::row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    fn get(&self, entry_id: &str) -> Result<Option<ChunkMessage>> {
        let conn = self.pool.get()?;
        let message = conn
            .query_row(
                "SELECT entry_id, subject, body, location, revision, modified_at
                 FROM queue_messages WHERE entry_id = ?1 AND queue = ?2",
                params![entry_id, self.queue],
                Self::row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    fn property(&self, entry_id: &str, name: &str) -> Result<Option<String>> {
        let conn = self.pool.get()?;
        let value = conn
            .query_row(
                "SELECT value FROM queue_message_properties WHERE entry_id = ?1 AND name = ?2",
                params![entry_id, name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_property(&self, entry_id: &str, name: &str, value: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO queue_message_properties (entry_id, name, value)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(entry_id, name) DO UPDATE SET value = excluded.value",
            params![entry_id, name, value],
        )?;
        Ok(())
    }
}
