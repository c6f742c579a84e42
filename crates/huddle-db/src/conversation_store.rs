use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use huddle_common::{Error, Message, Result};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::DEFAULT_CONVERSATION_TTL;
use crate::migrations;

/// Per-conversation ordered message log.
///
/// Implementations own the log: callers re-read it instead of caching, and every
/// mutation is persisted before the call returns. A conversation comes into existence
/// on its first append and disappears once it has been idle for longer than the TTL.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Full log in order; empty for unknown or expired conversations.
    async fn get(&self, conversation_id: &str) -> Result<Vec<Message>>;

    async fn append(&self, conversation_id: &str, message: &Message) -> Result<()>;

    /// Atomically swap the whole log.
    async fn replace(&self, conversation_id: &str, messages: &[Message]) -> Result<()>;

    /// Drop every expired conversation, returning how many were removed.
    async fn purge_expired(&self) -> Result<usize>;
}

/// SQLite-backed conversation store.
pub struct SqliteConversationStore {
    conn: Mutex<Connection>,
    ttl: Duration,
}

impl SqliteConversationStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening conversation store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        migrations::apply(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            ttl: DEFAULT_CONVERSATION_TTL,
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn cutoff(&self) -> String {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        format_timestamp(cutoff)
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn get(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let cutoff = self.cutoff();
        let mut conn = self.conn.lock().await;
        let tx = begin(&mut conn)?;

        if purge_if_expired(&tx, conversation_id, &cutoff)? {
            commit(tx)?;
            return Ok(Vec::new());
        }

        let messages = {
            let mut stmt = tx
                .prepare(
                    "SELECT seq, payload FROM conversation_messages
                     WHERE conversation_id = ?1
                     ORDER BY seq ASC",
                )
                .map_err(|e| Error::Database(format!("failed to prepare message query: {e}")))?;

            let rows = stmt
                .query_map(params![conversation_id], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(|e| Error::Database(format!("failed to load messages: {e}")))?;

            let mut messages = Vec::new();
            for row in rows {
                let (seq, payload) = row
                    .map_err(|e| Error::Database(format!("failed to read message row: {e}")))?;
                let message: Message = serde_json::from_str(&payload).map_err(|e| {
                    Error::Database(format!(
                        "corrupt message {seq} in conversation {conversation_id}: {e}"
                    ))
                })?;
                messages.push(message);
            }
            messages
        };

        commit(tx)?;
        Ok(messages)
    }

    async fn append(&self, conversation_id: &str, message: &Message) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        let cutoff = self.cutoff();
        let now = format_timestamp(Utc::now());

        let mut conn = self.conn.lock().await;
        let tx = begin(&mut conn)?;

        purge_if_expired(&tx, conversation_id, &cutoff)?;
        touch_conversation(&tx, conversation_id, &now)?;

        let seq: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(seq), -1) + 1 FROM conversation_messages
                 WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(format!("failed to allocate sequence: {e}")))?;

        insert_message(&tx, conversation_id, seq, message, &payload, &now)?;
        commit(tx)?;

        debug!(
            "appended {} message #{seq} to conversation {conversation_id}",
            message.role()
        );
        Ok(())
    }

    async fn replace(&self, conversation_id: &str, messages: &[Message]) -> Result<()> {
        let payloads = messages
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let now = format_timestamp(Utc::now());

        let mut conn = self.conn.lock().await;
        let tx = begin(&mut conn)?;

        tx.execute(
            "DELETE FROM conversation_messages WHERE conversation_id = ?1",
            params![conversation_id],
        )
        .map_err(|e| Error::Database(format!("failed to clear conversation: {e}")))?;
        touch_conversation(&tx, conversation_id, &now)?;

        for (seq, (message, payload)) in messages.iter().zip(&payloads).enumerate() {
            insert_message(&tx, conversation_id, seq as i64, message, payload, &now)?;
        }

        commit(tx)?;
        info!(
            "replaced conversation {conversation_id} with {} messages",
            messages.len()
        );
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let cutoff = self.cutoff();
        let mut conn = self.conn.lock().await;
        let tx = begin(&mut conn)?;

        tx.execute(
            "DELETE FROM conversation_messages WHERE conversation_id IN
               (SELECT id FROM conversations WHERE updated_at < ?1)",
            params![cutoff],
        )
        .map_err(|e| Error::Database(format!("failed to purge messages: {e}")))?;
        let removed = tx
            .execute(
                "DELETE FROM conversations WHERE updated_at < ?1",
                params![cutoff],
            )
            .map_err(|e| Error::Database(format!("failed to purge conversations: {e}")))?;

        commit(tx)?;
        if removed > 0 {
            info!("purged {removed} expired conversations");
        }
        Ok(removed)
    }
}

fn begin(conn: &mut Connection) -> Result<Transaction<'_>> {
    conn.transaction()
        .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))
}

fn commit(tx: Transaction<'_>) -> Result<()> {
    tx.commit()
        .map_err(|e| Error::Database(format!("failed to commit transaction: {e}")))
}

/// Delete the conversation when its last update is older than `cutoff`.
fn purge_if_expired(tx: &Transaction<'_>, conversation_id: &str, cutoff: &str) -> Result<bool> {
    let updated_at: Option<String> = tx
        .query_row(
            "SELECT updated_at FROM conversations WHERE id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to read conversation: {e}")))?;

    let Some(updated_at) = updated_at else {
        return Ok(false);
    };
    if updated_at.as_str() >= cutoff {
        return Ok(false);
    }

    debug!(
        "conversation {conversation_id} expired (last update {})",
        parse_timestamp(&updated_at)
    );
    tx.execute(
        "DELETE FROM conversation_messages WHERE conversation_id = ?1",
        params![conversation_id],
    )
    .map_err(|e| Error::Database(format!("failed to purge conversation: {e}")))?;
    tx.execute(
        "DELETE FROM conversations WHERE id = ?1",
        params![conversation_id],
    )
    .map_err(|e| Error::Database(format!("failed to purge conversation: {e}")))?;
    Ok(true)
}

fn touch_conversation(tx: &Transaction<'_>, conversation_id: &str, now: &str) -> Result<()> {
    tx.execute(
        "INSERT INTO conversations (id, created_at, updated_at)
         VALUES (?1, ?2, ?2)
         ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
        params![conversation_id, now],
    )
    .map_err(|e| Error::Database(format!("failed to upsert conversation: {e}")))?;
    Ok(())
}

fn insert_message(
    tx: &Transaction<'_>,
    conversation_id: &str,
    seq: i64,
    message: &Message,
    payload: &str,
    now: &str,
) -> Result<()> {
    tx.execute(
        "INSERT INTO conversation_messages (conversation_id, seq, role, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![conversation_id, seq, message.role(), payload, now],
    )
    .map_err(|e| Error::Database(format!("failed to append message: {e}")))?;
    Ok(())
}

/// Fixed-width UTC timestamps so they order lexicographically.
fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            warn!("failed to parse timestamp '{value}': {e}, falling back to now");
            Utc::now()
        })
}
