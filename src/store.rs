use crate::marketplace::Attachment;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::collections::HashSet;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// Threads with this id prefix were written by an abandoned early code path
/// and are purged at the start of every sync.
pub const PLACEHOLDER_PREFIX: &str = "stub-";

/// Cached thread preview length, before the ellipsis.
pub const PREVIEW_MAX: usize = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate key (concurrent write on the same record)")]
    Conflict,
    #[error(transparent)]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err
            && db.is_unique_violation()
        {
            return StoreError::Conflict;
        }
        StoreError::Database(err)
    }
}

/// The four persisted sync cursors. Keeping them a closed enum (instead of
/// free-form strings) prevents cross-assignment between time- and
/// offset-valued cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKey {
    /// When the last sync of any kind finished successfully.
    LastSyncAt,
    /// Member-channel incremental high-water mark (next fetch's lower bound).
    MemberHighWater,
    /// When the last full member-channel pass finished.
    LastFullSyncAt,
    /// System-channel pagination offset for the rolling historical pass.
    SystemPageOffset,
}

impl CursorKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            CursorKey::LastSyncAt => "messages.last_sync_at",
            CursorKey::MemberHighWater => "messages.member_high_water",
            CursorKey::LastFullSyncAt => "messages.last_full_sync_at",
            CursorKey::SystemPageOffset => "messages.system_page_offset",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderClass {
    Buyer,
    Seller,
    System,
}

impl SenderClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderClass::Buyer => "buyer",
            SenderClass::Seller => "seller",
            SenderClass::System => "system",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ThreadRow {
    pub thread_id: String,
    pub counterparty: Option<String>,
    pub reference_item_id: Option<String>,
    pub reference_order_id: Option<String>,
    pub is_flagged: bool,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub message_count: i64,
    pub unread_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub message_id: String,
    pub thread_id: String,
    pub sender_class: String,
    pub sender_name: Option<String>,
    pub subject: Option<String>,
    pub content: String,
    pub attachments: Option<String>,
    pub is_read: bool,
    pub detected_language: Option<String>,
    pub translated_content: Option<String>,
    pub external_created_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl MessageRow {
    /// Attachment list decoded from the JSON column; empty when absent.
    pub fn attachment_list(&self) -> Vec<Attachment> {
        self.attachments
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct NewThread {
    pub thread_id: String,
    pub counterparty: Option<String>,
    pub reference_item_id: Option<String>,
    pub reference_order_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub message_id: String,
    pub thread_id: String,
    pub sender_class: SenderClass,
    pub sender_name: Option<String>,
    pub subject: Option<String>,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub is_read: bool,
    pub external_created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadFilter {
    #[default]
    All,
    Unread,
    Flagged,
}

#[derive(Clone)]
pub struct MessageStore {
    pool: SqlitePool,
}

impl MessageStore {
    /// Open (creating if missing) the database and apply the schema.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(StoreError::Database)?
            .create_if_missing(true)
            .foreign_keys(true);
        // A shared-nothing in-memory database must stay on one connection.
        let max_connections = if url.contains(":memory:") {
            1
        } else {
            pool_size_from_env()
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS threads (
                thread_id TEXT PRIMARY KEY,
                counterparty TEXT,
                reference_item_id TEXT,
                reference_order_id TEXT,
                is_flagged INTEGER NOT NULL DEFAULT 0,
                last_message_preview TEXT,
                last_message_at TEXT,
                message_count INTEGER NOT NULL DEFAULT 0,
                unread_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL
                    REFERENCES threads(thread_id) ON DELETE CASCADE,
                sender_class TEXT NOT NULL,
                sender_name TEXT,
                subject TEXT,
                content TEXT NOT NULL,
                attachments TEXT,
                is_read INTEGER NOT NULL DEFAULT 0,
                detected_language TEXT,
                translated_content TEXT,
                external_created_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_cursors (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>, StoreError> {
        Ok(self.pool.begin().await?)
    }

    pub async fn get_thread(&self, thread_id: &str) -> Result<Option<ThreadRow>, StoreError> {
        let row = sqlx::query_as::<_, ThreadRow>("SELECT * FROM threads WHERE thread_id = ?")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Thread summaries from cached rollups, newest activity first.
    pub async fn list_threads(&self, filter: ThreadFilter) -> Result<Vec<ThreadRow>, StoreError> {
        let base = "SELECT * FROM threads";
        let order = " ORDER BY COALESCE(last_message_at, created_at) DESC";
        let sql = match filter {
            ThreadFilter::All => format!("{base}{order}"),
            ThreadFilter::Unread => format!("{base} WHERE unread_count > 0{order}"),
            ThreadFilter::Flagged => format!("{base} WHERE is_flagged = 1{order}"),
        };
        let rows = sqlx::query_as::<_, ThreadRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// All messages of a thread in external-timestamp order.
    pub async fn thread_messages(&self, thread_id: &str) -> Result<Vec<MessageRow>, StoreError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE thread_id = ?
             ORDER BY external_created_at ASC, message_id ASC",
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Direct unread count across all threads; intentionally not derived from
    /// the cached rollups so status polling stays honest.
    pub async fn total_unread(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE is_read = 0")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Returns false when the thread does not exist.
    pub async fn set_thread_flag(&self, thread_id: &str, flagged: bool) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE threads SET is_flagged = ? WHERE thread_id = ?")
            .bind(flagged)
            .bind(thread_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark every message of a thread read and zero the cached unread count.
    pub async fn mark_thread_read(&self, thread_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE messages SET is_read = 1 WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE threads SET unread_count = 0 WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Delete placeholder threads and their messages. Runs at the start of
    /// every sync; real threads are never touched.
    pub async fn purge_placeholder_threads(&self) -> Result<u64, StoreError> {
        let pattern = format!("{PLACEHOLDER_PREFIX}%");
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE thread_id LIKE ?")
            .bind(&pattern)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM threads WHERE thread_id LIKE ?")
            .bind(&pattern)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        let purged = result.rows_affected();
        if purged > 0 {
            debug!(target = "sellerdesk.store", purged, "placeholder threads removed");
        }
        Ok(purged)
    }

    pub async fn get_cursor(&self, key: CursorKey) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM sync_cursors WHERE key = ?")
                .bind(key.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(value,)| value))
    }

    pub async fn set_cursor(&self, key: CursorKey, value: &str) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::set_cursor_tx(&mut conn, key, value).await
    }

    /// Cursor write usable inside a page transaction, so offsets only advance
    /// together with the data they describe.
    pub async fn set_cursor_tx(
        conn: &mut SqliteConnection,
        key: CursorKey,
        value: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_cursors (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key.as_str())
        .bind(value)
        .bind(Utc::now())
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn get_time_cursor(
        &self,
        key: CursorKey,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let raw = self.get_cursor(key).await?;
        Ok(raw
            .as_deref()
            .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    pub async fn set_time_cursor(
        &self,
        key: CursorKey,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.set_cursor(key, &at.to_rfc3339()).await
    }

    pub async fn get_offset_cursor(&self, key: CursorKey) -> Result<u32, StoreError> {
        let raw = self.get_cursor(key).await?;
        Ok(raw
            .as_deref()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(0))
    }

    /// Insert-if-absent; on an existing thread only a previously-unset
    /// counterparty may be filled in. Returns true when a row was created.
    pub async fn upsert_thread(
        conn: &mut SqliteConnection,
        thread: &NewThread,
    ) -> Result<bool, StoreError> {
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT thread_id FROM threads WHERE thread_id = ?")
                .bind(&thread.thread_id)
                .fetch_optional(&mut *conn)
                .await?;
        if existing.is_some() {
            if thread.counterparty.is_some() {
                sqlx::query(
                    "UPDATE threads SET counterparty = ?
                     WHERE thread_id = ? AND counterparty IS NULL",
                )
                .bind(&thread.counterparty)
                .bind(&thread.thread_id)
                .execute(&mut *conn)
                .await?;
            }
            return Ok(false);
        }
        sqlx::query(
            r#"
            INSERT INTO threads (
                thread_id, counterparty, reference_item_id, reference_order_id,
                is_flagged, message_count, unread_count, created_at
            ) VALUES (?, ?, ?, ?, 0, 0, 0, ?)
            "#,
        )
        .bind(&thread.thread_id)
        .bind(&thread.counterparty)
        .bind(&thread.reference_item_id)
        .bind(&thread.reference_order_id)
        .bind(thread.created_at)
        .execute(&mut *conn)
        .await?;
        Ok(true)
    }

    /// Which of the given external message ids already exist. Batched IN
    /// lookups instead of per-row round trips.
    pub async fn existing_message_ids(
        conn: &mut SqliteConnection,
        ids: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        let mut found = HashSet::new();
        for chunk in ids.chunks(400) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql =
                format!("SELECT message_id FROM messages WHERE message_id IN ({placeholders})");
            let mut query = sqlx::query_as::<_, (String,)>(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            for (id,) in query.fetch_all(&mut *conn).await? {
                found.insert(id);
            }
        }
        Ok(found)
    }

    pub async fn insert_message(
        conn: &mut SqliteConnection,
        message: &NewMessage,
    ) -> Result<(), StoreError> {
        let attachments = if message.attachments.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&message.attachments).unwrap_or_default())
        };
        sqlx::query(
            r#"
            INSERT INTO messages (
                message_id, thread_id, sender_class, sender_name, subject,
                content, attachments, is_read, external_created_at, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.message_id)
        .bind(&message.thread_id)
        .bind(message.sender_class.as_str())
        .bind(&message.sender_name)
        .bind(&message.subject)
        .bind(&message.content)
        .bind(attachments)
        .bind(message.is_read)
        .bind(message.external_created_at)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Re-observation of a known message only refreshes the volatile fields;
    /// content, subject and sender are never overwritten so local edits
    /// (translations, read-state corrections) survive re-sync.
    pub async fn refresh_message_volatile(
        conn: &mut SqliteConnection,
        message_id: &str,
        is_read: bool,
        attachments: &[Attachment],
    ) -> Result<(), StoreError> {
        let encoded = if attachments.is_empty() {
            None
        } else {
            Some(serde_json::to_string(attachments).unwrap_or_default())
        };
        sqlx::query("UPDATE messages SET is_read = ?, attachments = ? WHERE message_id = ?")
            .bind(is_read)
            .bind(encoded)
            .bind(message_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Recompute a thread's cached rollup from its stored messages: counts as
    /// aggregates, preview/last-at from the newest row. Deriving from storage
    /// (rather than a caller-passed subset) keeps the counts exact no matter
    /// how partial the caller's view was.
    pub async fn recompute_thread_rollup(
        conn: &mut SqliteConnection,
        thread_id: &str,
    ) -> Result<(), StoreError> {
        let (count, unread): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN is_read = 0 THEN 1 ELSE 0 END), 0)
             FROM messages WHERE thread_id = ?",
        )
        .bind(thread_id)
        .fetch_one(&mut *conn)
        .await?;
        let newest: Option<(String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT content, external_created_at FROM messages WHERE thread_id = ?
             ORDER BY external_created_at DESC, message_id DESC LIMIT 1",
        )
        .bind(thread_id)
        .fetch_optional(&mut *conn)
        .await?;
        let (preview, last_at) = match newest {
            Some((content, at)) => (Some(preview_of(&content)), Some(at)),
            None => (None, None),
        };
        sqlx::query(
            "UPDATE threads SET
                message_count = ?, unread_count = ?,
                last_message_preview = ?, last_message_at = ?
             WHERE thread_id = ?",
        )
        .bind(count)
        .bind(unread)
        .bind(preview)
        .bind(last_at)
        .bind(thread_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

/// Bounded preview of message content for the thread list.
pub fn preview_of(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.chars().count() > PREVIEW_MAX {
        let mut out: String = trimmed.chars().take(PREVIEW_MAX - 3).collect();
        out.push('…');
        out
    } else {
        trimmed.to_string()
    }
}

fn pool_size_from_env() -> u32 {
    std::env::var("DB_POOL_SIZE")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(5)
}
