//! SQLite backend.
//!
//! One database file with three tables:
//! - `conversations` — one row per conversation, soft-deleted via `deleted_at`
//! - `messages` — committed messages; JSON columns hold payload and snapshots
//! - `progress` — one merged progress record per conversation
//!
//! Progress updates run inside a transaction behind a process-wide write
//! lock so the merge is an atomic read-modify-write.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dialoguard_core::error::StoreError;
use dialoguard_core::{Conversation, ConversationId, ConversationStore, Message, ProgressRecord, Role};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, Sqlite, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub struct SqliteStore {
    pool: SqlitePool,
    progress_lock: Mutex<()>,
}

impl SqliteStore {
    /// Open (and create if missing) a database at `path`.
    ///
    /// Pass `"sqlite::memory:"` for an ephemeral database (useful for tests).
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?;

        // An in-memory database exists per connection, so keep exactly one
        let max_connections = if path.contains(":memory:") { 1 } else { 4 };

        let store = Self::connect(options, max_connections).await?;
        info!("SQLite conversation store initialized at {path}");
        Ok(store)
    }

    /// Open the database file at `path`, creating parent directories.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Storage(format!("Cannot create {}: {e}", parent.display())))?;
        }
        let store = Self::connect(SqliteConnectOptions::new().filename(path), 4).await?;
        info!(path = %path.display(), "SQLite conversation store initialized");
        Ok(store)
    }

    async fn connect(options: SqliteConnectOptions, max_connections: u32) -> Result<Self, StoreError> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        Self::from_pool(pool).await
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self {
            pool,
            progress_lock: Mutex::new(()),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        let statements = [
            (
                "conversations table",
                r#"
                CREATE TABLE IF NOT EXISTS conversations (
                    id             TEXT PRIMARY KEY,
                    user_id        TEXT NOT NULL,
                    model          TEXT NOT NULL,
                    blocked        INTEGER NOT NULL DEFAULT 0,
                    blocked_reason TEXT,
                    created_at     TEXT NOT NULL,
                    updated_at     TEXT NOT NULL,
                    deleted_at     TEXT
                )
                "#,
            ),
            (
                "messages table",
                r#"
                CREATE TABLE IF NOT EXISTS messages (
                    iid             INTEGER PRIMARY KEY AUTOINCREMENT,
                    id              TEXT UNIQUE NOT NULL,
                    conversation_id TEXT NOT NULL REFERENCES conversations(id),
                    role            TEXT NOT NULL,
                    content         TEXT NOT NULL,
                    payload         TEXT NOT NULL,
                    usage           TEXT,
                    raw_payload     TEXT,
                    context_sent    TEXT,
                    valid           INTEGER NOT NULL DEFAULT 1,
                    timestamp       TEXT NOT NULL
                )
                "#,
            ),
            (
                "progress table",
                r#"
                CREATE TABLE IF NOT EXISTS progress (
                    conversation_id TEXT PRIMARY KEY,
                    percentage      REAL NOT NULL DEFAULT 0.0,
                    topics          TEXT NOT NULL DEFAULT '{}',
                    pending_topic   TEXT,
                    updated_at      TEXT NOT NULL
                )
                "#,
            ),
            (
                "messages index",
                "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, iid)",
            ),
            (
                "conversations user index",
                "CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id)",
            ),
        ];

        for (label, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::MigrationFailed(format!("{label}: {e}")))?;
        }

        debug!("SQLite migrations complete");
        Ok(())
    }

    fn row_to_conversation(row: &SqliteRow) -> Result<Conversation, StoreError> {
        let blocked: i64 = column(row, "blocked")?;
        Ok(Conversation {
            id: ConversationId(column(row, "id")?),
            user_id: column(row, "user_id")?,
            model: column(row, "model")?,
            blocked: blocked != 0,
            blocked_reason: column(row, "blocked_reason")?,
            created_at: parse_time(&column::<String>(row, "created_at")?),
            updated_at: parse_time(&column::<String>(row, "updated_at")?),
            deleted_at: column::<Option<String>>(row, "deleted_at")?.map(|s| parse_time(&s)),
        })
    }

    fn row_to_message(row: &SqliteRow) -> Result<Message, StoreError> {
        let role: String = column(row, "role")?;
        let valid: i64 = column(row, "valid")?;
        let payload: String = column(row, "payload")?;

        Ok(Message {
            id: column(row, "id")?,
            conversation_id: ConversationId(column(row, "conversation_id")?),
            role: Role::from_str(&role).map_err(|e| StoreError::QueryFailed(format!("role column: {e}")))?,
            content: column(row, "content")?,
            payload: serde_json::from_str(&payload).unwrap_or_default(),
            usage: json_column(row, "usage")?,
            raw_payload: json_column(row, "raw_payload")?,
            context_sent: json_column(row, "context_sent")?,
            valid: valid != 0,
            timestamp: parse_time(&column::<String>(row, "timestamp")?),
        })
    }

    fn row_to_progress(row: &SqliteRow) -> Result<ProgressRecord, StoreError> {
        let topics: String = column(row, "topics")?;
        let percentage: f64 = column(row, "percentage")?;
        Ok(ProgressRecord {
            conversation_id: ConversationId(column(row, "conversation_id")?),
            percentage: percentage as f32,
            topics: serde_json::from_str(&topics)
                .map_err(|e| StoreError::QueryFailed(format!("topics column: {e}")))?,
            pending_topic: column(row, "pending_topic")?,
            updated_at: parse_time(&column::<String>(row, "updated_at")?),
        })
    }

    async fn fetch_conversation_any(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("GET conversation: {e}")))?;
        row.as_ref().map(Self::row_to_conversation).transpose()
    }

    /// Explain why a guarded update touched no row.
    async fn blocked_state_error(&self, id: &ConversationId, want_blocked: bool) -> StoreError {
        match self.fetch_conversation_any(id).await {
            Ok(Some(c)) if !c.is_deleted() && c.blocked == want_blocked => {
                if want_blocked {
                    StoreError::AlreadyBlocked(id.to_string())
                } else {
                    StoreError::NotBlocked(id.to_string())
                }
            }
            Ok(_) => StoreError::ConversationNotFound(id.to_string()),
            Err(e) => e,
        }
    }
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::QueryFailed(format!("{name} column: {e}")))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &SqliteRow, name: &str) -> Result<Option<T>, StoreError> {
    column::<Option<String>>(row, name)?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| StoreError::QueryFailed(format!("{name} column: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Storage(format!("{what} serialization: {e}")))
}

fn parse_time(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl ConversationStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_conversation(&self, user_id: &str, model: &str) -> Result<Conversation, StoreError> {
        let conversation = Conversation::new(user_id, model);
        sqlx::query(
            r#"
            INSERT INTO conversations (id, user_id, model, blocked, created_at, updated_at)
            VALUES (?1, ?2, ?3, 0, ?4, ?5)
            "#,
        )
        .bind(conversation.id.as_str())
        .bind(&conversation.user_id)
        .bind(&conversation.model)
        .bind(conversation.created_at.to_rfc3339())
        .bind(conversation.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT conversation failed: {e}")))?;

        debug!(conversation_id = %conversation.id, user_id, "Created conversation");
        Ok(conversation)
    }

    async fn get_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError> {
        Ok(self.fetch_conversation_any(id).await?.filter(|c| !c.is_deleted()))
    }

    async fn add_message(&self, mut message: Message) -> Result<String, StoreError> {
        if message.id.is_empty() {
            message.id = Uuid::new_v4().to_string();
        }

        let touched = sqlx::query("UPDATE conversations SET updated_at = ?1 WHERE id = ?2 AND deleted_at IS NULL")
            .bind(Utc::now().to_rfc3339())
            .bind(message.conversation_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("UPDATE conversation failed: {e}")))?;
        if touched.rows_affected() == 0 {
            return Err(StoreError::ConversationNotFound(message.conversation_id.to_string()));
        }

        let usage = message.usage.as_ref().map(|u| to_json(u, "Usage")).transpose()?;
        let raw_payload = message.raw_payload.as_ref().map(|v| to_json(v, "Raw payload")).transpose()?;
        let context_sent = message.context_sent.as_ref().map(|v| to_json(v, "Context")).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, role, content, payload, usage, raw_payload, context_sent, valid, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&message.id)
        .bind(message.conversation_id.as_str())
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(to_json(&message.payload, "Payload")?)
        .bind(usage)
        .bind(raw_payload)
        .bind(context_sent)
        .bind(i64::from(message.valid))
        .bind(message.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT message failed: {e}")))?;

        debug!(conversation_id = %message.conversation_id, message_id = %message.id, "Stored message");
        Ok(message.id)
    }

    async fn update_message(&self, message: &Message) -> Result<(), StoreError> {
        let usage = message.usage.as_ref().map(|u| to_json(u, "Usage")).transpose()?;
        let raw_payload = message.raw_payload.as_ref().map(|v| to_json(v, "Raw payload")).transpose()?;
        let context_sent = message.context_sent.as_ref().map(|v| to_json(v, "Context")).transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE messages SET content = ?1, payload = ?2, usage = ?3, raw_payload = ?4,
                context_sent = ?5, valid = ?6
            WHERE id = ?7
            "#,
        )
        .bind(&message.content)
        .bind(to_json(&message.payload, "Payload")?)
        .bind(usage)
        .bind(raw_payload)
        .bind(context_sent)
        .bind(i64::from(message.valid))
        .bind(&message.id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UPDATE message failed: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::MessageNotFound(message.id.clone()));
        }
        Ok(())
    }

    async fn get_messages(&self, conversation_id: &ConversationId, limit: usize) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM (
                SELECT * FROM messages WHERE conversation_id = ?1 ORDER BY iid DESC LIMIT ?2
            ) ORDER BY iid ASC
            "#,
        )
        .bind(conversation_id.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("GET messages: {e}")))?;

        rows.iter().map(Self::row_to_message).collect()
    }

    async fn block_conversation(&self, id: &ConversationId, reason: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE conversations SET blocked = 1, blocked_reason = ?1, updated_at = ?2
            WHERE id = ?3 AND deleted_at IS NULL AND blocked = 0
            "#,
        )
        .bind(reason)
        .bind(Utc::now().to_rfc3339())
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("BLOCK failed: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(self.blocked_state_error(id, true).await);
        }
        Ok(())
    }

    async fn unblock_conversation(&self, id: &ConversationId) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE conversations SET blocked = 0, blocked_reason = NULL, updated_at = ?1
            WHERE id = ?2 AND deleted_at IS NULL AND blocked = 1
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UNBLOCK failed: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(self.blocked_state_error(id, false).await);
        }
        Ok(())
    }

    async fn soft_delete_conversation(&self, id: &ConversationId) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE conversations SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL")
            .bind(Utc::now().to_rfc3339())
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("DELETE failed: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_progress(&self, id: &ConversationId) -> Result<Option<ProgressRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM progress WHERE conversation_id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("GET progress: {e}")))?;
        row.as_ref().map(Self::row_to_progress).transpose()
    }

    async fn update_progress(&self, record: &ProgressRecord) -> Result<ProgressRecord, StoreError> {
        let _guard = self.progress_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(format!("BEGIN failed: {e}")))?;

        let row = sqlx::query("SELECT * FROM progress WHERE conversation_id = ?1")
            .bind(record.conversation_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("GET progress: {e}")))?;

        let mut merged = match row.as_ref() {
            Some(row) => Self::row_to_progress(row)?,
            None => ProgressRecord::empty(&record.conversation_id),
        };
        merged.merge(record);

        sqlx::query(
            r#"
            INSERT INTO progress (conversation_id, percentage, topics, pending_topic, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(conversation_id) DO UPDATE SET
                percentage = excluded.percentage,
                topics = excluded.topics,
                pending_topic = excluded.pending_topic,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(merged.conversation_id.as_str())
        .bind(f64::from(merged.percentage))
        .bind(to_json(&merged.topics, "Topics")?)
        .bind(&merged.pending_topic)
        .bind(merged.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Storage(format!("UPSERT progress failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(format!("COMMIT failed: {e}")))?;

        Ok(merged)
    }

    async fn count_open_conversations(&self, user_id: &str) -> Result<usize, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM conversations WHERE user_id = ?1 AND blocked = 0 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("COUNT: {e}")))?;

        let cnt: i64 = column(&row, "cnt")?;
        Ok(cnt as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialoguard_core::{MessagePayload, TopicCoverage, Usage};

    async fn test_store() -> SqliteStore {
        SqliteStore::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn conversation_round_trip() {
        let store = test_store().await;
        let conversation = store.create_conversation("user-1", "gpt-4o-mini").await.unwrap();

        let fetched = store.get_conversation(&conversation.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, conversation.id);
        assert_eq!(fetched.model, "gpt-4o-mini");
        assert!(!fetched.blocked);
        assert!(fetched.deleted_at.is_none());
    }

    #[tokio::test]
    async fn message_columns_survive_storage() {
        let store = test_store().await;
        let conversation = store.create_conversation("u", "m").await.unwrap();

        let mut form = serde_json::Map::new();
        form.insert("mood".into(), serde_json::json!("calm"));
        store
            .add_message(Message::user(&conversation.id, "hello").with_payload(MessagePayload::FormSubmission(form)))
            .await
            .unwrap();

        let mut reply = Message::assistant(&conversation.id, "Hi there").with_usage(Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }));
        reply.raw_payload = Some(serde_json::json!({"type": "response"}));
        reply.valid = false;
        store.add_message(reply).await.unwrap();

        let messages = store.get_messages(&conversation.id, 10).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert!(matches!(messages[0].payload, MessagePayload::FormSubmission(_)));
        assert_eq!(messages[1].tokens_used(), 15);
        assert_eq!(messages[1].raw_payload.as_ref().unwrap()["type"], "response");
        assert!(!messages[1].valid);
    }

    #[tokio::test]
    async fn get_messages_limits_to_most_recent() {
        let store = test_store().await;
        let conversation = store.create_conversation("u", "m").await.unwrap();
        for i in 0..6 {
            store
                .add_message(Message::user(&conversation.id, format!("m{i}")))
                .await
                .unwrap();
        }

        let recent = store.get_messages(&conversation.id, 2).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m4", "m5"]);
    }

    #[tokio::test]
    async fn update_message_in_place() {
        let store = test_store().await;
        let conversation = store.create_conversation("u", "m").await.unwrap();
        let mut message = Message::assistant(&conversation.id, "partial");
        store.add_message(message.clone()).await.unwrap();

        message.content = "complete".into();
        store.update_message(&message).await.unwrap();
        let stored = store.get_messages(&conversation.id, 1).await.unwrap();
        assert_eq!(stored[0].content, "complete");

        let missing = Message::assistant(&conversation.id, "x");
        assert!(matches!(
            store.update_message(&missing).await.unwrap_err(),
            StoreError::MessageNotFound(_)
        ));
    }

    #[tokio::test]
    async fn block_states() {
        let store = test_store().await;
        let conversation = store.create_conversation("u", "m").await.unwrap();

        store.block_conversation(&conversation.id, "emergency keyword").await.unwrap();
        assert!(matches!(
            store.block_conversation(&conversation.id, "again").await.unwrap_err(),
            StoreError::AlreadyBlocked(_)
        ));
        let fetched = store.get_conversation(&conversation.id).await.unwrap().unwrap();
        assert!(fetched.blocked);
        assert_eq!(fetched.blocked_reason.as_deref(), Some("emergency keyword"));

        store.unblock_conversation(&conversation.id).await.unwrap();
        assert!(matches!(
            store.unblock_conversation(&conversation.id).await.unwrap_err(),
            StoreError::NotBlocked(_)
        ));

        assert!(matches!(
            store.block_conversation(&ConversationId::from("nope"), "r").await.unwrap_err(),
            StoreError::ConversationNotFound(_)
        ));
    }

    #[tokio::test]
    async fn soft_delete_hides_conversation() {
        let store = test_store().await;
        let conversation = store.create_conversation("u", "m").await.unwrap();
        store.create_conversation("u", "m").await.unwrap();

        assert!(store.soft_delete_conversation(&conversation.id).await.unwrap());
        assert!(!store.soft_delete_conversation(&conversation.id).await.unwrap());
        assert!(store.get_conversation(&conversation.id).await.unwrap().is_none());
        assert_eq!(store.count_open_conversations("u").await.unwrap(), 1);

        let err = store
            .add_message(Message::user(&conversation.id, "late"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConversationNotFound(_)));
    }

    #[tokio::test]
    async fn progress_is_merged_not_overwritten() {
        let store = test_store().await;
        let id = ConversationId::from("c1");

        let mut first = ProgressRecord::empty(&id);
        first.percentage = 50.0;
        first.topics.insert("t1".into(), TopicCoverage::confirmed(Utc::now()));
        first.pending_topic = Some("t2".into());
        store.update_progress(&first).await.unwrap();

        let mut second = ProgressRecord::empty(&id);
        second.percentage = 25.0;
        second.topics.insert("t2".into(), TopicCoverage::confirmed(Utc::now()));
        let merged = store.update_progress(&second).await.unwrap();

        assert_eq!(merged.percentage, 50.0);
        assert_eq!(merged.covered_count(), 2);
        assert!(merged.pending_topic.is_none());

        let stored = store.get_progress(&id).await.unwrap().unwrap();
        assert_eq!(stored.covered_count(), 2);
        assert_eq!(stored.percentage, 50.0);
    }

    #[tokio::test]
    async fn file_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dialoguard.db");

        let id = {
            let store = SqliteStore::open(&path).await.unwrap();
            store.create_conversation("u", "m").await.unwrap().id
        };

        let reopened = SqliteStore::open(&path).await.unwrap();
        assert!(reopened.get_conversation(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn backend_name() {
        assert_eq!(test_store().await.name(), "sqlite");
    }
}
