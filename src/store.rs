use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::RelayError;

pub const DEFAULT_PROVIDER: &str = "openai";
pub const DEFAULT_CHAT_TITLE: &str = "New Chat";

/// Open (creating if needed) the SQLite database at `database_path`.
pub async fn connect(database_path: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(database_path)
        .create_if_missing(true)
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .connect_with(options)
        .await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    fn parse(raw: &str) -> Self {
        if raw == "assistant" {
            MessageRole::Assistant
        } else {
            MessageRole::User
        }
    }
}

/// Whether a stored key is still accepted upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    /// The provider rejected the key; cleared by saving a new one.
    Invalid,
}

impl KeyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Invalid => "invalid",
        }
    }

    fn parse(raw: &str) -> Self {
        if raw == "invalid" {
            KeyStatus::Invalid
        } else {
            KeyStatus::Active
        }
    }
}

/// Encrypted API key as stored; `encrypted_key` is an `IV:DATA` token.
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub user_id: String,
    pub provider: String,
    pub encrypted_key: String,
    /// Last characters of the plaintext key, for display only.
    pub key_preview: String,
    pub status: KeyStatus,
    pub last_used_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRecord {
    pub id: i64,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: i64,
    pub chat_id: i64,
    pub user_id: String,
    pub role: MessageRole,
    pub content: String,
    pub tokens_used: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: String,
    pub display_name: Option<String>,
    pub created_at: i64,
    pub last_seen_at: i64,
}

/// Relational storage for users, encrypted keys, chats and messages.
#[derive(Debug, Clone)]
pub struct RelayStore {
    pool: SqlitePool,
}

impl RelayStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize_schema(&self) -> Result<(), RelayError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                display_name TEXT,
                created_at INTEGER NOT NULL,
                last_seen_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS api_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL DEFAULT 'openai',
                encrypted_key TEXT NOT NULL,
                key_preview TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'active',
                last_used_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (user_id, provider)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        self.upgrade_api_keys_schema().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT 'New Chat',
                description TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                tokens_used INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (chat_id) REFERENCES chats(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chats_user ON chats(user_id, created_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id, created_at, id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Databases created before previews and statuses existed lack the columns.
    async fn upgrade_api_keys_schema(&self) -> Result<(), RelayError> {
        if !self.api_keys_column_exists("key_preview").await? {
            sqlx::query("ALTER TABLE api_keys ADD COLUMN key_preview TEXT NOT NULL DEFAULT ''")
                .execute(&self.pool)
                .await?;
        }

        if !self.api_keys_column_exists("status").await? {
            sqlx::query("ALTER TABLE api_keys ADD COLUMN status TEXT NOT NULL DEFAULT 'active'")
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }

    async fn api_keys_column_exists(&self, column: &str) -> Result<bool, RelayError> {
        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM pragma_table_info('api_keys') WHERE name = ? LIMIT 1",
        )
        .bind(column)
        .fetch_optional(&self.pool)
        .await?;

        Ok(exists.is_some())
    }

    // ----- users -----

    /// Insert the user on first sight, otherwise refresh `last_seen_at` and,
    /// when given, the display name.
    pub async fn touch_user(
        &self,
        user_id: &str,
        display_name: Option<&str>,
    ) -> Result<UserRecord, RelayError> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO users (id, display_name, created_at, last_seen_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                display_name = COALESCE(excluded.display_name, users.display_name),
                last_seen_at = excluded.last_seen_at
            "#,
        )
        .bind(user_id)
        .bind(display_name)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT id, display_name, created_at, last_seen_at FROM users WHERE id = ? LIMIT 1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(UserRecord {
            id: row.try_get("id")?,
            display_name: row.try_get("display_name")?,
            created_at: row.try_get("created_at")?,
            last_seen_at: row.try_get("last_seen_at")?,
        })
    }

    // ----- api keys -----

    /// Store a new token for (user, provider), superseding any previous one.
    /// A re-saved key is active again.
    pub async fn upsert_api_key(
        &self,
        user_id: &str,
        provider: &str,
        encrypted_key: &str,
        key_preview: &str,
    ) -> Result<ApiKeyRecord, RelayError> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO api_keys (
                user_id, provider, encrypted_key, key_preview, status, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, 'active', ?, ?)
            ON CONFLICT(user_id, provider) DO UPDATE SET
                encrypted_key = excluded.encrypted_key,
                key_preview = excluded.key_preview,
                status = 'active',
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(provider)
        .bind(encrypted_key)
        .bind(key_preview)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            r#"
            SELECT id, user_id, provider, encrypted_key, key_preview, status,
                   last_used_at, created_at, updated_at
            FROM api_keys
            WHERE user_id = ? AND provider = ?
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(provider)
        .fetch_one(&self.pool)
        .await?;

        Ok(api_key_from_row(row)?)
    }

    /// Most recently saved key of the user, across providers.
    pub async fn latest_api_key(&self, user_id: &str) -> Result<Option<ApiKeyRecord>, RelayError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, provider, encrypted_key, key_preview, status,
                   last_used_at, created_at, updated_at
            FROM api_keys
            WHERE user_id = ?
            ORDER BY updated_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(api_key_from_row).transpose()?)
    }

    pub async fn touch_api_key(&self, key_id: i64) -> Result<(), RelayError> {
        sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp())
            .bind(key_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_api_key_status(&self, key_id: i64, status: KeyStatus) -> Result<(), RelayError> {
        sqlx::query("UPDATE api_keys SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().timestamp())
            .bind(key_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove every stored key of the user. Returns how many were deleted.
    pub async fn delete_api_keys(&self, user_id: &str) -> Result<u64, RelayError> {
        let result = sqlx::query("DELETE FROM api_keys WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ----- chats -----

    pub async fn create_chat(
        &self,
        user_id: &str,
        title: &str,
        description: Option<&str>,
    ) -> Result<ChatRecord, RelayError> {
        let now = Utc::now().timestamp();
        let id = sqlx::query(
            r#"
            INSERT INTO chats (user_id, title, description, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(title)
        .bind(description)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(ChatRecord {
            id,
            user_id: user_id.to_owned(),
            title: title.to_owned(),
            description: description.map(str::to_owned),
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn list_chats(&self, user_id: &str) -> Result<Vec<ChatRecord>, RelayError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, title, description, created_at, updated_at
            FROM chats
            WHERE user_id = ?
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let chats = rows
            .into_iter()
            .map(chat_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(chats)
    }

    /// Chat by id, only if owned by `user_id`.
    pub async fn find_chat(
        &self,
        chat_id: i64,
        user_id: &str,
    ) -> Result<Option<ChatRecord>, RelayError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, title, description, created_at, updated_at
            FROM chats
            WHERE id = ? AND user_id = ?
            LIMIT 1
            "#,
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(chat_from_row).transpose()?)
    }

    pub async fn rename_chat(
        &self,
        chat_id: i64,
        user_id: &str,
        title: &str,
    ) -> Result<bool, RelayError> {
        let result = sqlx::query(
            "UPDATE chats SET title = ?, updated_at = ? WHERE id = ? AND user_id = ?",
        )
        .bind(title)
        .bind(Utc::now().timestamp())
        .bind(chat_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a chat and its messages. Returns false when nothing matched.
    pub async fn delete_chat(&self, chat_id: i64, user_id: &str) -> Result<bool, RelayError> {
        let mut tx = self.pool.begin().await?;

        let owned = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM chats WHERE id = ? AND user_id = ? LIMIT 1",
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        if owned.is_none() {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM messages WHERE chat_id = ?")
            .bind(chat_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chats WHERE id = ? AND user_id = ?")
            .bind(chat_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    // ----- messages -----

    pub async fn insert_message(
        &self,
        chat_id: i64,
        user_id: &str,
        role: MessageRole,
        content: &str,
        tokens_used: i64,
    ) -> Result<MessageRecord, RelayError> {
        let now = Utc::now().timestamp();
        let id = sqlx::query(
            r#"
            INSERT INTO messages (chat_id, user_id, role, content, tokens_used, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(chat_id)
        .bind(user_id)
        .bind(role.as_str())
        .bind(content)
        .bind(tokens_used)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        sqlx::query("UPDATE chats SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(chat_id)
            .execute(&self.pool)
            .await?;

        Ok(MessageRecord {
            id,
            chat_id,
            user_id: user_id.to_owned(),
            role,
            content: content.to_owned(),
            tokens_used,
            created_at: now,
        })
    }

    /// Messages of a chat owned by `user_id`, oldest first.
    pub async fn list_messages(
        &self,
        chat_id: i64,
        user_id: &str,
    ) -> Result<Vec<MessageRecord>, RelayError> {
        let rows = sqlx::query(
            r#"
            SELECT id, chat_id, user_id, role, content, tokens_used, created_at
            FROM messages
            WHERE chat_id = ? AND user_id = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let messages = rows
            .into_iter()
            .map(|row| -> Result<MessageRecord, sqlx::Error> {
                let role: String = row.try_get("role")?;
                Ok(MessageRecord {
                    id: row.try_get("id")?,
                    chat_id: row.try_get("chat_id")?,
                    user_id: row.try_get("user_id")?,
                    role: MessageRole::parse(&role),
                    content: row.try_get("content")?,
                    tokens_used: row.try_get("tokens_used")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }
}

fn api_key_from_row(row: SqliteRow) -> Result<ApiKeyRecord, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(ApiKeyRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        provider: row.try_get("provider")?,
        encrypted_key: row.try_get("encrypted_key")?,
        key_preview: row.try_get("key_preview")?,
        status: KeyStatus::parse(&status),
        last_used_at: row.try_get("last_used_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn chat_from_row(row: SqliteRow) -> Result<ChatRecord, sqlx::Error> {
    Ok(ChatRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
