//! Chat transcript store.
//!
//! One SQLite database holds chats, their messages, and per-database
//! descriptions. Schema upgrades are versioned and applied once at startup;
//! each applied version is recorded in `schema_version` so reopening an
//! existing store is a no-op.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

/// Write-time cap for one message body.
pub const MAX_MESSAGE_CONTENT_CHARS: usize = 200_000;
const TRUNCATION_MARKER: &str = "\n\n[... message truncated due to size ...]";

pub const DEFAULT_CHAT_TITLE: &str = "New chat";

const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        r#"
CREATE TABLE IF NOT EXISTS database_descriptions (
    name TEXT PRIMARY KEY,
    description TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS chats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    database_name TEXT NOT NULL,
    title TEXT NOT NULL DEFAULT 'New chat',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chat_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_id INTEGER NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chats_database_name ON chats(database_name);
CREATE INDEX IF NOT EXISTS idx_chat_messages_chat_id ON chat_messages(chat_id);
"#,
    ),
    (
        2,
        "ALTER TABLE chats ADD COLUMN starred INTEGER NOT NULL DEFAULT 0;",
    ),
];

/// Role of one transcript entry. `ToolCall` entries are a human-readable
/// projection for display; they are never replayed to the model backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptRole {
    User,
    Assistant,
    ToolCall,
    System,
}

impl TranscriptRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::ToolCall => "tool_call",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool_call" => Some(Self::ToolCall),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: TranscriptRole,
    pub content: String,
}

impl TranscriptEntry {
    pub fn new(role: TranscriptRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub id: i64,
    pub database_name: String,
    pub title: String,
    pub created_at: String,
    pub starred: bool,
}

pub struct ChatStore {
    conn: Mutex<Connection>,
}

impl ChatStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating store directory {}", dir.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening chat store {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        migrate(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_chat(&self, database: &str, title: Option<&str>) -> Result<ChatRecord> {
        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_CHAT_TITLE);
        let created_at = now_stamp();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO chats (database_name, title, created_at, starred) VALUES (?1, ?2, ?3, 0)",
            params![database, title, created_at],
        )?;
        let id = conn.last_insert_rowid();
        tracing::info!(chat_id = id, database, "chat created");
        Ok(ChatRecord {
            id,
            database_name: database.to_string(),
            title: title.to_string(),
            created_at,
            starred: false,
        })
    }

    /// Chats for one database, starred first, newest first.
    pub fn list_chats(&self, database: &str) -> Result<Vec<ChatRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, database_name, title, created_at, starred
               FROM chats
              WHERE database_name = ?1
              ORDER BY starred DESC, created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map([database], row_to_chat)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn chat(&self, chat_id: i64) -> Result<Option<ChatRecord>> {
        let conn = self.conn();
        let record = conn
            .query_row(
                "SELECT id, database_name, title, created_at, starred
                   FROM chats WHERE id = ?1",
                [chat_id],
                row_to_chat,
            )
            .optional()?;
        Ok(record)
    }

    /// Append entries to a chat; content is trimmed and capped at
    /// [`MAX_MESSAGE_CONTENT_CHARS`] with a truncation marker.
    pub fn append_messages(&self, chat_id: i64, entries: &[TranscriptEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let created_at = now_stamp();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for entry in entries {
            let content = cap_content(entry.content.trim());
            tx.execute(
                "INSERT INTO chat_messages (chat_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![chat_id, entry.role.as_str(), content, created_at],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn messages(&self, chat_id: i64) -> Result<Vec<TranscriptEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT role, content FROM chat_messages WHERE chat_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([chat_id], |row| {
            let role: String = row.get(0)?;
            let content: String = row.get(1)?;
            Ok((role, content))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (role, content) = row?;
            // Rows with unknown roles would only appear after a downgrade;
            // surface them as user text rather than dropping transcript data.
            let role = TranscriptRole::parse(&role).unwrap_or(TranscriptRole::User);
            out.push(TranscriptEntry { role, content });
        }
        Ok(out)
    }

    pub fn set_starred(&self, chat_id: i64, starred: bool) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE chats SET starred = ?1 WHERE id = ?2",
            params![starred as i64, chat_id],
        )?;
        Ok(changed > 0)
    }

    pub fn rename(&self, chat_id: i64, title: &str) -> Result<bool> {
        let title = title.trim();
        let title = if title.is_empty() {
            DEFAULT_CHAT_TITLE
        } else {
            title
        };
        let changed = self.conn().execute(
            "UPDATE chats SET title = ?1 WHERE id = ?2",
            params![title, chat_id],
        )?;
        Ok(changed > 0)
    }

    /// Delete a chat and its messages in one transaction.
    pub fn delete_chat(&self, chat_id: i64) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM chat_messages WHERE chat_id = ?1", [chat_id])?;
        let changed = tx.execute("DELETE FROM chats WHERE id = ?1", [chat_id])?;
        tx.commit()?;
        if changed > 0 {
            tracing::info!(chat_id, "chat deleted");
        }
        Ok(changed > 0)
    }

    pub fn description(&self, database: &str) -> Result<String> {
        let conn = self.conn();
        let description = conn
            .query_row(
                "SELECT description FROM database_descriptions WHERE name = ?1",
                [database],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(description.unwrap_or_default())
    }

    pub fn set_description(&self, database: &str, description: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO database_descriptions (name, description) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET description = excluded.description",
            params![database, description],
        )?;
        Ok(())
    }
}

fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)
            .with_context(|| format!("applying store migration {version}"))?;
        tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
        tx.commit()?;
        tracing::info!(version, "store migration applied");
    }
    Ok(())
}

fn cap_content(content: &str) -> String {
    if content.chars().count() <= MAX_MESSAGE_CONTENT_CHARS {
        return content.to_string();
    }
    let mut out: String = content.chars().take(MAX_MESSAGE_CONTENT_CHARS).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

fn now_stamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatRecord> {
    Ok(ChatRecord {
        id: row.get(0)?,
        database_name: row.get(1)?,
        title: row.get(2)?,
        created_at: row.get(3)?,
        starred: row.get::<_, i64>(4)? != 0,
    })
}
