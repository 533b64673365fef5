use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

pub mod tasks;

/// One row of the append-only message log.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub chat_jid: String,
    pub sender: String,
    pub sender_name: String,
    pub content: String,
    /// RFC3339, lexicographically orderable. The sole ordering key.
    pub timestamp: String,
    pub is_from_me: bool,
    pub is_bot_message: bool,
}

#[derive(Debug, Clone)]
pub struct Chat {
    pub jid: String,
    pub name: Option<String>,
    pub last_message_time: Option<String>,
    pub is_group: bool,
}

#[derive(Debug, Clone)]
pub struct RegisteredGroup {
    pub jid: String,
    pub name: String,
    pub folder: String,
    pub trigger: Option<String>,
    pub added_at: String,
}

/// SQLite-backed message log, group registry, session map, task table, and
/// router cursor KV. One connection, writes serialized behind a mutex.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create store directory: {}", parent.display()))?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open store DB: {}", db_path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )
        .context("Failed to set store pragmas")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                id             TEXT NOT NULL,
                chat_jid       TEXT NOT NULL,
                sender         TEXT NOT NULL,
                sender_name    TEXT NOT NULL,
                content        TEXT NOT NULL,
                timestamp      TEXT NOT NULL,
                is_from_me     INTEGER NOT NULL DEFAULT 0,
                is_bot_message INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (id, chat_jid)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_chat_time
                ON messages(chat_jid, timestamp);

            CREATE TABLE IF NOT EXISTS chats (
                jid               TEXT PRIMARY KEY,
                name              TEXT,
                last_message_time TEXT,
                is_group          INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS registered_groups (
                jid      TEXT PRIMARY KEY,
                name     TEXT NOT NULL,
                folder   TEXT NOT NULL UNIQUE,
                trigger  TEXT,
                added_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                group_folder TEXT PRIMARY KEY,
                session_id   TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id             TEXT PRIMARY KEY,
                group_folder   TEXT NOT NULL,
                prompt         TEXT NOT NULL,
                schedule_type  TEXT NOT NULL,
                schedule_value TEXT NOT NULL,
                status         TEXT NOT NULL DEFAULT 'active',
                next_run       TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_next_run ON tasks(next_run);

            CREATE TABLE IF NOT EXISTS router_state (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
        .context("Failed to initialize store schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    // ── Messages ──────────────────────────────────────────────────

    /// Append one message. Re-inserting an existing (id, chat_jid) is a no-op
    /// so adapter redelivery stays idempotent.
    pub fn insert_message(&self, msg: &Message) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO messages
                 (id, chat_jid, sender, sender_name, content, timestamp, is_from_me, is_bot_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    msg.id,
                    msg.chat_jid,
                    msg.sender,
                    msg.sender_name,
                    msg.content,
                    msg.timestamp,
                    msg.is_from_me,
                    msg.is_bot_message,
                ],
            )
            .context("Failed to insert message")?;
            Ok(())
        })
    }

    /// Record the assistant's own outbound reply so the log is complete.
    /// Bot rows are excluded from every pending-work query.
    pub fn record_outgoing(&self, chat_jid: &str, text: &str, assistant_name: &str) -> Result<()> {
        let msg = Message {
            id: Uuid::new_v4().to_string(),
            chat_jid: chat_jid.to_string(),
            sender: assistant_name.to_string(),
            sender_name: assistant_name.to_string(),
            content: text.to_string(),
            timestamp: now_rfc3339(),
            is_from_me: true,
            is_bot_message: true,
        };
        self.insert_message(&msg)
    }

    /// Every non-bot message after `after_ts` across the registered JIDs, in
    /// timestamp order, plus the newest timestamp observed.
    pub fn get_new_messages(
        &self,
        jids: &[String],
        after_ts: &str,
        assistant_name: &str,
    ) -> Result<(Vec<Message>, Option<String>)> {
        if jids.is_empty() {
            return Ok((Vec::new(), None));
        }
        self.with_conn(|conn| {
            let placeholders = vec!["?"; jids.len()].join(", ");
            let sql = format!(
                "SELECT id, chat_jid, sender, sender_name, content, timestamp, is_from_me, is_bot_message
                 FROM messages
                 WHERE timestamp > ? AND is_bot_message = 0 AND sender_name <> ?
                   AND chat_jid IN ({placeholders})
                 ORDER BY timestamp ASC, rowid ASC",
            );
            let mut stmt = conn.prepare(&sql)?;

            let mut bind: Vec<&str> = vec![after_ts, assistant_name];
            bind.extend(jids.iter().map(String::as_str));

            let rows = stmt.query_map(params_from_iter(bind), row_to_message)?;
            let mut messages = Vec::new();
            for row in rows {
                messages.push(row?);
            }
            let newest = messages.last().map(|m| m.timestamp.clone());
            Ok((messages, newest))
        })
    }

    /// All pending (non-bot) messages for one chat after `after_ts`.
    pub fn get_messages_since(
        &self,
        chat_jid: &str,
        after_ts: &str,
        assistant_name: &str,
    ) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_jid, sender, sender_name, content, timestamp, is_from_me, is_bot_message
                 FROM messages
                 WHERE chat_jid = ?1 AND timestamp > ?2
                   AND is_bot_message = 0 AND sender_name <> ?3
                 ORDER BY timestamp ASC, rowid ASC",
            )?;
            let rows = stmt.query_map(params![chat_jid, after_ts, assistant_name], row_to_message)?;
            let mut messages = Vec::new();
            for row in rows {
                messages.push(row?);
            }
            Ok(messages)
        })
    }

    // ── Chats ─────────────────────────────────────────────────────

    pub fn upsert_chat(
        &self,
        jid: &str,
        name: Option<&str>,
        last_message_time: &str,
        is_group: bool,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chats (jid, name, last_message_time, is_group)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(jid) DO UPDATE SET
                     name = COALESCE(excluded.name, chats.name),
                     last_message_time = MAX(chats.last_message_time, excluded.last_message_time),
                     is_group = excluded.is_group",
                params![jid, name, last_message_time, is_group],
            )
            .context("Failed to upsert chat")?;
            Ok(())
        })
    }

    pub fn group_chats(&self) -> Result<Vec<Chat>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT jid, name, last_message_time, is_group FROM chats
                 WHERE is_group = 1 ORDER BY last_message_time DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(Chat {
                    jid: row.get(0)?,
                    name: row.get(1)?,
                    last_message_time: row.get(2)?,
                    is_group: row.get(3)?,
                })
            })?;
            let mut chats = Vec::new();
            for row in rows {
                chats.push(row?);
            }
            Ok(chats)
        })
    }

    // ── Registered groups ─────────────────────────────────────────

    pub fn register_group(&self, group: &RegisteredGroup) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO registered_groups (jid, name, folder, trigger, added_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    group.jid,
                    group.name,
                    group.folder,
                    group.trigger,
                    group.added_at
                ],
            )
            .context("Failed to register group")?;
            Ok(())
        })
    }

    pub fn remove_group(&self, jid: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn
                .execute("DELETE FROM registered_groups WHERE jid = ?1", params![jid])
                .context("Failed to remove group")?;
            Ok(changed > 0)
        })
    }

    pub fn registered_groups(&self) -> Result<Vec<RegisteredGroup>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT jid, name, folder, trigger, added_at
                 FROM registered_groups ORDER BY added_at ASC",
            )?;
            let rows = stmt.query_map([], row_to_group)?;
            let mut groups = Vec::new();
            for row in rows {
                groups.push(row?);
            }
            Ok(groups)
        })
    }

    pub fn group_by_folder(&self, folder: &str) -> Result<Option<RegisteredGroup>> {
        self.with_conn(|conn| {
            let result = conn.query_row(
                "SELECT jid, name, folder, trigger, added_at
                 FROM registered_groups WHERE folder = ?1",
                params![folder],
                row_to_group,
            );
            match result {
                Ok(group) => Ok(Some(group)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e).context("Failed to look up group by folder"),
            }
        })
    }

    // ── Sessions ──────────────────────────────────────────────────

    pub fn session_for(&self, group_folder: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let result = conn.query_row(
                "SELECT session_id FROM sessions WHERE group_folder = ?1",
                params![group_folder],
                |row| row.get::<_, String>(0),
            );
            match result {
                Ok(session) => Ok(Some(session)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e).context("Failed to read session"),
            }
        })
    }

    pub fn set_session(&self, group_folder: &str, session_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO sessions (group_folder, session_id) VALUES (?1, ?2)",
                params![group_folder, session_id],
            )
            .context("Failed to persist session")?;
            Ok(())
        })
    }

    // ── Router cursor KV ──────────────────────────────────────────

    pub fn state_get(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let result = conn.query_row(
                "SELECT value FROM router_state WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            );
            match result {
                Ok(value) => Ok(Some(value)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e).context("Failed to read router state"),
            }
        })
    }

    pub fn state_set(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO router_state (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .context("Failed to persist router state")?;
            Ok(())
        })
    }

    pub fn agent_cursors(&self) -> Result<Vec<(String, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, value FROM router_state WHERE key LIKE 'agent_cursor:%'",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut cursors = Vec::new();
            for row in rows {
                let (key, value) = row?;
                let jid = key.trim_start_matches("agent_cursor:").to_string();
                cursors.push((jid, value));
            }
            Ok(cursors)
        })
    }
}

pub fn agent_cursor_key(jid: &str) -> String {
    format!("agent_cursor:{jid}")
}

pub const LAST_TIMESTAMP_KEY: &str = "last_timestamp";

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        chat_jid: row.get(1)?,
        sender: row.get(2)?,
        sender_name: row.get(3)?,
        content: row.get(4)?,
        timestamp: row.get(5)?,
        is_from_me: row.get(6)?,
        is_bot_message: row.get(7)?,
    })
}

fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<RegisteredGroup> {
    Ok(RegisteredGroup {
        jid: row.get(0)?,
        name: row.get(1)?,
        folder: row.get(2)?,
        trigger: row.get(3)?,
        added_at: row.get(4)?,
    })
}
