//! SQLite-backed conversation memory.
//!
//! Authoritative store for conversational continuity across restarts.
//! Two tables: windowed conversation turns and per-session preferences.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

/// A stored conversation turn.
#[derive(Debug, Clone)]
pub struct MemoryTurn {
    pub role: String,
    pub content: String,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Conversation turns and preferences, keyed by session.
pub struct ConversationMemory {
    conn: Mutex<Connection>,
}

impl ConversationMemory {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create memory directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open memory database: {}", path.display()))?;
        Self::ensure_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-process store for tests and the demo CLI.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversation_turns (
                session_id TEXT NOT NULL,
                turn_index INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (session_id, turn_index)
            );
            CREATE TABLE IF NOT EXISTS preferences (
                session_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (session_id, key)
            );",
        )
        .context("Failed to create memory schema")
    }

    /// Persist one conversation turn.
    pub fn append_turn(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("memory lock poisoned");

        let next_index: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(turn_index), -1) + 1 FROM conversation_turns WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .context("Failed to compute next turn index")?;

        conn.execute(
            "INSERT OR REPLACE INTO conversation_turns
             (session_id, turn_index, role, content, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session_id,
                next_index,
                role,
                content,
                serde_json::to_string(metadata)?,
                Utc::now().timestamp_millis(),
            ],
        )
        .context("Failed to insert conversation turn")?;

        Ok(())
    }

    /// Load the latest `window` turns for a session, oldest first.
    pub fn load_recent_turns(&self, session_id: &str, window: usize) -> Result<Vec<MemoryTurn>> {
        let conn = self.conn.lock().expect("memory lock poisoned");

        let mut stmt = conn
            .prepare(
                "SELECT role, content, metadata, created_at
                 FROM conversation_turns
                 WHERE session_id = ?1
                 ORDER BY turn_index DESC
                 LIMIT ?2",
            )
            .context("Failed to prepare turn query")?;

        let rows = stmt
            .query_map(params![session_id, window as i64], |row| {
                let metadata_json: Option<String> = row.get(2)?;
                let created_ms: i64 = row.get(3)?;
                Ok(MemoryTurn {
                    role: row.get(0)?,
                    content: row.get(1)?,
                    metadata: metadata_json
                        .and_then(|m| serde_json::from_str(&m).ok())
                        .unwrap_or_default(),
                    created_at: DateTime::from_timestamp_millis(created_ms)
                        .unwrap_or(DateTime::<Utc>::MIN_UTC),
                })
            })
            .context("Failed to query turns")?;

        let mut turns: Vec<MemoryTurn> = rows.collect::<std::result::Result<_, _>>()?;
        turns.reverse();
        Ok(turns)
    }

    /// Persist a preference for a session (upsert).
    pub fn set_preference(&self, session_id: &str, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().expect("memory lock poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO preferences (session_id, key, value, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, key, value, Utc::now().timestamp_millis()],
        )
        .context("Failed to set preference")?;
        Ok(())
    }

    /// All stored preferences for a session.
    pub fn get_preferences(&self, session_id: &str) -> Result<HashMap<String, String>> {
        let conn = self.conn.lock().expect("memory lock poisoned");
        let mut stmt = conn
            .prepare("SELECT key, value FROM preferences WHERE session_id = ?1")
            .context("Failed to prepare preference query")?;

        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("Failed to query preferences")?;

        let mut prefs = HashMap::new();
        for row in rows {
            let (key, value) = row?;
            prefs.insert(key, value);
        }
        Ok(prefs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_load_ordering() {
        let memory = ConversationMemory::in_memory().unwrap();
        let meta = HashMap::new();

        memory.append_turn("s1", "user", "first", &meta).unwrap();
        memory.append_turn("s1", "assistant", "second", &meta).unwrap();
        memory.append_turn("s1", "user", "third", &meta).unwrap();

        let turns = memory.load_recent_turns("s1", 2).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "second");
        assert_eq!(turns[1].content, "third");
    }

    #[test]
    fn test_sessions_are_isolated() {
        let memory = ConversationMemory::in_memory().unwrap();
        let meta = HashMap::new();

        memory.append_turn("s1", "user", "for s1", &meta).unwrap();
        memory.append_turn("s2", "user", "for s2", &meta).unwrap();

        let turns = memory.load_recent_turns("s1", 10).unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].content, "for s1");
    }

    #[test]
    fn test_metadata_roundtrip() {
        let memory = ConversationMemory::in_memory().unwrap();
        let mut meta = HashMap::new();
        meta.insert("model".to_string(), "gpt-4o-mini".to_string());

        memory.append_turn("s1", "assistant", "reply", &meta).unwrap();

        let turns = memory.load_recent_turns("s1", 1).unwrap();
        assert_eq!(turns[0].metadata.get("model").map(String::as_str), Some("gpt-4o-mini"));
    }

    #[test]
    fn test_preferences_upsert() {
        let memory = ConversationMemory::in_memory().unwrap();

        memory.set_preference("s1", "voice", "quiet").unwrap();
        memory.set_preference("s1", "voice", "loud").unwrap();
        memory.set_preference("s1", "units", "metric").unwrap();

        let prefs = memory.get_preferences("s1").unwrap();
        assert_eq!(prefs.len(), 2);
        assert_eq!(prefs.get("voice").map(String::as_str), Some("loud"));
    }
}
