//! Conversation transcript storage. The pipeline only appends and reads.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::HistoryError;
use crate::models::{ConversationTurn, HistoryBackend, HistoryConfig, SessionSummary, TurnRole};
use crate::utils::excerpt;

const TITLE_CHARS: usize = 60;

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(
        &self,
        session_id: &str,
        role: TurnRole,
        content: &str,
        user_id: Option<&str>,
    ) -> Result<(), HistoryError>;

    /// The most recent `limit` turns of a session, oldest first.
    async fn fetch(&self, session_id: &str, limit: usize)
    -> Result<Vec<ConversationTurn>, HistoryError>;

    /// Sessions ordered by latest activity, optionally restricted to one user.
    async fn recent_sessions(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SessionSummary>, HistoryError>;
}

pub type SharedHistory = Arc<dyn HistoryStore>;

pub fn open_history(config: &HistoryConfig, path: &Path) -> Result<SharedHistory, HistoryError> {
    match config.backend {
        HistoryBackend::Sqlite => Ok(Arc::new(SqliteHistoryStore::open(path)?)),
        HistoryBackend::Memory => Ok(Arc::new(InMemoryHistoryStore::default())),
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS conversation_turns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    user_id TEXT,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_turns_session ON conversation_turns(session_id, id);
CREATE INDEX IF NOT EXISTS idx_turns_user ON conversation_turns(user_id);
"#;

pub struct SqliteHistoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHistoryStore {
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, HistoryError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, HistoryError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, HistoryError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, HistoryError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&conn.lock()))
            .await
            .map_err(|e| HistoryError::Task(e.to_string()))?
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, HistoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| HistoryError::Corrupt(format!("bad timestamp '{}': {}", raw, e)))
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn append(
        &self,
        session_id: &str,
        role: TurnRole,
        content: &str,
        user_id: Option<&str>,
    ) -> Result<(), HistoryError> {
        let session_id = session_id.to_string();
        let content = content.to_string();
        let user_id = user_id.map(str::to_string);
        let timestamp = Utc::now().to_rfc3339();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO conversation_turns (session_id, role, content, user_id, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![session_id, role.as_str(), content, user_id, timestamp],
            )?;
            Ok(())
        })
        .await
    }

    async fn fetch(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, HistoryError> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, role, content, user_id, timestamp
                 FROM conversation_turns
                 WHERE session_id = ?1
                 ORDER BY id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![session_id, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;

            let mut turns = Vec::new();
            for row in rows {
                let (session_id, role, content, user_id, timestamp) = row?;
                turns.push(ConversationTurn {
                    session_id,
                    role: role.parse().map_err(HistoryError::Corrupt)?,
                    content,
                    timestamp: parse_timestamp(&timestamp)?,
                    user_id,
                });
            }
            turns.reverse();
            Ok(turns)
        })
        .await
    }

    async fn recent_sessions(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SessionSummary>, HistoryError> {
        let user_id = user_id.map(str::to_string);
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, MAX(id), COUNT(*)
                 FROM conversation_turns
                 WHERE ?1 IS NULL OR user_id = ?1
                 GROUP BY session_id
                 ORDER BY MAX(id) DESC
                 LIMIT ?2",
            )?;
            let sessions = stmt
                .query_map(params![user_id, limit as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut summaries = Vec::with_capacity(sessions.len());
            for (session_id, last_id, turn_count) in sessions {
                let last_activity: String = conn.query_row(
                    "SELECT timestamp FROM conversation_turns WHERE id = ?1",
                    params![last_id],
                    |row| row.get(0),
                )?;
                let first_question: Option<String> = conn
                    .query_row(
                        "SELECT content FROM conversation_turns
                         WHERE session_id = ?1 AND role = 'user'
                         ORDER BY id LIMIT 1",
                        params![session_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                summaries.push(SessionSummary {
                    title: first_question
                        .map(|q| excerpt(q.trim(), TITLE_CHARS))
                        .unwrap_or_else(|| "Untitled session".to_string()),
                    session_id,
                    last_activity: parse_timestamp(&last_activity)?,
                    turn_count: turn_count as u64,
                });
            }
            Ok(summaries)
        })
        .await
    }
}

/// Process-local store, lost on exit.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    turns: Mutex<Vec<ConversationTurn>>,
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(
        &self,
        session_id: &str,
        role: TurnRole,
        content: &str,
        user_id: Option<&str>,
    ) -> Result<(), HistoryError> {
        self.turns.lock().push(ConversationTurn {
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
            user_id: user_id.map(str::to_string),
        });
        Ok(())
    }

    async fn fetch(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, HistoryError> {
        let turns = self.turns.lock();
        let session: Vec<&ConversationTurn> =
            turns.iter().filter(|t| t.session_id == session_id).collect();
        let skip = session.len().saturating_sub(limit);
        Ok(session.into_iter().skip(skip).cloned().collect())
    }

    async fn recent_sessions(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SessionSummary>, HistoryError> {
        let turns = self.turns.lock();
        // session id -> (position of latest turn, summary)
        let mut sessions: HashMap<&str, (usize, SessionSummary)> = HashMap::new();
        for (pos, turn) in turns.iter().enumerate() {
            if user_id.is_some_and(|u| turn.user_id.as_deref() != Some(u)) {
                continue;
            }
            let entry = sessions.entry(&turn.session_id).or_insert_with(|| {
                (
                    pos,
                    SessionSummary {
                        session_id: turn.session_id.clone(),
                        title: String::new(),
                        last_activity: turn.timestamp,
                        turn_count: 0,
                    },
                )
            });
            entry.0 = pos;
            entry.1.last_activity = turn.timestamp;
            entry.1.turn_count += 1;
            if entry.1.title.is_empty() && turn.role == TurnRole::User {
                entry.1.title = excerpt(turn.content.trim(), TITLE_CHARS);
            }
        }

        let mut ordered: Vec<(usize, SessionSummary)> = sessions.into_values().collect();
        ordered.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(ordered
            .into_iter()
            .take(limit)
            .map(|(_, mut s)| {
                if s.title.is_empty() {
                    s.title = "Untitled session".to_string();
                }
                s
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise_store(store: &dyn HistoryStore) {
        store.append("s1", TurnRole::User, "How long do we keep logs?", Some("alice")).await.unwrap();
        store.append("s1", TurnRole::Assistant, "90 days.", Some("alice")).await.unwrap();
        store.append("s2", TurnRole::User, "Breach notice window?", Some("bob")).await.unwrap();
        store.append("s1", TurnRole::User, "And backups?", Some("alice")).await.unwrap();

        let all = store.fetch("s1", 20).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].content, "How long do we keep logs?");
        assert_eq!(all[2].content, "And backups?");
        assert_eq!(all[1].role, TurnRole::Assistant);

        let recent = store.fetch("s1", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "90 days.");
        assert_eq!(recent[1].content, "And backups?");

        assert!(store.fetch("missing", 5).await.unwrap().is_empty());

        let sessions = store.recent_sessions(None, 10).await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, "s1");
        assert_eq!(sessions[0].turn_count, 3);
        assert_eq!(sessions[0].title, "How long do we keep logs?");
        assert_eq!(sessions[1].session_id, "s2");

        let bobs = store.recent_sessions(Some("bob"), 10).await.unwrap();
        assert_eq!(bobs.len(), 1);
        assert_eq!(bobs[0].session_id, "s2");

        assert_eq!(store.recent_sessions(None, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        let store = SqliteHistoryStore::in_memory().unwrap();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryHistoryStore::default();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.db");
        {
            let store = SqliteHistoryStore::open(&path).unwrap();
            store.append("s1", TurnRole::User, "hello", None).await.unwrap();
        }
        let store = SqliteHistoryStore::open(&path).unwrap();
        let turns = store.fetch("s1", 10).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert!(turns[0].user_id.is_none());
    }

    #[tokio::test]
    async fn test_long_titles_are_shortened() {
        let store = InMemoryHistoryStore::default();
        let question = "q".repeat(100);
        store.append("s", TurnRole::User, &question, None).await.unwrap();
        let sessions = store.recent_sessions(None, 5).await.unwrap();
        assert_eq!(sessions[0].title.chars().count(), TITLE_CHARS + 3);
    }
}
