//! SQLite-backed conversation store.
//!
//! The voice pipeline consumes two narrow capabilities from here:
//! [`AgentDirectory`] to resolve an agent configuration at connection
//! time, and [`ConversationWriter`] to persist the transcript. Storage
//! details stay behind those traits; the pipeline only assumes that
//! `add_message` is durable before the call returns.
//!
//! Tables:
//! - `agents`: one row per configured voice agent
//! - `conversations`: one row per accepted session
//! - `messages`: append-only transcript rows

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::path::Path;
use uuid::Uuid;

use crate::models::{AgentConfig, Conversation, Message, Role, Sentiment};

/// Read capability for agent configuration records.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn get_agent(&self, id: Uuid) -> Result<Option<AgentConfig>>;
}

/// Write capability for conversation persistence.
#[async_trait]
pub trait ConversationWriter: Send + Sync {
    /// Create the conversation record for a newly accepted session.
    async fn create(&self, agent_id: Uuid, session_id: &str) -> Result<Conversation>;

    /// Append one transcript message. Durable before this returns.
    async fn add_message(
        &self,
        conversation_id: Uuid,
        role: Role,
        content: &str,
        start_ms: i64,
        end_ms: i64,
        confidence: Option<f64>,
    ) -> Result<()>;

    /// Finalize the conversation: set `ended_at` and compute the duration.
    /// Idempotent: a second call for the same conversation is a no-op.
    async fn end(&self, conversation_id: Uuid, summary: &str, sentiment: Sentiment)
        -> Result<()>;
}

/// SQLite store implementing both capabilities.
pub struct SqliteStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path)?;
        Self::init(conn)
    }

    /// Open an in-memory database (tests, ephemeral deployments).
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self> {
        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                industry TEXT NOT NULL DEFAULT '',
                is_active INTEGER NOT NULL DEFAULT 1,
                system_prompt TEXT NOT NULL,
                greeting TEXT NOT NULL DEFAULT '',
                llm_model TEXT NOT NULL DEFAULT 'gpt-4o-mini',
                temperature REAL NOT NULL DEFAULT 0.7,
                max_tokens INTEGER NOT NULL DEFAULT 1024,
                voice_id TEXT NOT NULL DEFAULT '',
                voice_speed REAL NOT NULL DEFAULT 1.0,
                interruption_sensitivity REAL NOT NULL DEFAULT 0.5,
                silence_timeout_ms INTEGER NOT NULL DEFAULT 5000
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL REFERENCES agents(id),
                session_id TEXT NOT NULL UNIQUE,
                started_at INTEGER NOT NULL,
                ended_at INTEGER,
                duration_secs INTEGER NOT NULL DEFAULT 0,
                summary TEXT,
                sentiment TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_agent
                ON conversations(agent_id);

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                start_ms INTEGER NOT NULL,
                end_ms INTEGER NOT NULL,
                confidence REAL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace an agent record (startup seeding, tests).
    pub fn put_agent(&self, agent: &AgentConfig) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO agents (
                id, name, industry, is_active, system_prompt, greeting,
                llm_model, temperature, max_tokens, voice_id, voice_speed,
                interruption_sensitivity, silence_timeout_ms
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                agent.id.to_string(),
                agent.name,
                agent.industry,
                agent.is_active as i64,
                agent.system_prompt,
                agent.greeting,
                agent.llm_model,
                agent.temperature,
                agent.max_tokens as i64,
                agent.voice_id,
                agent.voice_speed,
                agent.interruption_sensitivity,
                agent.silence_timeout_ms as i64,
            ],
        )?;
        Ok(())
    }

    /// Whether any agent exists (used to decide development seeding).
    pub fn has_agents(&self) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM agents", [], |row| row.get(0))?;
        Ok(count > 0)
    }

    /// Fetch a conversation by its session id.
    pub fn get_conversation(&self, session_id: &str) -> Result<Option<Conversation>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            "SELECT id, agent_id, session_id, started_at, ended_at,
                    duration_secs, summary, sentiment
             FROM conversations WHERE session_id = ?1",
            rusqlite::params![session_id],
            row_to_conversation,
        );

        match row {
            Ok(conversation) => Ok(Some(conversation)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List a conversation's messages, ordered by start offset then
    /// insertion order.
    pub fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT conversation_id, role, content, start_ms, end_ms, confidence
             FROM messages WHERE conversation_id = ?1
             ORDER BY start_ms ASC, id ASC",
        )?;

        let rows = stmt.query_map(rusqlite::params![conversation_id.to_string()], |row| {
            let role_str: String = row.get(1)?;
            let conv_id: String = row.get(0)?;
            Ok((
                conv_id,
                role_str,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<f64>>(5)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (conv_id, role_str, content, start_ms, end_ms, confidence) = row?;
            let role = Role::from_str_role(&role_str)
                .ok_or_else(|| anyhow::anyhow!("unknown message role: {role_str}"))?;
            messages.push(Message {
                conversation_id: Uuid::parse_str(&conv_id)?,
                role,
                content,
                start_ms,
                end_ms,
                confidence,
            });
        }
        Ok(messages)
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id: String = row.get(0)?;
    let agent_id: String = row.get(1)?;
    let started_ms: i64 = row.get(3)?;
    let ended_ms: Option<i64> = row.get(4)?;
    let sentiment: Option<String> = row.get(7)?;

    Ok(Conversation {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        agent_id: Uuid::parse_str(&agent_id).unwrap_or_default(),
        session_id: row.get(2)?,
        started_at: millis_to_datetime(started_ms),
        ended_at: ended_ms.map(millis_to_datetime),
        duration_secs: row.get(5)?,
        summary: row.get(6)?,
        sentiment: sentiment.as_deref().and_then(Sentiment::from_str_label),
    })
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[async_trait]
impl AgentDirectory for SqliteStore {
    async fn get_agent(&self, id: Uuid) -> Result<Option<AgentConfig>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            "SELECT id, name, industry, is_active, system_prompt, greeting,
                    llm_model, temperature, max_tokens, voice_id, voice_speed,
                    interruption_sensitivity, silence_timeout_ms
             FROM agents WHERE id = ?1",
            rusqlite::params![id.to_string()],
            |row| {
                let id: String = row.get(0)?;
                Ok(AgentConfig {
                    id: Uuid::parse_str(&id).unwrap_or_default(),
                    name: row.get(1)?,
                    industry: row.get(2)?,
                    is_active: row.get::<_, i64>(3)? != 0,
                    system_prompt: row.get(4)?,
                    greeting: row.get(5)?,
                    llm_model: row.get(6)?,
                    temperature: row.get(7)?,
                    max_tokens: row.get::<_, i64>(8)? as u32,
                    voice_id: row.get(9)?,
                    voice_speed: row.get(10)?,
                    interruption_sensitivity: row.get(11)?,
                    silence_timeout_ms: row.get::<_, i64>(12)? as u64,
                })
            },
        );

        match row {
            Ok(agent) => Ok(Some(agent)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ConversationWriter for SqliteStore {
    async fn create(&self, agent_id: Uuid, session_id: &str) -> Result<Conversation> {
        let conversation = Conversation {
            id: Uuid::new_v4(),
            agent_id,
            session_id: session_id.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            duration_secs: 0,
            summary: None,
            sentiment: None,
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO conversations (id, agent_id, session_id, started_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                conversation.id.to_string(),
                agent_id.to_string(),
                session_id,
                conversation.started_at.timestamp_millis(),
            ],
        )?;

        tracing::info!(
            conversation_id = %conversation.id,
            session_id = session_id,
            agent_id = %agent_id,
            "Conversation created"
        );

        Ok(conversation)
    }

    async fn add_message(
        &self,
        conversation_id: Uuid,
        role: Role,
        content: &str,
        start_ms: i64,
        end_ms: i64,
        confidence: Option<f64>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO messages
                (conversation_id, role, content, start_ms, end_ms, confidence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                conversation_id.to_string(),
                role.as_str(),
                content,
                start_ms,
                end_ms,
                confidence,
            ],
        )?;
        Ok(())
    }

    async fn end(
        &self,
        conversation_id: Uuid,
        summary: &str,
        sentiment: Sentiment,
    ) -> Result<()> {
        let now = Utc::now();

        let conn = self.conn.lock();
        let started_ms: i64 = match conn.query_row(
            "SELECT started_at FROM conversations WHERE id = ?1 AND ended_at IS NULL",
            rusqlite::params![conversation_id.to_string()],
            |row| row.get(0),
        ) {
            Ok(ms) => ms,
            // Already finalized (or unknown id): idempotent no-op.
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let duration_secs = (now.timestamp_millis() - started_ms).max(0) / 1000;
        conn.execute(
            "UPDATE conversations
             SET ended_at = ?1, duration_secs = ?2, summary = ?3, sentiment = ?4
             WHERE id = ?5 AND ended_at IS NULL",
            rusqlite::params![
                now.timestamp_millis(),
                duration_secs,
                summary,
                sentiment.as_str(),
                conversation_id.to_string(),
            ],
        )?;

        tracing::info!(
            conversation_id = %conversation_id,
            duration_secs = duration_secs,
            "Conversation ended"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_agent() -> (SqliteStore, AgentConfig) {
        let store = SqliteStore::open_in_memory().unwrap();
        let agent = AgentConfig::demo();
        store.put_agent(&agent).unwrap();
        (store, agent)
    }

    #[tokio::test]
    async fn agent_round_trip() {
        let (store, agent) = store_with_agent();

        let fetched = store.get_agent(agent.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, agent.name);
        assert_eq!(fetched.industry, agent.industry);
        assert_eq!(fetched.max_tokens, agent.max_tokens);
        assert!(fetched.is_active);

        assert!(store.get_agent(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn open_on_disk_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SqliteStore::open(&dir.path().join("test.db")).unwrap();
        assert!(!store.has_agents().unwrap());
        store.put_agent(&AgentConfig::demo()).unwrap();
        assert!(store.has_agents().unwrap());
    }

    #[tokio::test]
    async fn conversation_create_and_end() {
        let (store, agent) = store_with_agent();

        let conversation = store.create(agent.id, "sess-1").await.unwrap();
        assert_eq!(conversation.session_id, "sess-1");
        assert!(conversation.ended_at.is_none());

        store
            .end(conversation.id, "Conversation ended", Sentiment::Neutral)
            .await
            .unwrap();

        let fetched = store.get_conversation("sess-1").unwrap().unwrap();
        assert!(fetched.ended_at.is_some());
        assert!(fetched.ended_at.unwrap() >= fetched.started_at);
        assert_eq!(fetched.duration_secs, 0);
        assert_eq!(fetched.summary.as_deref(), Some("Conversation ended"));
        assert_eq!(fetched.sentiment, Some(Sentiment::Neutral));
    }

    #[tokio::test]
    async fn end_is_idempotent() {
        let (store, agent) = store_with_agent();
        let conversation = store.create(agent.id, "sess-2").await.unwrap();

        store
            .end(conversation.id, "Conversation ended", Sentiment::Neutral)
            .await
            .unwrap();
        let first = store.get_conversation("sess-2").unwrap().unwrap();

        store
            .end(conversation.id, "second call", Sentiment::Negative)
            .await
            .unwrap();
        let second = store.get_conversation("sess-2").unwrap().unwrap();

        assert_eq!(first.ended_at, second.ended_at);
        assert_eq!(second.summary.as_deref(), Some("Conversation ended"));
        assert_eq!(second.sentiment, Some(Sentiment::Neutral));
    }

    #[tokio::test]
    async fn duplicate_session_id_rejected() {
        let (store, agent) = store_with_agent();
        store.create(agent.id, "sess-dup").await.unwrap();
        assert!(store.create(agent.id, "sess-dup").await.is_err());
    }

    #[tokio::test]
    async fn messages_ordered_by_offset_then_insertion() {
        let (store, agent) = store_with_agent();
        let conversation = store.create(agent.id, "sess-3").await.unwrap();

        store
            .add_message(conversation.id, Role::User, "hello there", 100, 100, Some(0.93))
            .await
            .unwrap();
        store
            .add_message(conversation.id, Role::Assistant, "Hi! How's it?", 250, 250, None)
            .await
            .unwrap();
        // Same offset as the first: insertion order breaks the tie.
        store
            .add_message(conversation.id, Role::User, "tie-breaker", 100, 100, None)
            .await
            .unwrap();

        let messages = store.list_messages(conversation.id).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "hello there");
        assert_eq!(messages[1].content, "tie-breaker");
        assert_eq!(messages[2].content, "Hi! How's it?");
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[2].role, Role::Assistant);
        assert_eq!(messages[0].confidence, Some(0.93));
    }

    #[tokio::test]
    async fn unknown_session_returns_none() {
        let (store, _) = store_with_agent();
        assert!(store.get_conversation("missing").unwrap().is_none());
    }
}
