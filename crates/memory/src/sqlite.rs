//! SQLite memory service.
//!
//! A single table, `memory_messages`, holds one row per stored message.
//! Messages written by the same `add_turns` call share an `event_id`; reads
//! look at the most recent `2k` events and regroup their messages into turns.

use async_trait::async_trait;
use adcp_core::error::MemoryError;
use adcp_core::memory::{
    ConversationalMessage, MemoryService, MemorySession, StoredMessage, Turn, group_into_turns,
};
use adcp_core::message::{ActorId, MemoryId, SessionId};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

fn storage(context: &str, e: sqlx::Error) -> MemoryError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            MemoryError::Unavailable(format!("{context}: {e}"))
        }
        other => MemoryError::Storage(format!("{context}: {other}")),
    }
}

/// A memory service backed by one SQLite file, scoped to one memory id.
#[derive(Clone)]
pub struct SqliteMemoryService {
    pool: SqlitePool,
    memory_id: MemoryId,
}

impl SqliteMemoryService {
    /// Open (creating if missing) the database at `path`.
    ///
    /// Pass `"sqlite::memory:"` for an ephemeral database.
    pub async fn new(path: &str, memory_id: MemoryId) -> Result<Self, MemoryError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| MemoryError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let max_connections = if path.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| storage("Failed to open SQLite", e))?;

        let service = Self { pool, memory_id };
        service.run_migrations().await?;
        info!(path = %path, memory_id = %service.memory_id, "SQLite memory service initialized");
        Ok(service)
    }

    pub async fn from_pool(pool: SqlitePool, memory_id: MemoryId) -> Result<Self, MemoryError> {
        let service = Self { pool, memory_id };
        service.run_migrations().await?;
        Ok(service)
    }

    async fn run_migrations(&self) -> Result<(), MemoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memory_messages (
                iid         INTEGER PRIMARY KEY AUTOINCREMENT,
                memory_id   TEXT NOT NULL,
                actor_id    TEXT NOT NULL,
                session_id  TEXT NOT NULL,
                event_id    TEXT NOT NULL,
                role        TEXT NOT NULL,
                content     TEXT NOT NULL,
                created_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| storage("memory_messages table", e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_memory_messages_session \
             ON memory_messages(memory_id, actor_id, session_id, iid)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| storage("session index", e))?;

        debug!("SQLite memory migrations complete");
        Ok(())
    }
}

#[async_trait]
impl MemoryService for SqliteMemoryService {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_session(
        &self,
        actor_id: &ActorId,
        session_id: &SessionId,
    ) -> Result<Arc<dyn MemorySession>, MemoryError> {
        // Liveness check so an unusable database shows up here rather
        // than on the first write
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| storage("create_session", e))?;

        Ok(Arc::new(SqliteSession {
            pool: self.pool.clone(),
            memory_id: self.memory_id.clone(),
            actor_id: actor_id.clone(),
            session_id: session_id.clone(),
        }))
    }
}

struct SqliteSession {
    pool: SqlitePool,
    memory_id: MemoryId,
    actor_id: ActorId,
    session_id: SessionId,
}

#[async_trait]
impl MemorySession for SqliteSession {
    fn actor_id(&self) -> &ActorId {
        &self.actor_id
    }

    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    async fn get_last_k_turns(&self, k: usize) -> Result<Vec<Turn>, MemoryError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let max_events = (k * 2) as i64;

        let rows = sqlx::query(
            r#"
            SELECT role, content FROM memory_messages
            WHERE memory_id = ?1 AND actor_id = ?2 AND session_id = ?3
              AND event_id IN (
                SELECT event_id FROM memory_messages
                WHERE memory_id = ?1 AND actor_id = ?2 AND session_id = ?3
                GROUP BY event_id
                ORDER BY MAX(iid) DESC
                LIMIT ?4
              )
            ORDER BY iid ASC
            "#,
        )
        .bind(&self.memory_id.0)
        .bind(self.actor_id.as_str())
        .bind(self.session_id.as_str())
        .bind(max_events)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage("get_last_k_turns", e))?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let role: String = row
                .try_get("role")
                .map_err(|e| MemoryError::Storage(format!("role column: {e}")))?;
            let content: String = row
                .try_get("content")
                .map_err(|e| MemoryError::Storage(format!("content column: {e}")))?;
            let content = serde_json::from_str(&content)
                .unwrap_or(serde_json::Value::String(content));
            messages.push(StoredMessage { role, content });
        }

        let mut turns = group_into_turns(messages);
        let skip = turns.len().saturating_sub(k);
        Ok(turns.split_off(skip))
    }

    async fn add_turns(&self, messages: Vec<ConversationalMessage>) -> Result<(), MemoryError> {
        if messages.is_empty() {
            return Err(MemoryError::InvalidTurn("empty event".into()));
        }
        let event_id = Uuid::new_v4().to_string();
        let created_at = Utc::now().to_rfc3339();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage("begin add_turns", e))?;
        for message in &messages {
            let stored = StoredMessage::from(message);
            sqlx::query(
                r#"
                INSERT INTO memory_messages
                    (memory_id, actor_id, session_id, event_id, role, content, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(&self.memory_id.0)
            .bind(self.actor_id.as_str())
            .bind(self.session_id.as_str())
            .bind(&event_id)
            .bind(&stored.role)
            .bind(stored.content.to_string())
            .bind(&created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage("INSERT message", e))?;
        }
        tx.commit().await.map_err(|e| storage("commit add_turns", e))?;

        debug!(
            actor_id = %self.actor_id,
            session_id = %self.session_id,
            messages = messages.len(),
            "Stored memory event"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adcp_core::message::Role;

    async fn temp_service() -> (tempfile::TempDir, SqliteMemoryService) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        let service = SqliteMemoryService::new(
            &format!("sqlite://{}", path.display()),
            MemoryId::from("mem-test"),
        )
        .await
        .unwrap();
        (dir, service)
    }

    #[tokio::test]
    async fn roundtrip_preserves_order_and_grouping() {
        let (_dir, service) = temp_service().await;
        let handle = service
            .create_session(&ActorId::from_agent("Planner"), &SessionId::from("s1"))
            .await
            .unwrap();

        handle
            .add_turns(vec![
                ConversationalMessage::new("q1", Role::User),
                ConversationalMessage::new("a1", Role::Assistant),
            ])
            .await
            .unwrap();
        handle
            .add_turns(vec![
                ConversationalMessage::new("q2", Role::User),
                ConversationalMessage::new("a2", Role::Assistant),
            ])
            .await
            .unwrap();

        let turns = handle.get_last_k_turns(5).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0][0].role, "USER");
        assert_eq!(turns[0][0].extract_text(), "q1");
        assert_eq!(turns[1][1].extract_text(), "a2");
    }

    #[tokio::test]
    async fn last_k_limits_turns() {
        let (_dir, service) = temp_service().await;
        let handle = service
            .create_session(&ActorId::from_agent("Planner"), &SessionId::from("s1"))
            .await
            .unwrap();
        for i in 0..6 {
            handle
                .add_turns(vec![
                    ConversationalMessage::new(format!("q{i}"), Role::User),
                    ConversationalMessage::new(format!("a{i}"), Role::Assistant),
                ])
                .await
                .unwrap();
        }

        let turns = handle.get_last_k_turns(3).await.unwrap();
        let firsts: Vec<String> = turns.iter().map(|t| t[0].extract_text()).collect();
        assert_eq!(firsts, vec!["q3", "q4", "q5"]);
    }

    #[tokio::test]
    async fn memory_ids_and_sessions_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("memory.db").display());
        let one = SqliteMemoryService::new(&url, MemoryId::from("mem-1")).await.unwrap();
        let two = SqliteMemoryService::new(&url, MemoryId::from("mem-2")).await.unwrap();
        let actor = ActorId::from_agent("Planner");

        let h1 = one.create_session(&actor, &SessionId::from("s1")).await.unwrap();
        h1.add_turns(vec![ConversationalMessage::new("hello", Role::User)])
            .await
            .unwrap();

        let other_memory = two.create_session(&actor, &SessionId::from("s1")).await.unwrap();
        let other_session = one.create_session(&actor, &SessionId::from("s2")).await.unwrap();
        assert!(other_memory.get_last_k_turns(5).await.unwrap().is_empty());
        assert!(other_session.get_last_k_turns(5).await.unwrap().is_empty());
        assert_eq!(h1.get_last_k_turns(5).await.unwrap().len(), 1);
    }
}
