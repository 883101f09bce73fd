//! Durable conversation memory: the long-term store that outlives the
//! process and the in-process session context.
//!
//! The service is addressed through session handles: one handle per
//! `(actor, session)` pair. Rebinding to a different actor or session means
//! creating a new handle, never mutating an existing one.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;
use crate::message::{ActorId, Role, SessionId};

/// A message as the memory service stores and returns it.
///
/// `content` is kept loosely typed: the service may hand back
/// `{"text": "..."}`, a bare string, or something else entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: String,
    pub content: serde_json::Value,
}

impl StoredMessage {
    pub fn text(role: Role, text: &str) -> Self {
        Self {
            role: role.as_str().to_uppercase(),
            content: serde_json::json!({ "text": text }),
        }
    }

    pub fn is_user(&self) -> bool {
        self.role.eq_ignore_ascii_case("user")
    }

    /// Best-effort extraction of the message text.
    pub fn extract_text(&self) -> String {
        match &self.content {
            serde_json::Value::Object(map) => match map.get("text") {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => self.content.to_string(),
            },
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// A message to append to durable memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationalMessage {
    pub text: String,
    pub role: Role,
}

impl ConversationalMessage {
    pub fn new(text: impl Into<String>, role: Role) -> Self {
        Self {
            text: text.into(),
            role,
        }
    }
}

impl From<&ConversationalMessage> for StoredMessage {
    fn from(message: &ConversationalMessage) -> Self {
        StoredMessage::text(message.role, &message.text)
    }
}

/// A turn: the messages from one user message up to (not including) the
/// next user message.
pub type Turn = Vec<StoredMessage>;

/// Regroup a flat, chronological message list into turns. Leading
/// non-user messages form their own turn.
pub fn group_into_turns(messages: impl IntoIterator<Item = StoredMessage>) -> Vec<Turn> {
    let mut turns: Vec<Turn> = Vec::new();
    for message in messages {
        match turns.last_mut() {
            Some(turn) if !message.is_user() => turn.push(message),
            _ => turns.push(vec![message]),
        }
    }
    turns
}

/// The durable memory service.
///
/// Implementations: SQLite, in-memory (see `adcp-memory`).
#[async_trait]
pub trait MemoryService: Send + Sync {
    /// The backend name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    /// Open a handle for `(actor, session)`.
    async fn create_session(
        &self,
        actor_id: &ActorId,
        session_id: &SessionId,
    ) -> Result<Arc<dyn MemorySession>, MemoryError>;
}

/// A durable session handle bound to one `(actor, session)` pair.
#[async_trait]
pub trait MemorySession: Send + Sync {
    fn actor_id(&self) -> &ActorId;

    fn session_id(&self) -> &SessionId;

    /// The last `k` turns, oldest first.
    async fn get_last_k_turns(&self, k: usize) -> Result<Vec<Turn>, MemoryError>;

    /// Append messages as one event.
    async fn add_turns(&self, messages: Vec<ConversationalMessage>) -> Result<(), MemoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_handles_all_shapes() {
        let dict = StoredMessage {
            role: "USER".into(),
            content: serde_json::json!({"text": "hi"}),
        };
        let bare = StoredMessage {
            role: "ASSISTANT".into(),
            content: serde_json::json!("hello"),
        };
        let other = StoredMessage {
            role: "ASSISTANT".into(),
            content: serde_json::json!([1, 2]),
        };
        assert_eq!(dict.extract_text(), "hi");
        assert_eq!(bare.extract_text(), "hello");
        assert_eq!(other.extract_text(), "[1,2]");
        assert!(dict.is_user());
        assert!(!bare.is_user());
    }

    #[test]
    fn grouping_starts_a_turn_at_each_user_message() {
        let messages = vec![
            StoredMessage::text(Role::Assistant, "welcome"),
            StoredMessage::text(Role::User, "q1"),
            StoredMessage::text(Role::Assistant, "a1"),
            StoredMessage::text(Role::User, "q2"),
            StoredMessage::text(Role::Assistant, "a2a"),
            StoredMessage::text(Role::Assistant, "a2b"),
        ];
        let turns = group_into_turns(messages);
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].len(), 1);
        assert_eq!(turns[1][0].extract_text(), "q1");
        assert_eq!(turns[2].len(), 3);
    }
}
