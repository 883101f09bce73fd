//! Conversation domain types.
//!
//! These are the value objects that flow between the session context store,
//! the persistence manager, and the durable memory service.

use serde::{Deserialize, Serialize};

/// Session used when a request arrives without one.
pub const DEFAULT_SESSION: &str = "default_session";

/// Unique identifier for a conversation session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    /// Use `session` if present and non-blank, otherwise the default session.
    pub fn or_default(session: Option<&str>) -> Self {
        match session {
            Some(s) if !s.trim().is_empty() => Self::from(s),
            _ => Self::from(DEFAULT_SESSION),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity under which conversation turns are attributed: the agent name
/// with separators collapsed to `-`, so `Ad_Load Agent` and `ad-load-agent`
/// style names stay stable across callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(String);

impl ActorId {
    pub fn from_agent(agent_name: &str) -> Self {
        Self(
            agent_name
                .trim()
                .chars()
                .map(|c| if c == '_' || c.is_whitespace() { '-' } else { c })
                .collect(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of a durable memory resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryId(pub String);

impl MemoryId {
    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    /// Empty ids and placeholder ids containing `default` do not name a real
    /// memory resource.
    pub fn is_configured(&self) -> bool {
        let id = self.0.trim();
        !id.is_empty() && !id.to_lowercase().contains("default")
    }
}

impl std::fmt::Display for MemoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One role-tagged message in a conversation. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    role: Role,
    text: String,
}

impl ConversationTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}
