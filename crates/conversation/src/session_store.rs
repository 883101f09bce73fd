//! Per-session, per-agent conversation history.
//!
//! When the orchestrator switches from one agent to another inside a
//! session, the outgoing agent's live history is saved here and the
//! incoming agent's previously saved history (if any) is handed back.
//!
//! Two bounds apply per agent: `max_live_turns` for checkpoints of an agent
//! that is still engaged, and the smaller `max_switch_turns` for the
//! continuity snapshot taken on a switch. Trimming always drops the oldest
//! turns first. The number of sessions is bounded too; the least recently
//! used session is evicted when a new one would exceed it.

use adcp_core::event::{DomainEvent, EventBus};
use adcp_core::message::{ActorId, ConversationTurn, SessionId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

// ── Bounds ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBounds {
    pub max_live_turns: usize,
    pub max_switch_turns: usize,
    pub max_sessions: usize,
}

impl Default for SessionBounds {
    fn default() -> Self {
        Self {
            max_live_turns: 30,
            max_switch_turns: 8,
            max_sessions: 1024,
        }
    }
}

/// The most recent `bound` turns of `turns`, in original order, as an
/// owned copy.
pub fn trim_turns(turns: &[ConversationTurn], bound: usize) -> Vec<ConversationTurn> {
    let skip = turns.len().saturating_sub(bound);
    turns[skip..].to_vec()
}

// ── Stats ─────────────────────────────────────────────────────────────────

/// Diagnostic snapshot: session count and per-agent turn counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub sessions: usize,
    /// session id → actor id → saved turns
    pub agents: BTreeMap<String, BTreeMap<String, usize>>,
}

impl SessionStats {
    pub fn agents_in(&self, session: &str) -> Vec<&str> {
        self.agents
            .get(session)
            .map(|agents| agents.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

// ── Store ─────────────────────────────────────────────────────────────────

/// A saved agent history and how much of it durable memory already holds.
#[derive(Debug, Clone, Default)]
pub struct SavedContext {
    pub turns: Vec<ConversationTurn>,
    /// Leading turns already written to durable memory
    pub durable: usize,
}

#[derive(Default)]
struct SessionEntry {
    agents: HashMap<ActorId, SavedContext>,
    last_access: u64,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, SessionEntry>,
    clock: u64,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Drop least recently used sessions (never `keep`) until at most
    /// `max_sessions` remain.
    fn evict_over(&mut self, max_sessions: usize, keep: &SessionId) -> Vec<SessionId> {
        let mut evicted = Vec::new();
        while self.sessions.len() > max_sessions {
            let oldest = self
                .sessions
                .iter()
                .filter(|(id, _)| *id != keep)
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(id, _)| id.clone());
            let Some(oldest) = oldest else {
                break;
            };
            self.sessions.remove(&oldest);
            evicted.push(oldest);
        }
        evicted
    }
}

/// Process-wide store of saved per-agent histories, keyed by session.
///
/// All updates go through one mutex, so concurrent saves for the same
/// `(session, agent)` never lose an update.
pub struct SessionContextStore {
    bounds: SessionBounds,
    inner: Mutex<Inner>,
    events: Option<Arc<EventBus>>,
}

impl SessionContextStore {
    pub fn new(bounds: SessionBounds) -> Self {
        Self {
            bounds,
            inner: Mutex::new(Inner::default()),
            events: None,
        }
    }

    /// Publish `ContextSaved` on every switch save.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn bounds(&self) -> SessionBounds {
        self.bounds
    }

    /// Save the outgoing agent's history on an agent switch, keeping only
    /// the last `max_switch_turns`. Returns the number of turns stored.
    ///
    /// Nothing in `live` is assumed to be in durable memory; see
    /// [`Self::save_context_on_switch`].
    pub async fn save_on_switch(
        &self,
        session: &SessionId,
        agent: &ActorId,
        live: &[ConversationTurn],
    ) -> usize {
        self.save_context_on_switch(session, agent, live, 0).await
    }

    /// [`Self::save_on_switch`] for a history whose first `durable` turns
    /// were written to durable memory.
    pub async fn save_context_on_switch(
        &self,
        session: &SessionId,
        agent: &ActorId,
        live: &[ConversationTurn],
        durable: usize,
    ) -> usize {
        let stored = self
            .save(session, agent, live, durable, self.bounds.max_switch_turns)
            .await;
        info!(
            session_id = %session,
            actor_id = %agent,
            turns = stored,
            "Saved agent context on switch"
        );
        if let Some(events) = &self.events {
            events.publish(DomainEvent::ContextSaved {
                session_id: session.to_string(),
                actor_id: agent.to_string(),
                turns: stored,
                timestamp: Utc::now(),
            });
        }
        stored
    }

    /// Checkpoint an agent that is still engaged, keeping the last
    /// `max_live_turns`.
    pub async fn save_live(
        &self,
        session: &SessionId,
        agent: &ActorId,
        live: &[ConversationTurn],
    ) -> usize {
        self.save(session, agent, live, 0, self.bounds.max_live_turns)
            .await
    }

    async fn save(
        &self,
        session: &SessionId,
        agent: &ActorId,
        live: &[ConversationTurn],
        durable: usize,
        bound: usize,
    ) -> usize {
        let turns = trim_turns(live, bound);
        let dropped = live.len() - turns.len();
        let stored = turns.len();
        let snapshot = SavedContext {
            durable: durable.min(live.len()).saturating_sub(dropped),
            turns,
        };

        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        let entry = inner.sessions.entry(session.clone()).or_default();
        entry.last_access = now;
        entry.agents.insert(agent.clone(), snapshot);

        for evicted in inner.evict_over(self.bounds.max_sessions, session) {
            debug!(session_id = %evicted, "Evicted least recently used session");
        }
        stored
    }

    /// The incoming agent's saved history, oldest first. Empty when the
    /// agent has never been saved in this session.
    pub async fn restore_on_switch(
        &self,
        session: &SessionId,
        agent: &ActorId,
    ) -> Vec<ConversationTurn> {
        self.restore_context_on_switch(session, agent).await.turns
    }

    /// [`Self::restore_on_switch`] together with the durable prefix length
    /// recorded at save time.
    pub async fn restore_context_on_switch(
        &self,
        session: &SessionId,
        agent: &ActorId,
    ) -> SavedContext {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        let Some(entry) = inner.sessions.get_mut(session) else {
            return SavedContext::default();
        };
        entry.last_access = now;
        let restored = entry.agents.get(agent).cloned().unwrap_or_default();
        debug!(
            session_id = %session,
            actor_id = %agent,
            turns = restored.turns.len(),
            durable = restored.durable,
            "Restored agent context"
        );
        restored
    }

    /// Drop every agent's history for `session`. Returns whether the
    /// session existed.
    pub async fn clear_session(&self, session: &SessionId) -> bool {
        let removed = self.inner.lock().await.sessions.remove(session).is_some();
        if removed {
            info!(session_id = %session, "Cleared session context");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> SessionStats {
        let inner = self.inner.lock().await;
        let agents = inner
            .sessions
            .iter()
            .map(|(session, entry)| {
                let per_agent = entry
                    .agents
                    .iter()
                    .map(|(agent, saved)| (agent.to_string(), saved.turns.len()))
                    .collect();
                (session.to_string(), per_agent)
            })
            .collect();
        SessionStats {
            sessions: inner.sessions.len(),
            agents,
        }
    }
}

impl Default for SessionContextStore {
    fn default() -> Self {
        Self::new(SessionBounds::default())
    }
}
