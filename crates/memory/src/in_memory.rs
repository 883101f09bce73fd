//! In-memory memory service for testing and ephemeral deployments.
//!
//! Counts reads and writes and accepts injected faults so callers can check
//! "zero durable writes" and exercise outage handling.

use async_trait::async_trait;
use adcp_core::error::MemoryError;
use adcp_core::memory::{
    ConversationalMessage, MemoryService, MemorySession, StoredMessage, Turn, group_into_turns,
};
use adcp_core::message::{ActorId, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// What an injected fault does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryFault {
    Unavailable,
    /// Never answer
    Hang,
}

async fn trigger(fault: MemoryFault, operation: &str) -> MemoryError {
    if fault == MemoryFault::Hang {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
    MemoryError::Unavailable(format!("injected fault in {operation}"))
}

type Key = (ActorId, SessionId);

#[derive(Default)]
struct Shared {
    events: RwLock<HashMap<Key, Vec<Vec<StoredMessage>>>>,
    create_fault: RwLock<Option<MemoryFault>>,
    read_fault: RwLock<Option<MemoryFault>>,
    write_fault: RwLock<Option<MemoryFault>>,
    sessions_created: AtomicUsize,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

/// A memory service holding events in a `HashMap`.
#[derive(Clone, Default)]
pub struct InMemoryMemoryService {
    shared: Arc<Shared>,
}

impl InMemoryMemoryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `messages` as one event without going through a session.
    pub async fn seed(&self, actor: &ActorId, session: &SessionId, messages: Vec<StoredMessage>) {
        self.shared
            .events
            .write()
            .await
            .entry((actor.clone(), session.clone()))
            .or_default()
            .push(messages);
    }

    /// Every stored message for `(actor, session)`, oldest first.
    pub async fn messages(&self, actor: &ActorId, session: &SessionId) -> Vec<StoredMessage> {
        self.shared
            .events
            .read()
            .await
            .get(&(actor.clone(), session.clone()))
            .map(|events| events.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn set_create_fault(&self, fault: Option<MemoryFault>) {
        *self.shared.create_fault.write().await = fault;
    }

    pub async fn set_read_fault(&self, fault: Option<MemoryFault>) {
        *self.shared.read_fault.write().await = fault;
    }

    pub async fn set_write_fault(&self, fault: Option<MemoryFault>) {
        *self.shared.write_fault.write().await = fault;
    }

    pub fn sessions_created(&self) -> usize {
        self.shared.sessions_created.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.shared.reads.load(Ordering::SeqCst)
    }

    /// Number of `add_turns` calls that reached the store.
    pub fn writes(&self) -> usize {
        self.shared.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MemoryService for InMemoryMemoryService {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn create_session(
        &self,
        actor_id: &ActorId,
        session_id: &SessionId,
    ) -> Result<Arc<dyn MemorySession>, MemoryError> {
        let fault = *self.shared.create_fault.read().await;
        if let Some(fault) = fault {
            return Err(trigger(fault, "create_session").await);
        }
        self.shared.sessions_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemorySession {
            actor_id: actor_id.clone(),
            session_id: session_id.clone(),
            shared: self.shared.clone(),
        }))
    }
}

struct InMemorySession {
    actor_id: ActorId,
    session_id: SessionId,
    shared: Arc<Shared>,
}

impl InMemorySession {
    fn key(&self) -> Key {
        (self.actor_id.clone(), self.session_id.clone())
    }
}

#[async_trait]
impl MemorySession for InMemorySession {
    fn actor_id(&self) -> &ActorId {
        &self.actor_id
    }

    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    async fn get_last_k_turns(&self, k: usize) -> Result<Vec<Turn>, MemoryError> {
        let fault = *self.shared.read_fault.read().await;
        if let Some(fault) = fault {
            return Err(trigger(fault, "get_last_k_turns").await);
        }
        self.shared.reads.fetch_add(1, Ordering::SeqCst);

        let events = self.shared.events.read().await;
        let messages: Vec<StoredMessage> = events
            .get(&self.key())
            .map(|events| events.iter().flatten().cloned().collect())
            .unwrap_or_default();
        let mut turns = group_into_turns(messages);
        let skip = turns.len().saturating_sub(k);
        Ok(turns.split_off(skip))
    }

    async fn add_turns(&self, messages: Vec<ConversationalMessage>) -> Result<(), MemoryError> {
        let fault = *self.shared.write_fault.read().await;
        if let Some(fault) = fault {
            return Err(trigger(fault, "add_turns").await);
        }
        if messages.is_empty() {
            return Err(MemoryError::InvalidTurn("empty event".into()));
        }
        self.shared.writes.fetch_add(1, Ordering::SeqCst);
        let event: Vec<StoredMessage> = messages.iter().map(StoredMessage::from).collect();
        self.shared
            .events
            .write()
            .await
            .entry(self.key())
            .or_default()
            .push(event);
        Ok(())
    }
}
