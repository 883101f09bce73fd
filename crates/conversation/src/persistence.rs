//! Mirrors an agent's live message list into durable conversation memory.
//!
//! A manager is bound to one `(actor, session)` pair. It is **Unbound** when
//! no memory service is configured, the memory id is a placeholder, or the
//! durable session handle could not be created; an Unbound manager never
//! touches durable memory but still reduces context.
//!
//! A cursor records the highest live index already written. Writes only
//! ever send what lies past it, so re-applying an unchanged list is a no-op.
//!
//! Restore failures are returned to the caller. Write failures are logged,
//! announced as `PersistenceFailed`, and otherwise dropped.

use adcp_core::error::MemoryError;
use adcp_core::event::{DomainEvent, EventBus};
use adcp_core::memory::{ConversationalMessage, MemoryService, MemorySession};
use adcp_core::message::{ActorId, ConversationTurn, MemoryId, Role, SessionId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::history::is_conversational;
use crate::reducer::{ContextReducer, ReduceTrigger, Reduction};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PersistenceOptions {
    /// Turns fetched on restore
    pub max_turns_to_retrieve: usize,
    /// Longer messages are cut before writing
    pub max_message_chars: usize,
    /// Applies to every durable-memory call
    pub timeout: Duration,
    pub auto_persist: bool,
}

impl Default for PersistenceOptions {
    fn default() -> Self {
        Self {
            max_turns_to_retrieve: 10,
            max_message_chars: 9000,
            timeout: Duration::from_secs(5),
            auto_persist: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingState {
    Unbound,
    Bound,
}

/// Serializable snapshot of a manager, for carrying its cursor across
/// process-level session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceState {
    pub memory_id: String,
    pub actor_id: String,
    pub session_id: String,
    /// Highest live index already written, if any
    pub last_persisted_index: Option<usize>,
    pub removed_count: usize,
}

struct Binding {
    handle: Option<Arc<dyn MemorySession>>,
    last_persisted: Option<usize>,
    removed_count: usize,
}

impl Binding {
    fn next_index(&self) -> usize {
        self.last_persisted.map_or(0, |i| i + 1)
    }
}

/// Cut `text` to at most `max` characters on a char boundary.
fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub struct ConversationPersistenceManager {
    service: Option<Arc<dyn MemoryService>>,
    memory_id: MemoryId,
    actor_id: ActorId,
    session_id: SessionId,
    options: PersistenceOptions,
    reducer: Arc<dyn ContextReducer>,
    events: Option<Arc<EventBus>>,
    binding: Arc<Mutex<Binding>>,
}

impl ConversationPersistenceManager {
    /// Bind to `(actor_id, session_id)`, creating the durable session handle
    /// when memory is configured.
    pub async fn new(
        service: Option<Arc<dyn MemoryService>>,
        memory_id: MemoryId,
        actor_id: ActorId,
        session_id: SessionId,
        options: PersistenceOptions,
        reducer: Arc<dyn ContextReducer>,
    ) -> Self {
        let handle = open_handle(
            service.as_deref(),
            &memory_id,
            &actor_id,
            &session_id,
            options.timeout,
        )
        .await;
        Self {
            service,
            memory_id,
            actor_id,
            session_id,
            options,
            reducer,
            events: None,
            binding: Arc::new(Mutex::new(Binding {
                handle,
                last_persisted: None,
                removed_count: 0,
            })),
        }
    }

    /// Publish `PersistenceFailed` when a write is dropped.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn actor_id(&self) -> &ActorId {
        &self.actor_id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub async fn binding_state(&self) -> BindingState {
        if self.binding.lock().await.handle.is_some() {
            BindingState::Bound
        } else {
            BindingState::Unbound
        }
    }

    /// Highest live index already written.
    pub async fn cursor(&self) -> Option<usize> {
        self.binding.lock().await.last_persisted
    }

    /// Treat the first `count` live messages as already written, e.g. when
    /// seeding from a snapshot that was flushed by a previous binding. Never
    /// moves the cursor backwards.
    pub async fn mark_persisted(&self, count: usize) {
        let Some(index) = count.checked_sub(1) else {
            return;
        };
        let mut binding = self.binding.lock().await;
        binding.last_persisted = binding.last_persisted.max(Some(index));
    }

    /// Fetch recent history from durable memory.
    ///
    /// `Ok(None)` means the manager is Unbound. `Ok(Some(vec![]))` means the
    /// store answered and has no history. Tool plumbing and near-empty
    /// messages are filtered out. On success the cursor moves to the end of
    /// the restored turns so they are never written back; it never moves
    /// backwards past messages this binding already wrote.
    pub async fn restore(&self) -> Result<Option<Vec<ConversationTurn>>, MemoryError> {
        let Some(handle) = self.binding.lock().await.handle.clone() else {
            debug!(actor_id = %self.actor_id, "Memory not bound, skipping restore");
            return Ok(None);
        };

        let fetched = tokio::time::timeout(
            self.options.timeout,
            handle.get_last_k_turns(self.options.max_turns_to_retrieve),
        )
        .await
        .map_err(|_| MemoryError::Timeout {
            operation: "get_last_k_turns".into(),
            timeout_ms: self.options.timeout.as_millis() as u64,
        })
        .and_then(|result| result);

        let turns = match fetched {
            Ok(turns) => turns,
            Err(e) => {
                error!(
                    actor_id = %self.actor_id,
                    session_id = %self.session_id,
                    error = %e,
                    "Failed to restore conversation history"
                );
                return Err(e);
            }
        };

        let restored: Vec<ConversationTurn> = turns
            .into_iter()
            .flatten()
            .filter_map(|message| {
                let text = message.extract_text();
                if !is_conversational(&text) {
                    return None;
                }
                let role = if message.is_user() {
                    Role::User
                } else {
                    Role::Assistant
                };
                Some(ConversationTurn::new(role, text))
            })
            .collect();

        let mut binding = self.binding.lock().await;
        binding.last_persisted = binding.last_persisted.max(restored.len().checked_sub(1));
        drop(binding);
        info!(
            actor_id = %self.actor_id,
            session_id = %self.session_id,
            turns = restored.len(),
            "Restored conversation history"
        );
        Ok(Some(restored))
    }

    /// Write every live message past the cursor as one durable event.
    ///
    /// Returns the number of messages written. The write runs in its own
    /// task, so dropping this future after the write started does not
    /// abort it. Failures are logged and leave the cursor where it was.
    pub async fn apply_management(&self, current: &[ConversationTurn]) -> usize {
        if !self.options.auto_persist {
            return 0;
        }

        let mut binding = self.binding.clone().lock_owned().await;
        let Some(handle) = binding.handle.clone() else {
            return 0;
        };
        let start = binding.next_index();
        if start >= current.len() {
            return 0;
        }

        let messages: Vec<ConversationalMessage> = current[start..]
            .iter()
            .map(|turn| {
                ConversationalMessage::new(
                    truncate_chars(turn.text(), self.options.max_message_chars),
                    turn.role(),
                )
            })
            .collect();
        let count = messages.len();
        let last_index = current.len() - 1;
        let timeout = self.options.timeout;
        let events = self.events.clone();
        let actor_id = self.actor_id.clone();
        let session_id = self.session_id.clone();

        let write = tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, handle.add_turns(messages))
                .await
                .map_err(|_| MemoryError::Timeout {
                    operation: "add_turns".into(),
                    timeout_ms: timeout.as_millis() as u64,
                })
                .and_then(|result| result);

            match result {
                Ok(()) => {
                    binding.last_persisted = Some(last_index);
                    debug!(
                        actor_id = %actor_id,
                        session_id = %session_id,
                        messages = count,
                        "Persisted messages"
                    );
                    count
                }
                Err(e) => {
                    error!(
                        actor_id = %actor_id,
                        session_id = %session_id,
                        error = %e,
                        "Failed to persist messages"
                    );
                    if let Some(events) = events {
                        events.publish(DomainEvent::PersistenceFailed {
                            session_id: session_id.to_string(),
                            actor_id: actor_id.to_string(),
                            error_message: e.to_string(),
                            timestamp: Utc::now(),
                        });
                    }
                    0
                }
            }
        });

        match write.await {
            Ok(written) => written,
            Err(e) => {
                error!(error = %e, "Persistence task failed");
                0
            }
        }
    }

    /// Shrink `turns` with the configured reducer, then move the cursor to
    /// the new end.
    ///
    /// Pending messages are flushed first, so what the reducer removes is
    /// already durable and is not written a second time.
    pub async fn reduce_context(
        &self,
        turns: &mut Vec<ConversationTurn>,
        trigger: ReduceTrigger,
    ) -> Reduction {
        self.apply_management(turns).await;

        let reduction = self.reducer.reduce(turns, trigger).await;

        let mut binding = self.binding.lock().await;
        binding.last_persisted = turns.len().checked_sub(1);
        binding.removed_count += reduction.removed;
        info!(
            actor_id = %self.actor_id,
            reducer = self.reducer.name(),
            removed = reduction.removed,
            total_removed = binding.removed_count,
            "Context reduced"
        );
        reduction
    }

    /// Rebind to a different actor or session. The durable session handle
    /// is recreated and the cursor reset; a failed rebind leaves the
    /// manager Unbound.
    pub async fn update_session_info(&mut self, actor_id: ActorId, session_id: SessionId) {
        if actor_id == self.actor_id && session_id == self.session_id {
            return;
        }
        let handle = open_handle(
            self.service.as_deref(),
            &self.memory_id,
            &actor_id,
            &session_id,
            self.options.timeout,
        )
        .await;

        let mut binding = self.binding.lock().await;
        binding.handle = handle;
        binding.last_persisted = None;
        info!(
            from_actor = %self.actor_id,
            to_actor = %actor_id,
            session_id = %session_id,
            bound = binding.handle.is_some(),
            "Rebound conversation memory"
        );
        drop(binding);

        self.actor_id = actor_id;
        self.session_id = session_id;
    }

    pub async fn state(&self) -> PersistenceState {
        let binding = self.binding.lock().await;
        PersistenceState {
            memory_id: self.memory_id.to_string(),
            actor_id: self.actor_id.to_string(),
            session_id: self.session_id.to_string(),
            last_persisted_index: binding.last_persisted,
            removed_count: binding.removed_count,
        }
    }

    /// Adopt a saved cursor. Ignored (returns false) unless the snapshot was
    /// taken for the same memory, actor and session.
    pub async fn resume(&self, state: &PersistenceState) -> bool {
        if state.memory_id != self.memory_id.0
            || state.actor_id != self.actor_id.as_str()
            || state.session_id != self.session_id.as_str()
        {
            warn!(
                actor_id = %self.actor_id,
                snapshot_actor = %state.actor_id,
                "Ignoring persistence state for a different binding"
            );
            return false;
        }
        let mut binding = self.binding.lock().await;
        binding.last_persisted = state.last_persisted_index;
        binding.removed_count = state.removed_count;
        true
    }
}

async fn open_handle(
    service: Option<&dyn MemoryService>,
    memory_id: &MemoryId,
    actor_id: &ActorId,
    session_id: &SessionId,
    timeout: Duration,
) -> Option<Arc<dyn MemorySession>> {
    let service = service?;
    if !memory_id.is_configured() {
        info!(memory_id = %memory_id, "No memory id configured, persistence disabled");
        return None;
    }
    match tokio::time::timeout(timeout, service.create_session(actor_id, session_id)).await {
        Ok(Ok(handle)) => {
            debug!(
                backend = service.name(),
                actor_id = %actor_id,
                session_id = %session_id,
                "Memory session created"
            );
            Some(handle)
        }
        Ok(Err(e)) => {
            warn!(actor_id = %actor_id, error = %e, "Failed to create memory session");
            None
        }
        Err(_) => {
            warn!(
                actor_id = %actor_id,
                timeout_ms = timeout.as_millis() as u64,
                "Timed out creating memory session"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducer::SlidingWindowReducer;
    use adcp_core::memory::StoredMessage;
    use adcp_memory::{InMemoryMemoryService, MemoryFault};

    fn conversation(n: usize) -> Vec<ConversationTurn> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    ConversationTurn::user(format!("question {i}"))
                } else {
                    ConversationTurn::assistant(format!("answer {i}"))
                }
            })
            .collect()
    }

    fn fast() -> PersistenceOptions {
        PersistenceOptions {
            timeout: Duration::from_millis(100),
            ..PersistenceOptions::default()
        }
    }

    async fn manager_for(
        service: &InMemoryMemoryService,
        memory_id: &str,
    ) -> ConversationPersistenceManager {
        ConversationPersistenceManager::new(
            Some(Arc::new(service.clone())),
            MemoryId::from(memory_id),
            ActorId::from_agent("Planner"),
            SessionId::from("s1"),
            fast(),
            Arc::new(SlidingWindowReducer::new(4)),
        )
        .await
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 10), "short");
    }

    #[tokio::test]
    async fn unconfigured_memory_is_unbound() {
        let service = InMemoryMemoryService::new();
        let placeholder = manager_for(&service, "default-memory").await;
        assert_eq!(placeholder.binding_state().await, BindingState::Unbound);
        assert!(placeholder.restore().await.unwrap().is_none());
        assert_eq!(placeholder.apply_management(&conversation(4)).await, 0);

        let no_service = ConversationPersistenceManager::new(
            None,
            MemoryId::from("mem-1"),
            ActorId::from_agent("Planner"),
            SessionId::from("s1"),
            fast(),
            Arc::new(SlidingWindowReducer::default()),
        )
        .await;
        assert_eq!(no_service.binding_state().await, BindingState::Unbound);
        assert_eq!(service.sessions_created(), 0);
    }

    #[tokio::test]
    async fn failed_session_creation_is_unbound() {
        let service = InMemoryMemoryService::new();
        service.set_create_fault(Some(MemoryFault::Unavailable)).await;
        let manager = manager_for(&service, "mem-1").await;
        assert_eq!(manager.binding_state().await, BindingState::Unbound);
    }

    #[tokio::test]
    async fn restore_sets_cursor_and_reapply_is_a_noop() {
        let service = InMemoryMemoryService::new();
        let messages = conversation(6)
            .iter()
            .map(|t| StoredMessage::text(t.role(), t.text()))
            .collect();
        service
            .seed(&ActorId::from_agent("Planner"), &SessionId::from("s1"), messages)
            .await;

        let manager = manager_for(&service, "mem-1").await;
        let restored = manager.restore().await.unwrap().unwrap();
        assert_eq!(restored, conversation(6));
        assert_eq!(manager.cursor().await, Some(5));

        assert_eq!(manager.apply_management(&restored).await, 0);
        assert_eq!(service.writes(), 0);
    }

    #[tokio::test]
    async fn restore_never_moves_the_cursor_backwards() {
        let service = InMemoryMemoryService::new();
        let manager = ConversationPersistenceManager::new(
            Some(Arc::new(service.clone())),
            MemoryId::from("mem-1"),
            ActorId::from_agent("Planner"),
            SessionId::from("s1"),
            PersistenceOptions {
                max_turns_to_retrieve: 1,
                ..fast()
            },
            Arc::new(SlidingWindowReducer::default()),
        )
        .await;

        let live = conversation(6);
        assert_eq!(manager.apply_management(&live).await, 6);
        let restored = manager.restore().await.unwrap().unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(manager.cursor().await, Some(5));

        assert_eq!(manager.apply_management(&live).await, 0);
        assert_eq!(service.writes(), 1);
    }

    #[tokio::test]
    async fn restore_filters_tool_plumbing() {
        let service = InMemoryMemoryService::new();
        service
            .seed(
                &ActorId::from_agent("Planner"),
                &SessionId::from("s1"),
                vec![
                    StoredMessage::text(Role::User, "Forecast sports inventory"),
                    StoredMessage::text(Role::Assistant, "{\"toolUse\": {\"name\": \"forecast\"}}"),
                    StoredMessage::text(Role::Assistant, "ok"),
                    StoredMessage::text(Role::Assistant, "Forecast ready"),
                ],
            )
            .await;

        let manager = manager_for(&service, "mem-1").await;
        let restored = manager.restore().await.unwrap().unwrap();
        assert_eq!(
            restored,
            vec![
                ConversationTurn::user("Forecast sports inventory"),
                ConversationTurn::assistant("Forecast ready"),
            ]
        );
        assert_eq!(manager.cursor().await, Some(1));
    }

    #[tokio::test]
    async fn empty_history_is_distinct_from_failure() {
        let service = InMemoryMemoryService::new();
        let manager = manager_for(&service, "mem-1").await;
        assert_eq!(manager.restore().await.unwrap(), Some(vec![]));
        assert_eq!(manager.cursor().await, None);

        service.set_read_fault(Some(MemoryFault::Unavailable)).await;
        assert!(matches!(
            manager.restore().await,
            Err(MemoryError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn hung_restore_times_out() {
        let service = InMemoryMemoryService::new();
        let manager = manager_for(&service, "mem-1").await;
        service.set_read_fault(Some(MemoryFault::Hang)).await;
        assert!(matches!(
            manager.restore().await,
            Err(MemoryError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn apply_writes_only_the_delta() {
        let service = InMemoryMemoryService::new();
        let manager = manager_for(&service, "mem-1").await;
        let actor = ActorId::from_agent("Planner");
        let session = SessionId::from("s1");

        let mut live = conversation(2);
        assert_eq!(manager.apply_management(&live).await, 2);
        assert_eq!(manager.apply_management(&live).await, 0);

        live.extend(conversation(4).split_off(2));
        assert_eq!(manager.apply_management(&live).await, 2);
        assert_eq!(manager.cursor().await, Some(3));
        assert_eq!(service.writes(), 2);

        let stored: Vec<String> = service
            .messages(&actor, &session)
            .await
            .iter()
            .map(StoredMessage::extract_text)
            .collect();
        assert_eq!(stored, vec!["question 0", "answer 1", "question 2", "answer 3"]);
    }

    #[tokio::test]
    async fn marking_persisted_skips_seeded_turns() {
        let service = InMemoryMemoryService::new();
        let manager = manager_for(&service, "mem-1").await;
        manager.mark_persisted(4).await;
        manager.mark_persisted(2).await;
        assert_eq!(manager.cursor().await, Some(3));
        assert_eq!(manager.apply_management(&conversation(5)).await, 1);
    }

    #[tokio::test]
    async fn long_messages_are_truncated() {
        let service = InMemoryMemoryService::new();
        let manager = manager_for(&service, "mem-1").await;
        manager
            .apply_management(&[ConversationTurn::assistant("z".repeat(12_000))])
            .await;
        let stored = service
            .messages(&ActorId::from_agent("Planner"), &SessionId::from("s1"))
            .await;
        assert_eq!(stored[0].extract_text().len(), 9000);
    }

    #[tokio::test]
    async fn write_failure_is_swallowed_and_retried_later() {
        let events = Arc::new(EventBus::default());
        let mut rx = events.subscribe();
        let service = InMemoryMemoryService::new();
        let manager = manager_for(&service, "mem-1").await.with_events(events);

        service.set_write_fault(Some(MemoryFault::Unavailable)).await;
        assert_eq!(manager.apply_management(&conversation(2)).await, 0);
        assert_eq!(manager.cursor().await, None);
        assert!(matches!(
            rx.recv().await.unwrap().as_ref(),
            DomainEvent::PersistenceFailed { .. }
        ));

        service.set_write_fault(None).await;
        assert_eq!(manager.apply_management(&conversation(2)).await, 2);
    }

    #[tokio::test]
    async fn auto_persist_off_never_writes() {
        let service = InMemoryMemoryService::new();
        let manager = ConversationPersistenceManager::new(
            Some(Arc::new(service.clone())),
            MemoryId::from("mem-1"),
            ActorId::from_agent("Planner"),
            SessionId::from("s1"),
            PersistenceOptions {
                auto_persist: false,
                ..fast()
            },
            Arc::new(SlidingWindowReducer::default()),
        )
        .await;
        assert_eq!(manager.apply_management(&conversation(4)).await, 0);
        assert_eq!(service.writes(), 0);
    }

    #[tokio::test]
    async fn reduce_flushes_then_resyncs_cursor() {
        let service = InMemoryMemoryService::new();
        let manager = manager_for(&service, "mem-1").await;

        let mut live = conversation(10);
        let reduction = manager
            .reduce_context(&mut live, ReduceTrigger::ContextOverflow)
            .await;

        assert_eq!(reduction.removed, 6);
        assert_eq!(live.len(), 4);
        assert_eq!(manager.cursor().await, Some(3));
        assert_eq!(service.writes(), 1);
        assert_eq!(manager.apply_management(&live).await, 0);
        assert_eq!(manager.state().await.removed_count, 6);
    }

    #[tokio::test]
    async fn unbound_manager_still_reduces() {
        let service = InMemoryMemoryService::new();
        let manager = manager_for(&service, "").await;
        let mut live = conversation(10);
        manager
            .reduce_context(&mut live, ReduceTrigger::ContextOverflow)
            .await;
        assert_eq!(live.len(), 4);
        assert_eq!(service.writes(), 0);
    }

    #[tokio::test]
    async fn rebinding_recreates_the_handle() {
        let service = InMemoryMemoryService::new();
        let mut manager = manager_for(&service, "mem-1").await;
        manager.apply_management(&conversation(2)).await;

        manager
            .update_session_info(ActorId::from_agent("Planner"), SessionId::from("s1"))
            .await;
        assert_eq!(service.sessions_created(), 1);

        manager
            .update_session_info(ActorId::from_agent("Forecaster"), SessionId::from("s1"))
            .await;
        assert_eq!(service.sessions_created(), 2);
        assert_eq!(manager.cursor().await, None);

        manager.apply_management(&conversation(2)).await;
        let forecaster = service
            .messages(&ActorId::from_agent("Forecaster"), &SessionId::from("s1"))
            .await;
        assert_eq!(forecaster.len(), 2);
    }

    #[tokio::test]
    async fn failed_rebind_leaves_manager_unbound() {
        let service = InMemoryMemoryService::new();
        let mut manager = manager_for(&service, "mem-1").await;
        service.set_create_fault(Some(MemoryFault::Unavailable)).await;
        manager
            .update_session_info(ActorId::from_agent("Planner"), SessionId::from("s2"))
            .await;
        assert_eq!(manager.binding_state().await, BindingState::Unbound);
        assert_eq!(manager.session_id().as_str(), "s2");
    }

    #[tokio::test]
    async fn state_roundtrips_for_matching_binding_only() {
        let service = InMemoryMemoryService::new();
        let manager = manager_for(&service, "mem-1").await;
        manager.apply_management(&conversation(3)).await;

        let state = manager.state().await;
        assert_eq!(state.last_persisted_index, Some(2));
        let json = serde_json::to_string(&state).unwrap();
        let parsed: PersistenceState = serde_json::from_str(&json).unwrap();

        let fresh = manager_for(&service, "mem-1").await;
        assert!(fresh.resume(&parsed).await);
        assert_eq!(fresh.cursor().await, Some(2));

        let other = manager_for(&service, "mem-2").await;
        assert!(!other.resume(&parsed).await);
        assert_eq!(other.cursor().await, None);
    }
}
