//! One conversation, driven through agent switches.
//!
//! Switching agents saves the outgoing agent's history into the session
//! context store, flushes it to durable memory, and seeds the incoming
//! agent from whatever it left behind earlier in the session. An agent with
//! nothing saved in-process is seeded from durable memory instead.

use adcp_conversation::{ConversationPersistenceManager, ReduceTrigger, Reduction, history_context};
use adcp_core::config::ConsistencyMode;
use adcp_core::message::{ActorId, ConversationTurn, SessionId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::context::ServiceContext;
use crate::error::RuntimeError;

/// Where an activated agent's starting history came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum HistorySource {
    /// The agent was already active
    Current,
    /// Saved on an earlier switch in this process
    SessionContext,
    /// Restored from durable memory
    DurableMemory,
    /// Nothing to restore
    Fresh,
    /// Durable memory could not be read; started fresh
    Degraded { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activation {
    pub agent: String,
    pub source: HistorySource,
    pub restored_turns: usize,
}

struct ActiveAgent {
    name: String,
    actor_id: ActorId,
    turns: Vec<ConversationTurn>,
    system_prompt: String,
    persistence: ConversationPersistenceManager,
}

pub struct OrchestratorSession {
    context: Arc<ServiceContext>,
    session_id: SessionId,
    active: Option<ActiveAgent>,
}

impl OrchestratorSession {
    /// A session for `session`, or the default session when none is given.
    pub fn new(context: Arc<ServiceContext>, session: Option<&str>) -> Self {
        Self {
            context,
            session_id: SessionId::or_default(session),
            active: None,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn active_agent(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.name.as_str())
    }

    /// The active agent's live history.
    pub fn turns(&self) -> &[ConversationTurn] {
        self.active.as_ref().map(|a| a.turns.as_slice()).unwrap_or_default()
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.system_prompt.as_str())
    }

    pub fn persistence(&self) -> Option<&ConversationPersistenceManager> {
        self.active.as_ref().map(|a| &a.persistence)
    }

    /// Make `agent` the active agent, switching away from the current one if
    /// it differs.
    pub async fn activate(&mut self, agent: &str) -> Result<Activation, RuntimeError> {
        if let Some(active) = &self.active
            && active.name == agent
        {
            return Ok(Activation {
                agent: agent.to_string(),
                source: HistorySource::Current,
                restored_turns: active.turns.len(),
            });
        }

        // Build the prompt first so an unknown agent leaves the current one
        // in place
        let mut system_prompt = self.build_prompt(agent).await?;

        if let Some(outgoing) = self.active.take() {
            self.switch_out(outgoing).await;
        }

        let actor_id = ActorId::from_agent(agent);
        let persistence = self
            .context
            .persistence_for(agent, &self.session_id)
            .await;

        let saved = self
            .context
            .sessions
            .restore_context_on_switch(&self.session_id, &actor_id)
            .await;

        let (turns, source) = if !saved.turns.is_empty() {
            // Only the prefix the outgoing binding managed to flush
            persistence.mark_persisted(saved.durable).await;
            (saved.turns, HistorySource::SessionContext)
        } else {
            match persistence.restore().await {
                Ok(Some(restored)) if !restored.is_empty() => {
                    if let Some(section) = history_context(&restored) {
                        system_prompt.push_str(&section);
                    }
                    (restored, HistorySource::DurableMemory)
                }
                Ok(_) => (Vec::new(), HistorySource::Fresh),
                Err(e) => {
                    warn!(
                        agent = %agent,
                        session_id = %self.session_id,
                        error = %e,
                        "Starting without history"
                    );
                    (
                        Vec::new(),
                        HistorySource::Degraded {
                            reason: e.to_string(),
                        },
                    )
                }
            }
        };

        let activation = Activation {
            agent: agent.to_string(),
            source,
            restored_turns: turns.len(),
        };
        info!(
            agent = %agent,
            session_id = %self.session_id,
            source = ?activation.source,
            turns = activation.restored_turns,
            "Agent activated"
        );

        self.active = Some(ActiveAgent {
            name: agent.to_string(),
            actor_id,
            turns,
            system_prompt,
            persistence,
        });
        Ok(activation)
    }

    async fn build_prompt(&self, agent: &str) -> Result<String, RuntimeError> {
        let loader = &self.context.loader;
        let relaxed = ConsistencyMode::Relaxed;
        let mut prompt = loader
            .instructions(agent, relaxed)
            .await?
            .ok_or_else(|| RuntimeError::MissingInstructions(agent.to_string()))?;

        if loader.visualization_map(agent, relaxed).await?.is_some() {
            prompt.push_str("\n\n");
            prompt.push_str(&loader.visualization_prompt(agent, relaxed).await?);
        }
        Ok(prompt)
    }

    async fn switch_out(&self, outgoing: ActiveAgent) {
        outgoing.persistence.apply_management(&outgoing.turns).await;
        let durable = outgoing
            .persistence
            .cursor()
            .await
            .map_or(0, |index| index + 1);
        self.context
            .sessions
            .save_context_on_switch(
                &self.session_id,
                &outgoing.actor_id,
                &outgoing.turns,
                durable,
            )
            .await;
        info!(
            from = %outgoing.name,
            session_id = %self.session_id,
            pending = outgoing.turns.len().saturating_sub(durable),
            "Switched away from agent"
        );
    }

    /// Append one user/assistant exchange to the active agent, persist the
    /// new messages and checkpoint the history. Returns the messages written
    /// to durable memory.
    pub async fn record_exchange(&mut self, user: &str, assistant: &str) -> usize {
        let Some(active) = self.active.as_mut() else {
            warn!(session_id = %self.session_id, "No active agent, exchange dropped");
            return 0;
        };
        active.turns.push(ConversationTurn::user(user));
        active.turns.push(ConversationTurn::assistant(assistant));

        let written = active.persistence.apply_management(&active.turns).await;
        self.context
            .sessions
            .save_live(&self.session_id, &active.actor_id, &active.turns)
            .await;
        written
    }

    /// Shrink the active agent's history after the model rejected it for
    /// size.
    pub async fn handle_overflow(&mut self) -> Reduction {
        let Some(active) = self.active.as_mut() else {
            return Reduction::default();
        };
        active
            .persistence
            .reduce_context(&mut active.turns, ReduceTrigger::ContextOverflow)
            .await
    }

    /// Flush pending messages and drop this session's in-process context.
    pub async fn close(mut self) {
        if let Some(active) = self.active.take() {
            active.persistence.apply_management(&active.turns).await;
        }
        self.context.sessions.clear_session(&self.session_id).await;
        info!(session_id = %self.session_id, "Session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adcp_config::AppConfig;
    use adcp_core::config::ConfigKey;

    async fn context() -> Arc<ServiceContext> {
        let mut config = AppConfig::default();
        config.stores.kv_backend = "memory".into();
        config.memory.backend = "memory".into();
        config.memory.memory_id = "mem-test".into();
        let context = ServiceContext::build(config).await.unwrap();
        for agent in ["Planner", "Forecaster"] {
            context
                .loader
                .put(&ConfigKey::instruction(agent), &format!("You are {agent}."))
                .await
                .unwrap();
        }
        Arc::new(context)
    }

    #[tokio::test]
    async fn session_defaults_when_missing() {
        let session = OrchestratorSession::new(context().await, None);
        assert_eq!(session.session_id().as_str(), "default_session");
        assert!(session.turns().is_empty());
    }

    #[tokio::test]
    async fn activation_loads_instructions() {
        let mut session = OrchestratorSession::new(context().await, Some("s1"));
        let activation = session.activate("Planner").await.unwrap();
        assert_eq!(activation.source, HistorySource::Fresh);
        assert_eq!(session.system_prompt(), Some("You are Planner."));

        let again = session.activate("Planner").await.unwrap();
        assert_eq!(again.source, HistorySource::Current);
    }

    #[tokio::test]
    async fn unknown_agent_keeps_current_one() {
        let mut session = OrchestratorSession::new(context().await, Some("s1"));
        session.activate("Planner").await.unwrap();
        session.record_exchange("hello there", "hi, how can I help").await;

        let err = session.activate("Nobody").await.unwrap_err();
        assert!(matches!(err, RuntimeError::MissingInstructions(_)));
        assert_eq!(session.active_agent(), Some("Planner"));
        assert_eq!(session.turns().len(), 2);
    }

    #[tokio::test]
    async fn visualization_prompt_is_appended() {
        let context = context().await;
        context
            .loader
            .put(
                &ConfigKey::visualization_map("Planner"),
                r#"{"templates":[{"templateId":"kpis","usage":"Show KPIs"}]}"#,
            )
            .await
            .unwrap();
        let mut session = OrchestratorSession::new(context, Some("s1"));
        session.activate("Planner").await.unwrap();
        let prompt = session.system_prompt().unwrap();
        assert!(prompt.starts_with("You are Planner.\n\n"));
        assert!(prompt.contains("- **kpis**: Show KPIs"));
    }

    #[tokio::test]
    async fn exchanges_are_persisted_once() {
        let mut session = OrchestratorSession::new(context().await, Some("s1"));
        session.activate("Planner").await.unwrap();
        assert_eq!(session.record_exchange("first question", "first answer").await, 2);
        assert_eq!(session.record_exchange("second question", "second answer").await, 2);
        assert_eq!(session.persistence().unwrap().cursor().await, Some(3));
    }

    #[tokio::test]
    async fn close_clears_session_context() {
        let context = context().await;
        let mut session = OrchestratorSession::new(context.clone(), Some("s1"));
        session.activate("Planner").await.unwrap();
        session.record_exchange("question one", "answer one").await;
        assert_eq!(context.sessions.len().await, 1);

        session.close().await;
        assert!(context.sessions.is_empty().await);
    }
}
