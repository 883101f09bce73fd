//! The service object shared by every request handler.

use adcp_cache::{ConfigCacheTier, ConfigLoader, PreloadReport, RefreshOrchestrator, RefreshReport};
use adcp_config::{AppConfig, MemoryConfig, StoresConfig};
use adcp_conversation::{
    ContextReducer, ConversationPersistenceManager, PersistenceOptions, SessionBounds,
    SessionContextStore, SlidingWindowReducer, SummarizingReducer,
};
use adcp_core::config::ConsistencyMode;
use adcp_core::event::EventBus;
use adcp_core::memory::MemoryService;
use adcp_core::message::{ActorId, MemoryId, SessionId};
use adcp_memory::{InMemoryMemoryService, SqliteMemoryService};
use adcp_stores::{
    BackingStoreChain, DirectoryObjectStore, InMemoryKvStore, InMemoryObjectStore, LocalLibrary,
    SqliteKvStore,
};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::RuntimeError;

fn sqlite_url(path: &str) -> String {
    if path.starts_with("sqlite:") {
        path.to_string()
    } else {
        format!("sqlite://{path}")
    }
}

/// Caches, stores and session state, built once at process start.
pub struct ServiceContext {
    pub config: AppConfig,
    pub events: Arc<EventBus>,
    pub loader: Arc<ConfigLoader>,
    pub refresher: Arc<RefreshOrchestrator>,
    pub sessions: Arc<SessionContextStore>,
    pub memory: Option<Arc<dyn MemoryService>>,
}

impl ServiceContext {
    /// Open every configured backend and wire the services together.
    pub async fn build(config: AppConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        let chain = build_chain(&config.stores).await?;
        let memory = build_memory(&config.memory).await?;
        Ok(Self::from_parts(config, chain, memory))
    }

    /// Wire already-constructed backends.
    pub fn from_parts(
        config: AppConfig,
        chain: BackingStoreChain,
        memory: Option<Arc<dyn MemoryService>>,
    ) -> Self {
        let events = Arc::new(EventBus::default());
        let cache = ConfigCacheTier::new(config.cache.negative_ttl());
        let loader = Arc::new(ConfigLoader::new(Arc::new(chain), cache, events.clone()));
        let refresher = Arc::new(RefreshOrchestrator::new(
            loader.clone(),
            config.cache.refresh_concurrency,
        ));
        let bounds = SessionBounds {
            max_live_turns: config.sessions.max_live_turns,
            max_switch_turns: config.sessions.max_switch_turns,
            max_sessions: config.sessions.max_sessions,
        };
        let sessions = Arc::new(SessionContextStore::new(bounds).with_events(events.clone()));

        info!(
            tiers = ?loader.chain().tiers(),
            memory = memory.as_ref().map(|m| m.name()).unwrap_or("none"),
            "Service context ready"
        );
        Self {
            config,
            events,
            loader,
            refresher,
            sessions,
            memory,
        }
    }

    pub fn persistence_options(&self) -> PersistenceOptions {
        let memory = &self.config.memory;
        PersistenceOptions {
            max_turns_to_retrieve: memory.max_turns_to_retrieve,
            max_message_chars: memory.max_message_chars,
            timeout: memory.timeout(),
            auto_persist: memory.auto_persist,
        }
    }

    /// Summarizing reducer when summaries are enabled, sliding window
    /// otherwise.
    pub fn reducer(&self) -> Arc<dyn ContextReducer> {
        let memory = &self.config.memory;
        if memory.preserve_recent > 0 {
            Arc::new(SummarizingReducer::new(
                memory.summary_ratio,
                memory.preserve_recent,
            ))
        } else {
            Arc::new(SlidingWindowReducer::new(memory.window_size))
        }
    }

    /// A persistence manager bound to `(agent, session)`.
    pub async fn persistence_for(
        &self,
        agent: &str,
        session: &SessionId,
    ) -> ConversationPersistenceManager {
        ConversationPersistenceManager::new(
            self.memory.clone(),
            MemoryId::from(self.config.memory.memory_id.as_str()),
            ActorId::from_agent(agent),
            session.clone(),
            self.persistence_options(),
            self.reducer(),
        )
        .await
        .with_events(self.events.clone())
    }

    /// Load every agent named in the global configuration into the cache.
    /// `None` when the cache was already warm.
    pub async fn warm_up(&self) -> Result<Option<PreloadReport>, RuntimeError> {
        let agent_ids = self.loader.agent_ids(ConsistencyMode::Relaxed).await?;
        Ok(self.loader.preload(&agent_ids).await)
    }

    pub async fn refresh(&self, force_reinit: bool) -> RefreshReport {
        self.refresher.refresh_all(force_reinit).await
    }
}

async fn build_chain(stores: &StoresConfig) -> Result<BackingStoreChain, RuntimeError> {
    let timeout = stores.timeout();
    let mut chain = BackingStoreChain::new();

    chain = match stores.kv_backend.as_str() {
        "sqlite" => {
            let store = SqliteKvStore::new(&sqlite_url(&stores.kv_path)).await?;
            chain.with_key_value(Arc::new(store), timeout)
        }
        "memory" => chain.with_key_value(Arc::new(InMemoryKvStore::new()), timeout),
        "none" => chain,
        other => {
            return Err(RuntimeError::UnknownBackend {
                kind: "key/value",
                name: other.to_string(),
            });
        }
    };

    chain = match (stores.object_backend.as_str(), stores.bucket.as_deref()) {
        ("none", _) => chain,
        (_, None) => {
            warn!(backend = %stores.object_backend, "No bucket configured, object store disabled");
            chain
        }
        ("directory", Some(bucket)) => {
            let Some(root) = stores.object_root.as_deref() else {
                warn!("No object_root configured, object store disabled");
                return Ok(with_library(chain, stores));
            };
            chain.with_object_store(
                Arc::new(DirectoryObjectStore::new(root)),
                bucket,
                &stores.object_prefix,
                timeout,
            )
        }
        ("memory", Some(bucket)) => chain.with_object_store(
            Arc::new(InMemoryObjectStore::new()),
            bucket,
            &stores.object_prefix,
            timeout,
        ),
        (other, Some(_)) => {
            return Err(RuntimeError::UnknownBackend {
                kind: "object",
                name: other.to_string(),
            });
        }
    };

    Ok(with_library(chain, stores))
}

fn with_library(chain: BackingStoreChain, stores: &StoresConfig) -> BackingStoreChain {
    match stores.local_library_dir.as_deref() {
        Some(dir) => chain.with_library(LocalLibrary::new(dir), stores.timeout()),
        None => chain,
    }
}

async fn build_memory(
    memory: &MemoryConfig,
) -> Result<Option<Arc<dyn MemoryService>>, RuntimeError> {
    let memory_id = MemoryId::from(memory.memory_id.as_str());
    match memory.backend.as_str() {
        "none" => Ok(None),
        _ if !memory_id.is_configured() => {
            info!(memory_id = %memory_id, "Durable memory not configured");
            Ok(None)
        }
        "sqlite" => {
            let service = SqliteMemoryService::new(&sqlite_url(&memory.path), memory_id).await?;
            Ok(Some(Arc::new(service)))
        }
        "memory" => Ok(Some(Arc::new(InMemoryMemoryService::new()))),
        other => Err(RuntimeError::UnknownBackend {
            kind: "memory",
            name: other.to_string(),
        }),
    }
}
