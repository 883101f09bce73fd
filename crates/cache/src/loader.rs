//! ConfigLoader: the cache tier in front of the backing-store chain.
//!
//! Relaxed reads are served from the cache when it has an answer (positive
//! or negative) and go to the chain otherwise. Strict reads always go to the
//! chain with the strongest read the primary store offers, then overwrite
//! whatever the cache held.

use adcp_core::config::{ConfigEntry, ConfigKey, ConfigType, ConsistencyMode, SourceTier};
use adcp_core::error::StoreError;
use adcp_core::event::{DomainEvent, EventBus};
use adcp_stores::BackingStoreChain;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::tier::{CacheStats, ConfigCacheTier, FillOutcome, FillPolicy};

/// Cache key of the aggregate holding every item of one type.
pub(crate) fn all_of_type_key(config_type: ConfigType) -> String {
    format!("all:{config_type}")
}

/// Counts from a preload pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreloadReport {
    pub global_config: usize,
    pub cards: usize,
    pub instructions: usize,
    pub viz_maps: usize,
    pub viz_templates: usize,
    pub errors: usize,
    pub elapsed_ms: u64,
}

pub struct ConfigLoader {
    chain: Arc<BackingStoreChain>,
    cache: ConfigCacheTier,
    events: Arc<EventBus>,
    initialized: AtomicBool,
}

impl ConfigLoader {
    pub fn new(chain: Arc<BackingStoreChain>, cache: ConfigCacheTier, events: Arc<EventBus>) -> Self {
        Self {
            chain,
            cache,
            events,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn chain(&self) -> &BackingStoreChain {
        &self.chain
    }

    pub fn cache(&self) -> &ConfigCacheTier {
        &self.cache
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Resolve one resource.
    ///
    /// `Ok(None)` is a normal outcome and is cached negatively. An error
    /// means no tier had the value and at least one could not answer;
    /// nothing is cached in that case.
    pub async fn get(
        &self,
        key: &ConfigKey,
        mode: ConsistencyMode,
    ) -> Result<Option<ConfigEntry>, StoreError> {
        let cache_key = key.cache_key();

        if !mode.is_strict()
            && let Some(cached) = self.cache.lookup(&cache_key).await
        {
            debug!(key = %cache_key, negative = cached.is_none(), "Cache hit");
            return Ok(cached);
        }

        self.load(key, mode).await.map(|(entry, _)| entry)
    }

    /// Strict read of `key` that also reports whether the result made it
    /// into the cache.
    pub async fn reload(
        &self,
        key: &ConfigKey,
    ) -> Result<(Option<ConfigEntry>, FillOutcome), StoreError> {
        self.load(key, ConsistencyMode::Strict).await
    }

    async fn load(
        &self,
        key: &ConfigKey,
        mode: ConsistencyMode,
    ) -> Result<(Option<ConfigEntry>, FillOutcome), StoreError> {
        let cache_key = key.cache_key();
        let generation = self.cache.generation();
        let resolved = self.chain.resolve(key, mode).await?;
        if resolved.is_none() {
            debug!(key = %cache_key, "Not found in any tier, caching negative entry");
        }

        let policy = if mode.is_strict() {
            FillPolicy::Overwrite
        } else {
            FillPolicy::IfAbsent
        };
        let outcome = self
            .fill_detached(cache_key, resolved.clone(), generation, policy)
            .await;
        Ok((resolved, outcome))
    }

    /// The cache write runs on its own task so a cancelled caller cannot
    /// abandon it halfway.
    async fn fill_detached(
        &self,
        cache_key: String,
        entry: Option<ConfigEntry>,
        generation: u64,
        policy: FillPolicy,
    ) -> FillOutcome {
        let cache = self.cache.clone();
        let task = tokio::spawn(async move {
            cache.fill(&cache_key, entry, generation, policy).await
        });
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Cache fill task failed");
                FillOutcome::Stale
            }
        }
    }

    /// Every item of one type from the primary store's type index.
    ///
    /// Bypasses per-key entries and does not populate them; the whole set is
    /// cached as one aggregate.
    pub async fn get_all_of_type(
        &self,
        config_type: ConfigType,
        mode: ConsistencyMode,
    ) -> Result<Vec<ConfigEntry>, StoreError> {
        let cache_key = all_of_type_key(config_type);

        if !mode.is_strict()
            && let Some(cached) = self.cache.lookup_aggregate(&cache_key).await
        {
            debug!(key = %cache_key, count = cached.len(), "Cache hit (aggregate)");
            return Ok(cached.as_ref().clone());
        }

        let generation = self.cache.generation();
        let items = self.chain.query_by_type(config_type).await?;

        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            let key = item.config_key();
            if config_type.is_json()
                && let Err(e) = serde_json::from_str::<serde_json::Value>(&item.content)
            {
                warn!(key = %key, error = %e, "Skipping malformed item in type query");
                continue;
            }
            entries.push(ConfigEntry::new(key, item.content, SourceTier::KeyValue));
        }

        info!(config_type = %config_type, count = entries.len(), "Loaded all of type");
        self.fill_aggregate_detached(cache_key, entries.clone(), generation)
            .await;
        Ok(entries)
    }

    pub(crate) async fn fill_aggregate_detached(
        &self,
        cache_key: String,
        entries: Vec<ConfigEntry>,
        generation: u64,
    ) {
        let cache = self.cache.clone();
        let task = tokio::spawn(async move {
            cache.fill_aggregate(&cache_key, entries, generation).await
        });
        if let Err(e) = task.await {
            warn!(error = %e, "Cache aggregate fill task failed");
        }
    }

    // --- Typed accessors ---

    /// An agent's instruction text, trimmed.
    pub async fn instructions(
        &self,
        agent: &str,
        mode: ConsistencyMode,
    ) -> Result<Option<String>, StoreError> {
        let entry = self.get(&ConfigKey::instruction(agent), mode).await?;
        Ok(entry.map(|e| e.content.trim().to_string()))
    }

    pub async fn card(
        &self,
        agent: &str,
        mode: ConsistencyMode,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        self.get_json(&ConfigKey::card(agent), mode).await
    }

    pub async fn all_cards(&self, mode: ConsistencyMode) -> Result<Vec<serde_json::Value>, StoreError> {
        let entries = self.get_all_of_type(ConfigType::Card, mode).await?;
        Ok(entries
            .iter()
            .filter_map(|e| e.parse::<serde_json::Value>().ok())
            .collect())
    }

    pub async fn global_config(
        &self,
        mode: ConsistencyMode,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        self.get_json(&ConfigKey::global(), mode).await
    }

    /// Agent ids listed under `agent_configs` in the global configuration.
    pub async fn agent_ids(&self, mode: ConsistencyMode) -> Result<Vec<String>, StoreError> {
        let global = self.global_config(mode).await?;
        Ok(global.as_ref().map(agent_ids_of).unwrap_or_default())
    }

    pub(crate) async fn get_json(
        &self,
        key: &ConfigKey,
        mode: ConsistencyMode,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let Some(entry) = self.get(key, mode).await? else {
            return Ok(None);
        };
        entry.parse().map(Some).map_err(|e| StoreError::Malformed {
            tier: entry.source,
            key: key.cache_key(),
            reason: e.to_string(),
        })
    }

    // --- Writes ---

    /// Write through to the primary store, then drop the cached entry and
    /// any aggregate containing it.
    pub async fn put(&self, key: &ConfigKey, content: &str) -> Result<(), StoreError> {
        self.chain.put(key, content).await?;

        let mut keys = vec![key.cache_key(), all_of_type_key(key.config_type)];
        if let Some(agent) = key.agent() {
            keys.push(crate::visualization::all_templates_key(agent));
        }
        let removed = self.cache.invalidate(&keys).await;
        info!(key = %key, "Stored config item");
        self.events.publish(DomainEvent::CacheInvalidated {
            scope: key.cache_key(),
            entries_removed: removed,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Delete every stored resource of an agent and drop its cache entries.
    /// Returns the number of items deleted.
    pub async fn delete_agent(&self, agent: &str) -> Result<usize, StoreError> {
        let mut deleted = 0;
        for key in [
            ConfigKey::instruction(agent),
            ConfigKey::card(agent),
            ConfigKey::visualization_map(agent),
        ] {
            if self.chain.delete(&key).await? {
                deleted += 1;
            }
        }

        let template_partition = ConfigKey::visualization_template(agent, "")
            .partition_key()
            .unwrap_or_default();
        for item in self.chain.query_partition(&template_partition).await? {
            if self.chain.delete(&item.config_key()).await? {
                deleted += 1;
            }
        }

        let removed = self.invalidate_agent(agent).await;
        info!(agent = %agent, deleted, cache_entries_removed = removed, "Deleted agent config");
        Ok(deleted)
    }

    /// Drop every cache entry belonging to `agent`, plus the type aggregates.
    pub async fn invalidate_agent(&self, agent: &str) -> usize {
        let exact: Vec<String> = [
            ConfigKey::instruction(agent),
            ConfigKey::card(agent),
            ConfigKey::visualization_map(agent),
        ]
        .iter()
        .map(ConfigKey::cache_key)
        .chain([crate::visualization::all_templates_key(agent)])
        .collect();
        let template_prefix = ConfigKey::visualization_template(agent, "").cache_key();

        let removed = self
            .cache
            .invalidate_where(|k| {
                k.starts_with("all:")
                    || k.starts_with(&template_prefix)
                    || exact.iter().any(|e| e == k)
            })
            .await;
        self.events.publish(DomainEvent::CacheInvalidated {
            scope: format!("agent:{agent}"),
            entries_removed: removed,
            timestamp: Utc::now(),
        });
        removed
    }

    /// Drop a single key.
    pub async fn invalidate(&self, key: &ConfigKey) -> usize {
        let removed = self.cache.invalidate(&[key.cache_key()]).await;
        self.events.publish(DomainEvent::CacheInvalidated {
            scope: key.cache_key(),
            entries_removed: removed,
            timestamp: Utc::now(),
        });
        removed
    }

    /// Drop everything and mark the loader uninitialised.
    pub async fn clear(&self) -> usize {
        let removed = self.cache.clear().await;
        self.initialized.store(false, Ordering::SeqCst);
        info!(entries_removed = removed, "Cleared config cache");
        removed
    }

    // --- Preload & diagnostics ---

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub(crate) fn set_initialized(&self, value: bool) {
        self.initialized.store(value, Ordering::SeqCst);
    }

    /// Load everything for `agent_ids` with strict reads. Runs once: later
    /// calls return `None` until a clear or forced refresh resets the flag.
    pub async fn preload(&self, agent_ids: &[String]) -> Option<PreloadReport> {
        if self.is_initialized() {
            debug!("Preload already done, skipping");
            return None;
        }

        let started = Instant::now();
        let strict = ConsistencyMode::Strict;
        let mut report = PreloadReport::default();
        info!(agents = agent_ids.len(), "Starting config preload");

        match self.global_config(strict).await {
            Ok(Some(_)) => report.global_config = 1,
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Preload: global config failed");
                report.errors += 1;
            }
        }

        match self.all_cards(strict).await {
            Ok(cards) => report.cards = cards.len(),
            Err(e) => {
                warn!(error = %e, "Preload: cards failed");
                report.errors += 1;
            }
        }

        for agent in agent_ids {
            match self.instructions(agent, strict).await {
                Ok(Some(_)) => report.instructions += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(agent = %agent, error = %e, "Preload: instructions failed");
                    report.errors += 1;
                }
            }
            match self.visualization_map(agent, strict).await {
                Ok(Some(_)) => report.viz_maps += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(agent = %agent, error = %e, "Preload: visualization map failed");
                    report.errors += 1;
                }
            }
            match self.visualization_templates(agent, strict).await {
                Ok(templates) => report.viz_templates += templates.len(),
                Err(e) => {
                    warn!(agent = %agent, error = %e, "Preload: visualization templates failed");
                    report.errors += 1;
                }
            }
        }

        self.set_initialized(true);
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            instructions = report.instructions,
            cards = report.cards,
            viz_maps = report.viz_maps,
            viz_templates = report.viz_templates,
            errors = report.errors,
            elapsed_ms = report.elapsed_ms,
            "Config preload complete"
        );
        Some(report)
    }

    /// Agents found in the object store or local library, whether or not the
    /// global configuration lists them.
    pub async fn discover_agents(&self) -> Vec<String> {
        self.chain.discover_agents().await
    }

    pub async fn stats(&self) -> CacheStats {
        let mut stats = self.cache.stats().await;
        stats.initialized = self.is_initialized();
        stats
    }
}

pub(crate) fn agent_ids_of(global: &serde_json::Value) -> Vec<String> {
    global
        .get("agent_configs")
        .and_then(|v| v.as_object())
        .map(|configs| configs.keys().cloned().collect())
        .unwrap_or_default()
}
