//! Coordinated cache refresh.
//!
//! Clears the cache, then reloads global configuration and every agent's
//! instructions with strict reads. Per-item failures are collected into the
//! report; only a failed global configuration load fails the refresh.
//!
//! Refreshes are serialized with each other by a mutex. Against ordinary
//! reads they are serialized by the cache generation: reads that started
//! before the clear cannot write their results after it.

use adcp_core::config::{ConfigKey, ConfigType, ConsistencyMode};
use adcp_core::error::StoreError;
use adcp_core::event::DomainEvent;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::loader::{ConfigLoader, agent_ids_of};
use crate::tier::FillOutcome;

/// Per-category reload counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshCounts {
    pub global_config: usize,
    pub agents_found: usize,
    pub instructions: usize,
    /// Listed agents whose instructions exist nowhere
    pub instructions_missing: usize,
    /// Instructions for discovered agents the global config does not list
    pub instructions_from_fallback: usize,
    /// Reloaded, but dropped because the cache was invalidated meanwhile
    pub superseded: usize,
    pub cards: usize,
    pub viz_maps: usize,
    pub viz_templates: usize,
}

/// One item that failed to reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshItemError {
    pub category: String,
    pub item: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshReport {
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    /// False only when global configuration could not be loaded
    pub success: bool,
    pub force_reinitialize: bool,
    pub caches_cleared: usize,
    /// Cache generation after the clear
    pub generation: u64,
    pub counts: RefreshCounts,
    pub errors: Vec<RefreshItemError>,
}

impl RefreshReport {
    /// Items of `category` that failed.
    pub fn failed(&self, category: &str) -> Vec<&str> {
        self.errors
            .iter()
            .filter(|e| e.category == category)
            .map(|e| e.item.as_str())
            .collect()
    }

    fn record(&mut self, category: &str, item: &str, error: impl ToString) {
        self.errors.push(RefreshItemError {
            category: category.to_string(),
            item: item.to_string(),
            error: error.to_string(),
        });
    }
}

enum Reloaded {
    Cached,
    Missing,
    /// The cache was invalidated while the read was in flight
    Superseded,
}

pub struct RefreshOrchestrator {
    loader: Arc<ConfigLoader>,
    lock: Mutex<()>,
    concurrency: usize,
}

impl RefreshOrchestrator {
    pub fn new(loader: Arc<ConfigLoader>, concurrency: usize) -> Self {
        Self {
            loader,
            lock: Mutex::new(()),
            concurrency: concurrency.max(1),
        }
    }

    /// Clear and reload. Never returns an error: failures are in the report.
    ///
    /// With `force_reinit` the loader is left uninitialised so the next
    /// preload runs again; otherwise it is marked initialised.
    pub async fn refresh_all(&self, force_reinit: bool) -> RefreshReport {
        let _guard = self.lock.lock().await;
        let started = Instant::now();
        let strict = ConsistencyMode::Strict;

        info!(force_reinit, "Cache refresh starting");
        let caches_cleared = self.loader.clear().await;
        let mut report = RefreshReport {
            started_at: Utc::now(),
            elapsed_ms: 0,
            success: true,
            force_reinitialize: force_reinit,
            caches_cleared,
            generation: self.loader.cache().generation(),
            counts: RefreshCounts::default(),
            errors: Vec::new(),
        };

        // Global configuration decides which agents exist
        let agent_ids = match self.loader.global_config(strict).await {
            Ok(Some(global)) => {
                report.counts.global_config = 1;
                agent_ids_of(&global)
            }
            Ok(None) => {
                warn!("Global configuration not found, refreshing with zero agents");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "Cache refresh failed: global configuration unavailable");
                report.success = false;
                report.record("global_config", "global", &e);
                return self.finish(report, started, force_reinit);
            }
        };
        report.counts.agents_found = agent_ids.len();
        info!(agents = agent_ids.len(), "Reloading agent instructions");

        let results = self.reload_instructions(&agent_ids).await;
        for (agent, result) in results {
            match result {
                Ok(Reloaded::Cached) => report.counts.instructions += 1,
                Ok(Reloaded::Missing) => report.counts.instructions_missing += 1,
                Ok(Reloaded::Superseded) => report.counts.superseded += 1,
                Err(e) => {
                    warn!(agent = %agent, error = %e, "Failed to reload instructions");
                    report.record("instructions", &agent, e);
                }
            }
        }

        // Agents that only exist in the object store or local library
        let listed: BTreeSet<&String> = agent_ids.iter().collect();
        let extra: Vec<String> = self
            .loader
            .discover_agents()
            .await
            .into_iter()
            .filter(|a| !listed.contains(a))
            .collect();
        if !extra.is_empty() {
            info!(agents = extra.len(), "Reloading instructions for discovered agents");
            for (agent, result) in self.reload_instructions(&extra).await {
                match result {
                    Ok(Reloaded::Cached) => report.counts.instructions_from_fallback += 1,
                    Ok(Reloaded::Missing) => {}
                    Ok(Reloaded::Superseded) => report.counts.superseded += 1,
                    Err(e) => {
                        warn!(agent = %agent, error = %e, "Failed to reload discovered agent");
                        report.record("instructions", &agent, e);
                    }
                }
            }
        }

        match self.loader.get_all_of_type(ConfigType::Card, strict).await {
            Ok(cards) => report.counts.cards = cards.len(),
            Err(e) => {
                warn!(error = %e, "Failed to reload agent cards");
                report.record("cards", "all", e);
            }
        }

        for agent in &agent_ids {
            match self.loader.visualization_map(agent, strict).await {
                Ok(Some(_)) => report.counts.viz_maps += 1,
                Ok(None) => continue,
                Err(e) => {
                    warn!(agent = %agent, error = %e, "Failed to reload visualization map");
                    report.record("visualization", agent, e);
                    continue;
                }
            }
            match self.loader.visualization_templates(agent, strict).await {
                Ok(templates) => report.counts.viz_templates += templates.len(),
                Err(e) => {
                    warn!(agent = %agent, error = %e, "Failed to reload visualization templates");
                    report.record("visualization", agent, e);
                }
            }
        }

        self.finish(report, started, force_reinit)
    }

    async fn reload_instructions(
        &self,
        agents: &[String],
    ) -> Vec<(String, Result<Reloaded, StoreError>)> {
        futures::stream::iter(agents.iter().cloned())
            .map(|agent| {
                let loader = self.loader.clone();
                async move {
                    let result = loader
                        .reload(&ConfigKey::instruction(&agent))
                        .await
                        .map(|(entry, outcome)| match (outcome, entry) {
                            (FillOutcome::Stale, _) => Reloaded::Superseded,
                            (_, Some(_)) => Reloaded::Cached,
                            (_, None) => Reloaded::Missing,
                        });
                    (agent, result)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }

    fn finish(&self, mut report: RefreshReport, started: Instant, force_reinit: bool) -> RefreshReport {
        self.loader.set_initialized(report.success && !force_reinit);
        report.elapsed_ms = started.elapsed().as_millis() as u64;

        if report.success {
            info!(
                elapsed_ms = report.elapsed_ms,
                instructions = report.counts.instructions,
                cards = report.counts.cards,
                errors = report.errors.len(),
                "Cache refresh complete"
            );
        }

        self.loader.events().publish(DomainEvent::CacheRefreshed {
            success: report.success,
            instructions_reloaded: report.counts.instructions
                + report.counts.instructions_from_fallback,
            errors: report.errors.len(),
            elapsed_ms: report.elapsed_ms,
            timestamp: Utc::now(),
        });
        report
    }
}
