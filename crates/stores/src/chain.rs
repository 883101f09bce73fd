//! Backing store chain: ordered tiers with per-tier timeouts.
//!
//! Each tier is tried in priority order (key/value, object store, local
//! library). The first tier that yields non-empty content wins. A tier that
//! times out is treated exactly like an unavailable one: the chain moves on,
//! and if nothing else answers, the outage is reported instead of "not
//! found" so the caller never caches an absence it did not observe.

use async_trait::async_trait;
use adcp_core::config::{ConfigEntry, ConfigKey, ConfigType, ConsistencyMode, SourceTier};
use adcp_core::error::StoreError;
use adcp_core::store::{KeyValueStore, ObjectStore, StoreItem};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::library::LocalLibrary;

/// One tier of the chain.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    fn tier(&self) -> SourceTier;

    /// Fetch raw content for `key`. `Ok(None)` means this tier has nothing.
    async fn fetch(&self, key: &ConfigKey, mode: ConsistencyMode)
    -> Result<Option<String>, StoreError>;

    /// Agent names this tier knows about without consulting global config.
    async fn list_agents(&self) -> Result<Vec<String>, StoreError> {
        Ok(Vec::new())
    }
}

/// The key/value store as a chain tier.
pub struct KeyValueSource {
    store: Arc<dyn KeyValueStore>,
}

impl KeyValueSource {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ConfigSource for KeyValueSource {
    fn tier(&self) -> SourceTier {
        SourceTier::KeyValue
    }

    async fn fetch(
        &self,
        key: &ConfigKey,
        mode: ConsistencyMode,
    ) -> Result<Option<String>, StoreError> {
        let Some(pk) = key.partition_key() else {
            return Ok(None);
        };
        let item = self
            .store
            .get_item(&pk, &key.sort_key(), mode.is_strict())
            .await?;
        Ok(item.map(|i| i.content))
    }
}

/// An object store bucket as a chain tier. Object keys are
/// `{prefix}/{library path}`.
pub struct ObjectSource {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
}

impl ObjectSource {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: &str, prefix: &str) -> Self {
        Self {
            store,
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn object_key(&self, relative: &str) -> String {
        if self.prefix.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{relative}", self.prefix)
        }
    }
}

#[async_trait]
impl ConfigSource for ObjectSource {
    fn tier(&self) -> SourceTier {
        SourceTier::ObjectStore
    }

    async fn fetch(
        &self,
        key: &ConfigKey,
        _mode: ConsistencyMode,
    ) -> Result<Option<String>, StoreError> {
        let object_key = self.object_key(&key.library_path());
        let Some(bytes) = self.store.get_object(&self.bucket, &object_key).await? else {
            return Ok(None);
        };
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| StoreError::Malformed {
                tier: SourceTier::ObjectStore,
                key: object_key,
                reason: e.to_string(),
            })
    }

    async fn list_agents(&self) -> Result<Vec<String>, StoreError> {
        let prefix = self.object_key("agent_cards/");
        let keys = self.store.list_objects(&self.bucket, &prefix).await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|name| name.strip_suffix(".agent.card.json"))
            .filter(|name| !name.is_empty() && !name.contains('/'))
            .map(str::to_string)
            .collect())
    }
}

/// The local library as a chain tier.
pub struct LibrarySource {
    library: LocalLibrary,
}

impl LibrarySource {
    pub fn new(library: LocalLibrary) -> Self {
        Self { library }
    }
}

#[async_trait]
impl ConfigSource for LibrarySource {
    fn tier(&self) -> SourceTier {
        SourceTier::Filesystem
    }

    async fn fetch(
        &self,
        key: &ConfigKey,
        _mode: ConsistencyMode,
    ) -> Result<Option<String>, StoreError> {
        self.library.read(&key.library_path()).await
    }

    async fn list_agents(&self) -> Result<Vec<String>, StoreError> {
        self.library.list_agents().await
    }
}

struct ChainEntry {
    source: Arc<dyn ConfigSource>,
    timeout: Duration,
}

fn tier_rank(tier: SourceTier) -> u8 {
    match tier {
        SourceTier::KeyValue => 0,
        SourceTier::ObjectStore => 1,
        SourceTier::Filesystem => 2,
    }
}

/// The ordered backing-store chain plus direct access to the primary
/// key/value store for index queries and writes.
pub struct BackingStoreChain {
    entries: Vec<ChainEntry>,
    primary: Option<Arc<dyn KeyValueStore>>,
    primary_timeout: Duration,
}

impl BackingStoreChain {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            primary: None,
            primary_timeout: Duration::from_secs(3),
        }
    }

    /// Add the key/value store. It becomes the primary store for type-index
    /// queries and writes as well as the first tier.
    pub fn with_key_value(mut self, store: Arc<dyn KeyValueStore>, timeout: Duration) -> Self {
        self.primary = Some(store.clone());
        self.primary_timeout = timeout;
        self.add(Arc::new(KeyValueSource::new(store)), timeout)
    }

    pub fn with_object_store(
        self,
        store: Arc<dyn ObjectStore>,
        bucket: &str,
        prefix: &str,
        timeout: Duration,
    ) -> Self {
        self.add(Arc::new(ObjectSource::new(store, bucket, prefix)), timeout)
    }

    pub fn with_library(self, library: LocalLibrary, timeout: Duration) -> Self {
        self.add(Arc::new(LibrarySource::new(library)), timeout)
    }

    /// Add any tier. Entries are kept in tier priority order regardless of
    /// insertion order.
    pub fn add(mut self, source: Arc<dyn ConfigSource>, timeout: Duration) -> Self {
        self.entries.push(ChainEntry { source, timeout });
        self.entries.sort_by_key(|e| tier_rank(e.source.tier()));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tiers(&self) -> Vec<SourceTier> {
        self.entries.iter().map(|e| e.source.tier()).collect()
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    /// Resolve `key` through the chain.
    ///
    /// `Ok(Some)` is the first non-empty answer. `Ok(None)` means every tier
    /// answered and none had it (malformed records count as absent). `Err`
    /// means nothing was found and at least one tier could not answer.
    pub async fn resolve(
        &self,
        key: &ConfigKey,
        mode: ConsistencyMode,
    ) -> Result<Option<ConfigEntry>, StoreError> {
        let mut outage: Option<StoreError> = None;

        for (i, entry) in self.entries.iter().enumerate() {
            let tier = entry.source.tier();
            debug!(
                key = %key,
                tier = %tier,
                attempt = i + 1,
                total = self.entries.len(),
                "Chain: trying tier"
            );

            let result = match tokio::time::timeout(entry.timeout, entry.source.fetch(key, mode))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(StoreError::Unavailable {
                    tier,
                    reason: format!("timed out after {}ms", entry.timeout.as_millis()),
                }),
            };

            match result {
                Ok(Some(content)) if content.trim().is_empty() => {
                    debug!(key = %key, tier = %tier, "Chain: empty content, trying next");
                }
                Ok(Some(content)) => {
                    if let Err(e) = check_format(key, &content) {
                        error!(key = %key, tier = %tier, error = %e, "Chain: malformed record, trying next");
                        continue;
                    }
                    info!(key = %key, tier = %tier, mode = ?mode, "Chain: resolved");
                    return Ok(Some(ConfigEntry::new(key.clone(), content, tier)));
                }
                Ok(None) | Err(StoreError::NotFound(_)) => {
                    debug!(key = %key, tier = %tier, "Chain: not found, trying next");
                }
                Err(e @ StoreError::Malformed { .. }) => {
                    error!(key = %key, tier = %tier, error = %e, "Chain: malformed record, trying next");
                }
                Err(e) => {
                    warn!(key = %key, tier = %tier, error = %e, "Chain: tier failed, trying next");
                    outage = Some(e);
                }
            }
        }

        match outage {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    /// All items of one type from the primary store's type index.
    /// Without a primary store the answer is an empty set.
    pub async fn query_by_type(&self, config_type: ConfigType) -> Result<Vec<StoreItem>, StoreError> {
        let Some(primary) = &self.primary else {
            return Ok(Vec::new());
        };
        self.with_primary_timeout(primary.query_by_type(config_type))
            .await
    }

    /// All items in one partition of the primary store.
    pub async fn query_partition(&self, pk: &str) -> Result<Vec<StoreItem>, StoreError> {
        let Some(primary) = &self.primary else {
            return Ok(Vec::new());
        };
        self.with_primary_timeout(primary.query_partition(pk)).await
    }

    /// Write through to the primary store.
    pub async fn put(&self, key: &ConfigKey, content: &str) -> Result<(), StoreError> {
        let primary = self.require_primary()?;
        let item = StoreItem::for_key(key, content).ok_or_else(|| StoreError::Malformed {
            tier: SourceTier::KeyValue,
            key: key.cache_key(),
            reason: format!("{} is not stored in the key/value tier", key.config_type),
        })?;
        self.with_primary_timeout(primary.put_item(item)).await
    }

    /// Delete from the primary store. Returns whether the item existed.
    pub async fn delete(&self, key: &ConfigKey) -> Result<bool, StoreError> {
        let primary = self.require_primary()?;
        let Some(pk) = key.partition_key() else {
            return Ok(false);
        };
        self.with_primary_timeout(primary.delete_item(&pk, &key.sort_key()))
            .await
    }

    /// Union of agent names listed by every tier, best-effort.
    pub async fn discover_agents(&self) -> Vec<String> {
        let mut agents = BTreeSet::new();
        for entry in &self.entries {
            let tier = entry.source.tier();
            match tokio::time::timeout(entry.timeout, entry.source.list_agents()).await {
                Ok(Ok(found)) => {
                    debug!(tier = %tier, count = found.len(), "Discovered agents");
                    agents.extend(found);
                }
                Ok(Err(e)) => warn!(tier = %tier, error = %e, "Agent discovery failed"),
                Err(_) => warn!(tier = %tier, "Agent discovery timed out"),
            }
        }
        agents.into_iter().collect()
    }

    fn require_primary(&self) -> Result<&Arc<dyn KeyValueStore>, StoreError> {
        self.primary.as_ref().ok_or_else(|| StoreError::Unavailable {
            tier: SourceTier::KeyValue,
            reason: "no key/value store configured".into(),
        })
    }

    async fn with_primary_timeout<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.primary_timeout, call)
            .await
            .unwrap_or_else(|_| {
                Err(StoreError::Unavailable {
                    tier: SourceTier::KeyValue,
                    reason: format!("timed out after {}ms", self.primary_timeout.as_millis()),
                })
            })
    }
}

impl Default for BackingStoreChain {
    fn default() -> Self {
        Self::new()
    }
}

/// JSON resource types must parse; instruction text is taken as-is.
fn check_format(key: &ConfigKey, content: &str) -> Result<(), serde_json::Error> {
    if key.config_type.is_json() {
        serde_json::from_str::<serde_json::Value>(content)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::{Fault, FaultTarget, InMemoryKvStore, InMemoryObjectStore};

    const TIMEOUT: Duration = Duration::from_millis(200);

    async fn kv_with(entries: &[(ConfigKey, &str)]) -> Arc<InMemoryKvStore> {
        let kv = Arc::new(InMemoryKvStore::new());
        for (key, content) in entries {
            kv.put_item(StoreItem::for_key(key, *content).unwrap())
                .await
                .unwrap();
        }
        kv
    }

    #[tokio::test]
    async fn first_tier_wins() {
        let key = ConfigKey::instruction("AgentX");
        let kv = kv_with(&[(key.clone(), "from kv")]).await;
        let objects = Arc::new(InMemoryObjectStore::new());
        objects
            .put_object("b", "configs/agent-instructions-library/AgentX.txt", "from s3")
            .await;

        let chain = BackingStoreChain::new()
            .with_object_store(objects.clone(), "b", "configs", TIMEOUT)
            .with_key_value(kv, TIMEOUT);
        assert_eq!(
            chain.tiers(),
            vec![SourceTier::KeyValue, SourceTier::ObjectStore]
        );

        let entry = chain.resolve(&key, ConsistencyMode::Relaxed).await.unwrap().unwrap();
        assert_eq!(entry.content, "from kv");
        assert_eq!(entry.source, SourceTier::KeyValue);
        assert_eq!(objects.calls(), 0);
    }

    #[tokio::test]
    async fn falls_through_on_absence_and_empty_content() {
        let key = ConfigKey::instruction("AgentX");
        let kv = kv_with(&[(key.clone(), "   ")]).await;
        let objects = Arc::new(InMemoryObjectStore::new());
        objects
            .put_object("b", "configs/agent-instructions-library/AgentX.txt", "from s3")
            .await;

        let chain = BackingStoreChain::new()
            .with_key_value(kv, TIMEOUT)
            .with_object_store(objects, "b", "configs", TIMEOUT);

        let entry = chain.resolve(&key, ConsistencyMode::Relaxed).await.unwrap().unwrap();
        assert_eq!(entry.content, "from s3");
        assert_eq!(entry.source, SourceTier::ObjectStore);
    }

    #[tokio::test]
    async fn all_tiers_absent_is_none() {
        let chain = BackingStoreChain::new()
            .with_key_value(Arc::new(InMemoryKvStore::new()), TIMEOUT)
            .with_object_store(Arc::new(InMemoryObjectStore::new()), "b", "configs", TIMEOUT);
        let found = chain
            .resolve(&ConfigKey::card("Nobody"), ConsistencyMode::Relaxed)
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn malformed_json_is_skipped() {
        let key = ConfigKey::card("AgentX");
        let kv = kv_with(&[(key.clone(), "{not json")]).await;
        let objects = Arc::new(InMemoryObjectStore::new());
        objects
            .put_object("b", "configs/agent_cards/AgentX.agent.card.json", r#"{"agent_name":"AgentX"}"#)
            .await;

        let chain = BackingStoreChain::new()
            .with_key_value(kv, TIMEOUT)
            .with_object_store(objects, "b", "configs", TIMEOUT);

        let entry = chain.resolve(&key, ConsistencyMode::Relaxed).await.unwrap().unwrap();
        assert_eq!(entry.source, SourceTier::ObjectStore);

        let chain = BackingStoreChain::new().with_key_value(kv_with(&[(key.clone(), "{")]).await, TIMEOUT);
        assert!(chain.resolve(&key, ConsistencyMode::Relaxed).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn timeout_falls_through_to_next_tier() {
        let key = ConfigKey::instruction("AgentX");
        let kv = kv_with(&[(key.clone(), "from kv")]).await;
        kv.set_fault(FaultTarget::All, Fault::Hang).await;
        let objects = Arc::new(InMemoryObjectStore::new());
        objects
            .put_object("b", "configs/agent-instructions-library/AgentX.txt", "from s3")
            .await;

        let chain = BackingStoreChain::new()
            .with_key_value(kv, Duration::from_millis(20))
            .with_object_store(objects, "b", "configs", TIMEOUT);

        let entry = chain.resolve(&key, ConsistencyMode::Strict).await.unwrap().unwrap();
        assert_eq!(entry.content, "from s3");
    }

    #[tokio::test]
    async fn outage_without_value_is_an_error() {
        let kv = Arc::new(InMemoryKvStore::new());
        kv.set_fault(FaultTarget::All, Fault::Unavailable).await;
        let chain = BackingStoreChain::new()
            .with_key_value(kv, TIMEOUT)
            .with_object_store(Arc::new(InMemoryObjectStore::new()), "b", "configs", TIMEOUT);

        let err = chain
            .resolve(&ConfigKey::instruction("AgentX"), ConsistencyMode::Relaxed)
            .await
            .unwrap_err();
        assert!(err.is_outage());
        assert_eq!(err.tier(), Some(SourceTier::KeyValue));
    }

    #[tokio::test]
    async fn strict_mode_requests_consistent_read() {
        let key = ConfigKey::instruction("AgentX");
        let kv = Arc::new(InMemoryKvStore::with_replication_lag());
        kv.put_item(StoreItem::for_key(&key, "Hello").unwrap()).await.unwrap();
        kv.put_item(StoreItem::for_key(&key, "Hello v2").unwrap()).await.unwrap();
        let chain = BackingStoreChain::new().with_key_value(kv, TIMEOUT);

        let relaxed = chain.resolve(&key, ConsistencyMode::Relaxed).await.unwrap().unwrap();
        let strict = chain.resolve(&key, ConsistencyMode::Strict).await.unwrap().unwrap();
        assert_eq!(relaxed.content, "Hello");
        assert_eq!(strict.content, "Hello v2");
    }

    #[tokio::test]
    async fn writes_without_primary_fail() {
        let chain = BackingStoreChain::new();
        let err = chain.put(&ConfigKey::instruction("A"), "x").await.unwrap_err();
        assert!(err.is_outage());
        assert!(chain.query_by_type(ConfigType::Card).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn generic_templates_cannot_be_written_to_kv() {
        let chain = BackingStoreChain::new().with_key_value(Arc::new(InMemoryKvStore::new()), TIMEOUT);
        let err = chain
            .put(&ConfigKey::generic_template("bar"), "{}")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
    }

    #[tokio::test]
    async fn discovery_unions_tiers_and_survives_failures() {
        let objects = Arc::new(InMemoryObjectStore::new());
        objects.put_object("b", "configs/agent_cards/B.agent.card.json", "{}").await;
        objects.put_object("b", "configs/agent_cards/A.agent.card.json", "{}").await;
        objects.put_object("b", "configs/agent_cards/readme.md", "x").await;

        let dir = tempfile::tempdir().unwrap();
        let lib_dir = dir.path().join("agent-instructions-library");
        tokio::fs::create_dir_all(&lib_dir).await.unwrap();
        tokio::fs::write(lib_dir.join("C.txt"), "c").await.unwrap();
        tokio::fs::write(lib_dir.join("A.txt"), "a").await.unwrap();

        let failing = Arc::new(InMemoryObjectStore::new());
        failing.set_fault(Some(Fault::Unavailable)).await;

        let chain = BackingStoreChain::new()
            .with_object_store(objects, "b", "configs", TIMEOUT)
            .with_library(LocalLibrary::new(dir.path()), TIMEOUT)
            .add(Arc::new(ObjectSource::new(failing, "b", "configs")), TIMEOUT);

        assert_eq!(chain.discover_agents().await, vec!["A", "B", "C"]);
    }
}
