//! In-memory stores for testing and local development.
//!
//! Both stores count every call and accept injected faults, so callers can
//! check "zero backing-store calls" and exercise outage handling.
//! [`InMemoryKvStore`] can also simulate replication lag: with lag enabled an
//! eventually-consistent read serves the previous version of an item until
//! [`InMemoryKvStore::settle`] is called, while a consistent read always
//! serves the latest write.

use async_trait::async_trait;
use adcp_core::config::{ConfigType, SourceTier};
use adcp_core::error::StoreError;
use adcp_core::store::{KeyValueStore, ObjectStore, StoreItem};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// What an injected fault does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail immediately with `Unavailable`
    Unavailable,
    /// Fail immediately with `TransientIo`
    Transient,
    /// Never answer (sleeps far longer than any sane timeout)
    Hang,
}

/// Which calls a fault applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FaultTarget {
    /// Every call
    All,
    /// Calls touching one partition key
    Partition(String),
    /// Secondary-index queries for one config type
    TypeIndex(ConfigType),
}

async fn trigger(fault: Fault, tier: SourceTier, what: &str) -> StoreError {
    match fault {
        Fault::Unavailable => StoreError::Unavailable {
            tier,
            reason: format!("injected outage for {what}"),
        },
        Fault::Transient => StoreError::TransientIo {
            tier,
            reason: format!("injected transient failure for {what}"),
        },
        Fault::Hang => {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            StoreError::Unavailable {
                tier,
                reason: format!("{what} never answered"),
            }
        }
    }
}

struct VersionedItem {
    current: StoreItem,
    previous: Option<StoreItem>,
}

/// A key/value store held in a `HashMap`.
pub struct InMemoryKvStore {
    items: RwLock<HashMap<(String, String), VersionedItem>>,
    faults: RwLock<HashMap<FaultTarget, Fault>>,
    replication_lag: AtomicBool,
    calls: AtomicUsize,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            faults: RwLock::new(HashMap::new()),
            replication_lag: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    /// A store whose eventually-consistent reads lag one write behind.
    pub fn with_replication_lag() -> Self {
        let store = Self::new();
        store.replication_lag.store(true, Ordering::SeqCst);
        store
    }

    /// Total calls of any kind since creation.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn set_fault(&self, target: FaultTarget, fault: Fault) {
        self.faults.write().await.insert(target, fault);
    }

    pub async fn clear_faults(&self) {
        self.faults.write().await.clear();
    }

    /// Let every replica catch up: eventual reads now see the latest write.
    pub async fn settle(&self) {
        for item in self.items.write().await.values_mut() {
            item.previous = None;
        }
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    async fn check(&self, targets: &[FaultTarget], what: &str) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fault = {
            let faults = self.faults.read().await;
            faults
                .get(&FaultTarget::All)
                .or_else(|| targets.iter().find_map(|t| faults.get(t)))
                .copied()
        };
        match fault {
            Some(fault) => Err(trigger(fault, SourceTier::KeyValue, what).await),
            None => Ok(()),
        }
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKvStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn get_item(
        &self,
        pk: &str,
        sk: &str,
        consistent: bool,
    ) -> Result<Option<StoreItem>, StoreError> {
        self.check(&[FaultTarget::Partition(pk.to_string())], pk)
            .await?;
        let items = self.items.read().await;
        let lagging = !consistent && self.replication_lag.load(Ordering::SeqCst);
        Ok(items
            .get(&(pk.to_string(), sk.to_string()))
            .map(|v| match (&v.previous, lagging) {
                (Some(previous), true) => previous.clone(),
                _ => v.current.clone(),
            }))
    }

    async fn put_item(&self, item: StoreItem) -> Result<(), StoreError> {
        self.check(&[FaultTarget::Partition(item.pk.clone())], &item.pk)
            .await?;
        let mut items = self.items.write().await;
        let key = (item.pk.clone(), item.sk.clone());
        let previous = items.remove(&key).map(|v| v.current);
        items.insert(
            key,
            VersionedItem {
                current: item,
                previous,
            },
        );
        Ok(())
    }

    async fn delete_item(&self, pk: &str, sk: &str) -> Result<bool, StoreError> {
        self.check(&[FaultTarget::Partition(pk.to_string())], pk)
            .await?;
        Ok(self
            .items
            .write()
            .await
            .remove(&(pk.to_string(), sk.to_string()))
            .is_some())
    }

    async fn query_partition(&self, pk: &str) -> Result<Vec<StoreItem>, StoreError> {
        self.check(&[FaultTarget::Partition(pk.to_string())], pk)
            .await?;
        let items = self.items.read().await;
        let mut found: Vec<StoreItem> = items
            .values()
            .filter(|v| v.current.pk == pk)
            .map(|v| v.current.clone())
            .collect();
        found.sort_by(|a, b| a.sk.cmp(&b.sk));
        Ok(found)
    }

    async fn query_by_type(&self, config_type: ConfigType) -> Result<Vec<StoreItem>, StoreError> {
        self.check(&[FaultTarget::TypeIndex(config_type)], config_type.as_str())
            .await?;
        let items = self.items.read().await;
        let mut found: Vec<StoreItem> = items
            .values()
            .filter(|v| v.current.config_type == config_type)
            .map(|v| v.current.clone())
            .collect();
        found.sort_by(|a, b| (&a.pk, &a.sk).cmp(&(&b.pk, &b.sk)));
        Ok(found)
    }
}

/// An object store held in a `HashMap` keyed by `(bucket, key)`.
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<(String, String), Vec<u8>>>,
    fault: RwLock<Option<Fault>>,
    calls: AtomicUsize,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            fault: RwLock::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub async fn put_object(&self, bucket: &str, key: &str, body: impl Into<Vec<u8>>) {
        self.objects
            .write()
            .await
            .insert((bucket.to_string(), key.to_string()), body.into());
    }

    pub async fn set_fault(&self, fault: Option<Fault>) {
        *self.fault.write().await = fault;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn check(&self, what: &str) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fault = *self.fault.read().await;
        match fault {
            Some(fault) => Err(trigger(fault, SourceTier::ObjectStore, what).await),
            None => Ok(()),
        }
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check(key).await?;
        Ok(self
            .objects
            .read()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .cloned())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.check(prefix).await?;
        let mut keys: Vec<String> = self
            .objects
            .read()
            .await
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adcp_core::config::ConfigKey;

    fn item(agent: &str, content: &str) -> StoreItem {
        StoreItem::for_key(&ConfigKey::instruction(agent), content).unwrap()
    }

    #[tokio::test]
    async fn put_and_get() {
        let store = InMemoryKvStore::new();
        store.put_item(item("AgentX", "Hello")).await.unwrap();

        let found = store
            .get_item("INSTRUCTION#AgentX", "v1", false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.content, "Hello");
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test]
    async fn lagging_reads_serve_previous_version_until_settled() {
        let store = InMemoryKvStore::with_replication_lag();
        store.put_item(item("AgentX", "Hello")).await.unwrap();
        store.put_item(item("AgentX", "Hello v2")).await.unwrap();

        let eventual = store.get_item("INSTRUCTION#AgentX", "v1", false).await.unwrap();
        let strong = store.get_item("INSTRUCTION#AgentX", "v1", true).await.unwrap();
        assert_eq!(eventual.unwrap().content, "Hello");
        assert_eq!(strong.unwrap().content, "Hello v2");

        store.settle().await;
        let eventual = store.get_item("INSTRUCTION#AgentX", "v1", false).await.unwrap();
        assert_eq!(eventual.unwrap().content, "Hello v2");
    }

    #[tokio::test]
    async fn query_by_type_uses_index_attribute() {
        let store = InMemoryKvStore::new();
        store.put_item(item("A", "a")).await.unwrap();
        store.put_item(item("B", "b")).await.unwrap();
        store
            .put_item(StoreItem::for_key(&ConfigKey::card("A"), "{}").unwrap())
            .await
            .unwrap();

        let instructions = store.query_by_type(ConfigType::Instruction).await.unwrap();
        assert_eq!(instructions.len(), 2);
        let cards = store.query_by_type(ConfigType::Card).await.unwrap();
        assert_eq!(cards.len(), 1);
    }

    #[tokio::test]
    async fn partition_fault_only_hits_that_partition() {
        let store = InMemoryKvStore::new();
        store.put_item(item("A", "a")).await.unwrap();
        store
            .set_fault(
                FaultTarget::Partition("INSTRUCTION#C".into()),
                Fault::Unavailable,
            )
            .await;

        assert!(store.get_item("INSTRUCTION#A", "v1", true).await.is_ok());
        let err = store
            .get_item("INSTRUCTION#C", "v1", true)
            .await
            .unwrap_err();
        assert!(err.is_outage());

        store.clear_faults().await;
        assert!(store.get_item("INSTRUCTION#C", "v1", true).await.is_ok());
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = InMemoryKvStore::new();
        store.put_item(item("A", "a")).await.unwrap();
        assert!(store.delete_item("INSTRUCTION#A", "v1").await.unwrap());
        assert!(!store.delete_item("INSTRUCTION#A", "v1").await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn object_store_lists_by_prefix() {
        let store = InMemoryObjectStore::new();
        store.put_object("bucket", "configs/agent_cards/A.agent.card.json", "{}").await;
        store.put_object("bucket", "configs/global_configuration.json", "{}").await;
        store.put_object("other", "configs/agent_cards/B.agent.card.json", "{}").await;

        let keys = store.list_objects("bucket", "configs/agent_cards/").await.unwrap();
        assert_eq!(keys, vec!["configs/agent_cards/A.agent.card.json".to_string()]);
        assert!(store.get_object("bucket", "missing").await.unwrap().is_none());
    }
}
