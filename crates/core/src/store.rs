//! Backing store traits: the remote, persistent data sources consulted on a
//! cache miss.
//!
//! Implementations: SQLite and in-memory key/value stores, directory-backed
//! and in-memory object stores (see `adcp-stores`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ConfigKey, ConfigType};
use crate::error::StoreError;

/// One record in the key/value store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreItem {
    /// Partition key (e.g. `INSTRUCTION#AgentX`)
    pub pk: String,

    /// Sort key (`v1`, or a template id)
    pub sk: String,

    /// Secondary index attribute
    pub config_type: ConfigType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,

    pub content: String,

    pub updated_at: DateTime<Utc>,
}

impl StoreItem {
    /// Build the record for `key`. Returns `None` for resource types the
    /// key/value store does not hold.
    pub fn for_key(key: &ConfigKey, content: impl Into<String>) -> Option<Self> {
        Some(Self {
            pk: key.partition_key()?,
            sk: key.sort_key(),
            config_type: key.config_type,
            agent_name: key.agent().map(str::to_string),
            template_id: key.item.clone(),
            content: content.into(),
            updated_at: Utc::now(),
        })
    }

    /// Reconstruct the resource address from the stored attributes.
    pub fn config_key(&self) -> ConfigKey {
        match self.config_type {
            ConfigType::GlobalConfig => ConfigKey::global(),
            ConfigType::VisualizationTemplate => ConfigKey::visualization_template(
                self.agent_name.as_deref().unwrap_or_default(),
                self.template_id.as_deref().unwrap_or(&self.sk),
            ),
            t => ConfigKey::new(
                t,
                self.agent_name
                    .clone()
                    .unwrap_or_else(|| agent_from_partition(&self.pk)),
            ),
        }
    }
}

fn agent_from_partition(pk: &str) -> String {
    pk.split_once('#')
        .map(|(_, agent)| agent.to_string())
        .unwrap_or_default()
}

/// A key/value store addressed by `(partition key, sort key)` with a
/// secondary index on `config_type`.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// The store name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    /// Read one item. `consistent` requests the strongest read the store
    /// offers; stores without replicas may ignore it.
    async fn get_item(
        &self,
        pk: &str,
        sk: &str,
        consistent: bool,
    ) -> Result<Option<StoreItem>, StoreError>;

    /// Insert or replace an item.
    async fn put_item(&self, item: StoreItem) -> Result<(), StoreError>;

    /// Delete an item. Returns whether it existed.
    async fn delete_item(&self, pk: &str, sk: &str) -> Result<bool, StoreError>;

    /// All items in one partition.
    async fn query_partition(&self, pk: &str) -> Result<Vec<StoreItem>, StoreError>;

    /// All items of one config type (secondary index query).
    async fn query_by_type(&self, config_type: ConfigType) -> Result<Vec<StoreItem>, StoreError>;
}

/// A blob store addressed by `(bucket, key)`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch an object. `Ok(None)` means the key does not exist.
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// List object keys starting with `prefix`.
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError>;
}
